/// Timer-driven event dispatcher.
///
/// A [`Dispatcher`] owns one worker thread that runs a [`Handler`].  Events
/// posted through a [`Notifier`] are handled strictly one at a time, in the
/// order they were posted.  While handling an
/// event the handler receives a [`Timers`] context through which it can arm
/// one-shot or recurring deadlines; their callbacks run on the same worker,
/// between event invocations and never inside one.
///
/// Cancelled timers are only tombstoned and are swept on the next scheduling
/// pass, so a callback may freely cancel any timer (including its own).
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

/// Recurring timers never reschedule tighter than this.
const MIN_RECURRING_INTERVAL: Duration = Duration::from_millis(1);
/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// `from + timeout`, pushed out to [`FAR_FUTURE`] instead of overflowing.
fn deadline_after(from: Instant, timeout: Duration) -> Instant {
    from.checked_add(timeout)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Domain logic driven by a [`Dispatcher`].
///
/// `process_event` is always called on the dispatcher's worker thread, once per
/// dequeued event.  Returned errors are logged and the worker keeps running.
pub trait Handler: Send + Sized + 'static {
    type Event: Send + fmt::Debug + 'static;

    fn process_event(&mut self, event: Self::Event, timers: &mut Timers<Self>) -> Result<()>;
}

/// Deadline callback.  Receives the handler and the timer context so it can
/// re-arm or cancel timers exactly like an event handler can.
pub type TimerCallback<H> = Box<dyn FnMut(&mut H, &mut Timers<H>) -> Result<()> + Send>;

/// Opaque reference to a timer armed through [`Timers::set_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

struct TimerEntry<H> {
    deadline: Instant,
    interval: Duration,
    recurring: bool,
    invalidated: bool,
    /// `None` only while the callback is executing.
    callback: Option<TimerCallback<H>>,
}

/// Timer set owned by a dispatcher worker.
///
/// Entries are keyed by a monotonically increasing handle, so handles stay
/// valid (and never get reused) while other entries come and go.
pub struct Timers<H> {
    entries: BTreeMap<TimerHandle, TimerEntry<H>>,
    next_id: u64,
}

impl<H: Handler> Timers<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Arms a timer that fires `timeout` from now.  Recurring timers keep firing
    /// every `timeout` after that until cancelled.
    pub fn set_timer<F>(&mut self, timeout: Duration, recurring: bool, callback: F) -> TimerHandle
    where
        F: FnMut(&mut H, &mut Timers<H>) -> Result<()> + Send + 'static,
    {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        let interval = if recurring {
            timeout.max(MIN_RECURRING_INTERVAL)
        } else {
            timeout
        };
        self.entries.insert(
            handle,
            TimerEntry {
                deadline: deadline_after(Instant::now(), timeout),
                interval,
                recurring,
                invalidated: false,
                callback: Some(Box::new(callback)),
            },
        );
        tracing::trace!(?handle, ?timeout, recurring, "timer armed");
        handle
    }

    /// Marks the timer invalidated.  Unknown or already-fired handles are ignored.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.invalidated = true;
            tracing::trace!(?handle, "timer cancelled");
        }
    }

    /// Returns true while the timer is armed and not cancelled.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.entries.get(&handle).is_some_and(|e| !e.invalidated)
    }

    /// Number of armed, non-cancelled timers.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.entries.values().filter(|e| !e.invalidated).count()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| !e.invalidated)
            .map(|e| e.deadline)
            .min()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    /// Sweeps tombstones, then runs every timer whose deadline has passed, in
    /// deadline order.  Timers armed by these callbacks wait for the next pass.
    fn fire_expired(&mut self, handler: &mut H) {
        self.entries.retain(|_, e| !e.invalidated);

        let now = Instant::now();
        let mut due: Vec<(Instant, TimerHandle)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(h, e)| (e.deadline, *h))
            .collect();
        due.sort();

        for (_, handle) in due {
            self.run(handle, handler);
        }
    }

    /// Runs one timer's callback and then reschedules or removes it.
    /// Returns false if the handle was not live.
    fn run(&mut self, handle: TimerHandle, handler: &mut H) -> bool {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return false;
        };
        if entry.invalidated {
            self.entries.remove(&handle);
            return false;
        }
        let Some(mut callback) = entry.callback.take() else {
            return false;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut *handler, &mut *self)));
        report(outcome, format_args!("timer {handle:?}"));

        match self.entries.get_mut(&handle) {
            Some(entry) if entry.recurring && !entry.invalidated => {
                entry.deadline = deadline_after(entry.deadline, entry.interval);
                entry.callback = Some(callback);
            }
            _ => {
                self.entries.remove(&handle);
            }
        }
        true
    }

    /// Fires a timer immediately regardless of its deadline.
    #[cfg(test)]
    pub(crate) fn fire(&mut self, handle: TimerHandle, handler: &mut H) -> bool {
        self.run(handle, handler)
    }

    #[cfg(test)]
    pub(crate) fn interval_of(&self, handle: TimerHandle) -> Option<(Duration, bool)> {
        self.entries
            .get(&handle)
            .filter(|e| !e.invalidated)
            .map(|e| (e.interval, e.recurring))
    }
}

fn report(outcome: thread::Result<Result<()>>, what: fmt::Arguments<'_>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("{what} failed: {e:#}"),
        Err(_) => tracing::error!("{what} panicked; continuing"),
    }
}

// ── Event queue ───────────────────────────────────────────────────────────────

struct Queue<E> {
    events: VecDeque<E>,
    /// False once `stop` has been requested; new events are dropped.
    accepting: bool,
    /// Tells the worker to exit at its next wake-up.
    stop: bool,
}

struct Shared<E> {
    queue: Mutex<Queue<E>>,
    wake: Condvar,
}

impl<E> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, Queue<E>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable, thread-safe handle for posting events into a dispatcher.
pub struct Notifier<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for Notifier<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> fmt::Debug for Notifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Notifier")
    }
}

impl<E: fmt::Debug> Notifier<E> {
    /// Enqueues `event` and wakes the worker.  Safe from any thread, including
    /// the worker itself.
    pub fn notify(&self, event: E) {
        let mut queue = self.shared.lock();
        if !queue.accepting {
            tracing::trace!(?event, "dispatcher stopped; dropping event");
            return;
        }
        queue.events.push_back(event);
        drop(queue);
        self.shared.wake.notify_one();
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

enum Slot<H> {
    Idle(H),
    Running(JoinHandle<H>),
    /// The handler was lost to a failed spawn or a dead worker.
    Lost,
}

/// Runs a [`Handler`] on a dedicated worker thread.
pub struct Dispatcher<H: Handler> {
    name: String,
    shared: Arc<Shared<H::Event>>,
    slot: Mutex<Slot<H>>,
}

impl<H: Handler> Dispatcher<H> {
    /// Creates a stopped dispatcher.  Events posted before [`start`](Self::start)
    /// are queued and handled once the worker runs.
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    events: VecDeque::new(),
                    accepting: true,
                    stop: false,
                }),
                wake: Condvar::new(),
            }),
            slot: Mutex::new(Slot::Idle(handler)),
        }
    }

    pub fn notifier(&self) -> Notifier<H::Event> {
        Notifier {
            shared: Arc::clone(&self.shared),
        }
    }

    #[cfg(test)]
    pub(crate) fn notify(&self, event: H::Event) {
        self.notifier().notify(event);
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        matches!(*self.lock_slot(), Slot::Running(_))
    }

    /// Spawns the worker.  Does nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.lock_slot();
        let handler = match mem::replace(&mut *slot, Slot::Lost) {
            Slot::Idle(handler) => handler,
            running @ Slot::Running(_) => {
                *slot = running;
                return Ok(());
            }
            Slot::Lost => bail!("dispatcher '{}' has no handler left to run", self.name),
        };

        {
            let mut queue = self.shared.lock();
            queue.accepting = true;
            queue.stop = false;
        }

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_worker(shared, handler))
            .with_context(|| format!("Failed to spawn dispatcher thread '{}'", self.name))?;
        *slot = Slot::Running(worker);
        tracing::debug!(dispatcher = %self.name, "started");
        Ok(())
    }

    /// Signals the worker to exit, joins it, and discards queued events and
    /// pending timers.  Idempotent.
    ///
    /// When called from the worker thread itself the join is deferred to the
    /// next `stop` from another thread.
    pub fn stop(&self) {
        let mut slot = self.lock_slot();
        {
            let mut queue = self.shared.lock();
            queue.accepting = false;
            queue.stop = true;
            queue.events.clear();
        }
        self.shared.wake.notify_all();

        let worker = match mem::replace(&mut *slot, Slot::Lost) {
            Slot::Running(worker) => worker,
            other => {
                *slot = other;
                return;
            }
        };
        if worker.thread().id() == thread::current().id() {
            *slot = Slot::Running(worker);
            return;
        }
        match worker.join() {
            Ok(handler) => {
                *slot = Slot::Idle(handler);
                tracing::debug!(dispatcher = %self.name, "stopped");
            }
            Err(_) => tracing::error!(dispatcher = %self.name, "worker thread died"),
        }
    }

    /// Stops the dispatcher and hands back its handler.
    #[cfg(test)]
    pub(crate) fn into_handler(self) -> Option<H> {
        self.stop();
        let mut slot = self.lock_slot();
        match mem::replace(&mut *slot, Slot::Lost) {
            Slot::Idle(handler) => Some(handler),
            _ => None,
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot<H>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: Handler> Drop for Dispatcher<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<H: Handler>(shared: Arc<Shared<H::Event>>, mut handler: H) -> H {
    let mut timers = Timers::new();

    loop {
        let deadline = timers.next_deadline();
        let mut queue = shared.lock();

        while queue.events.is_empty() && !queue.stop {
            match deadline {
                None => {
                    queue = shared.wake.wait(queue).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        break;
                    }
                    queue = match shared.wake.wait_timeout(queue, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }

        // The lock is released while each handler runs so that handlers (and
        // other threads) can post new events without deadlocking.
        while !queue.stop {
            let Some(event) = queue.events.pop_front() else {
                break;
            };
            drop(queue);
            dispatch(&mut handler, event, &mut timers);
            queue = shared.lock();
        }

        if queue.stop {
            break;
        }
        drop(queue);

        timers.fire_expired(&mut handler);
    }

    timers.clear();
    handler
}

fn dispatch<H: Handler>(handler: &mut H, event: H::Event, timers: &mut Timers<H>) {
    let label = format!("{event:?}");
    tracing::trace!(event = %label, "dispatching");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.process_event(event, timers)));
    report(outcome, format_args!("handler for {label}"));
}

// ── Tests ─────────────────────────────────────────────────────────────────────
