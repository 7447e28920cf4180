//! Real-time activity monitor.
//!
//! Opens a kernel trace session, enables the process and registry providers,
//! and pumps delivered records through a [`Matcher`] on a dedicated consumer
//! thread.  Matches are handed to a [`MonitorCallback`], which must only post
//! them onward and return.
//!
//! Lifecycle: Idle → SessionOpen → ProvidersEnabled → Consuming → Closed.
//! Any failure during [`Monitor::start`] runs the same teardown as
//! [`Monitor::stop`], so a half-built session never leaks.
pub mod decode;
#[cfg(windows)]
mod etw;
pub mod matcher;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};

pub use decode::{Guid, RecordHeader};
pub use matcher::{MatchConfig, Matcher, MonitorEvent};

pub const SESSION_NAME: &str = "CouchmodeActivity";

/// A kernel provider and the keywords we enable it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provider {
    pub name: &'static str,
    pub guid: Guid,
    pub keywords: u64,
}

/// Process start/stop and image load.
pub const PROCESS: Provider = Provider {
    name: "Microsoft-Windows-Kernel-Process",
    guid: matcher::PROCESS_PROVIDER,
    keywords: 0x10 | 0x40,
};

/// Registry value queries.
pub const REGISTRY: Provider = Provider {
    name: "Microsoft-Windows-Kernel-Registry",
    guid: matcher::REGISTRY_PROVIDER,
    keywords: 0,
};

pub const PROVIDERS: [Provider; 2] = [PROCESS, REGISTRY];

/// Receives every record delivered to the consumer.
pub type RecordSink = Box<dyn FnMut(&RecordHeader, &[u8]) + Send>;

/// Receives monitor notifications on the consumer thread.
pub type MonitorCallback = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

pub fn new_callback<F>(f: F) -> MonitorCallback
where
    F: Fn(MonitorEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Session control for a trace facility.
pub trait TraceBackend: Send {
    /// Creates the named session, replacing a stale one with the same name.
    fn open_session(&mut self, name: &str) -> Result<()>;

    fn enable_provider(&mut self, provider: &Provider) -> Result<()>;

    /// Best effort; failures are logged by the backend.
    fn disable_provider(&mut self, provider: &Provider);

    /// Opens a real-time consumer for the session.  The returned pump is run on
    /// the consumer thread.
    fn open_consumer(&mut self, name: &str) -> Result<(Box<dyn TracePump>, ConsumerHandle)>;

    /// Stops the session.  This is what unblocks a running pump.
    fn stop_session(&mut self);

    /// Releases the session's resources.
    fn close(&mut self);
}

/// Blocking record pump for one consumer.
pub trait TracePump: Send {
    /// Delivers records to `sink` until the session stops.  Returns an error
    /// only if delivery ended for any other reason.
    fn run(self: Box<Self>, sink: RecordSink) -> Result<()>;
}

/// Identifies the running consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    SessionOpen,
    ProvidersEnabled,
    Consuming,
    Closed,
}

pub struct Monitor {
    backend: Box<dyn TraceBackend>,
    config: MatchConfig,
    registry_gate: Arc<AtomicBool>,
    shell_pid: Option<u32>,
    state: MonitorState,
    consumer: Option<(ConsumerHandle, JoinHandle<()>)>,
}

impl Monitor {
    pub fn new(backend: Box<dyn TraceBackend>, config: MatchConfig) -> Self {
        Self {
            backend,
            config,
            registry_gate: Arc::new(AtomicBool::new(false)),
            shell_pid: None,
            state: MonitorState::Idle,
            consumer: None,
        }
    }

    /// Seeds the shell process id for a shell that started before the monitor.
    pub fn with_shell_pid(mut self, pid: Option<u32>) -> Self {
        self.shell_pid = pid;
        self
    }

    /// Flag that lets registry matches through.  Closed until someone asks for
    /// extra monitoring.
    pub fn registry_gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.registry_gate)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> MonitorState {
        self.state
    }

    /// Builds the session and starts consuming.  While already consuming,
    /// returns the existing consumer handle.
    pub fn start(&mut self, callback: MonitorCallback) -> Result<ConsumerHandle> {
        if let (MonitorState::Consuming, Some((handle, _))) = (self.state, &self.consumer) {
            return Ok(*handle);
        }
        match self.try_start(callback) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::error!("Monitor start failed: {e:#}");
                self.teardown();
                Err(e)
            }
        }
    }

    fn try_start(&mut self, callback: MonitorCallback) -> Result<ConsumerHandle> {
        self.backend.open_session(SESSION_NAME)?;
        self.state = MonitorState::SessionOpen;

        for provider in &PROVIDERS {
            self.backend
                .enable_provider(provider)
                .with_context(|| format!("Failed to enable {}", provider.name))?;
        }
        self.state = MonitorState::ProvidersEnabled;

        let (pump, handle) = self.backend.open_consumer(SESSION_NAME)?;

        let mut matcher = Matcher::new(self.config.clone(), self.registry_gate())
            .with_shell_pid(self.shell_pid);
        let on_match = Arc::clone(&callback);
        let sink: RecordSink = Box::new(move |header, data| {
            if let Some(event) = matcher.on_record(header, data, Instant::now()) {
                on_match(event);
            }
        });

        let consumer = thread::Builder::new()
            .name("trace-consumer".into())
            .spawn(move || match pump.run(sink) {
                Ok(()) => tracing::debug!("Trace consumer finished"),
                Err(e) => {
                    tracing::error!("Trace consumer failed: {e:#}");
                    callback(MonitorEvent::Failed(format!("{e:#}")));
                }
            })
            .context("Failed to spawn trace consumer thread")?;

        self.consumer = Some((handle, consumer));
        self.state = MonitorState::Consuming;
        tracing::info!(session = SESSION_NAME, ?handle, "Monitor consuming");
        Ok(handle)
    }

    /// Tears the session down and waits for the consumer thread to exit.
    pub fn stop(&mut self) {
        if let Some(consumer) = self.stop_async() {
            if consumer.join().is_err() {
                tracing::error!("Trace consumer thread panicked");
            }
        }
    }

    /// Tears the session down without waiting.  The returned handle joins the
    /// consumer thread, which exits once the pump notices the stopped session.
    pub fn stop_async(&mut self) -> Option<JoinHandle<()>> {
        if matches!(self.state, MonitorState::Idle | MonitorState::Closed) {
            return None;
        }
        self.teardown();
        self.consumer.take().map(|(_, consumer)| consumer)
    }

    fn teardown(&mut self) {
        if self.state == MonitorState::Idle {
            return;
        }
        for provider in PROVIDERS.iter().rev() {
            self.backend.disable_provider(provider);
        }
        self.backend.stop_session();
        self.backend.close();
        self.state = MonitorState::Closed;
        tracing::info!("Monitor stopped");
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Platform trace facility.
pub fn system_backend() -> Box<dyn TraceBackend> {
    #[cfg(windows)]
    {
        Box::new(etw::EtwBackend::default())
    }
    #[cfg(not(windows))]
    {
        Box::new(Unsupported)
    }
}

#[cfg(not(windows))]
struct Unsupported;

#[cfg(not(windows))]
impl TraceBackend for Unsupported {
    fn open_session(&mut self, _name: &str) -> Result<()> {
        anyhow::bail!("Kernel activity tracing requires Windows")
    }

    fn enable_provider(&mut self, _provider: &Provider) -> Result<()> {
        anyhow::bail!("Kernel activity tracing requires Windows")
    }

    fn disable_provider(&mut self, _provider: &Provider) {}

    fn open_consumer(&mut self, _name: &str) -> Result<(Box<dyn TracePump>, ConsumerHandle)> {
        anyhow::bail!("Kernel activity tracing requires Windows")
    }

    fn stop_session(&mut self) {}

    fn close(&mut self) {}
}

// ── Tests ─────────────────────────────────────────────────────────────────────
