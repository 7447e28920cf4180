/// Privileged service state machine.
///
/// Relays monitor notifications to the foreground process and carries out the
/// requests only the privileged side can: keeping the target process down and
/// switching registry monitoring on.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tokio::sync::watch;

use crate::channel::{ChannelEvent, Destination, Message, MessageChannel, Subscription};
use crate::config::{self, SharedConfig};
use crate::dispatcher::{Handler, Timers};
use crate::event::ServiceEvent;
use crate::process::ProcessUtils;

/// One-shot subscriptions registered by foreground instances.  Filled by the
/// message listener, drained by the machine.
pub type Subscriptions = Arc<Mutex<Vec<Subscription>>>;

/// Records `subscription` unless an identical one is already waiting.
pub fn subscribe(subscriptions: &Subscriptions, subscription: Subscription) {
    let mut list = subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
    if !list.contains(&subscription) {
        tracing::debug!(dest = %subscription.target, event = ?subscription.event, "Subscribed");
        list.push(subscription);
    }
}

pub struct ServiceMachine {
    config: SharedConfig,
    processes: Arc<dyn ProcessUtils>,
    channel: Arc<dyn MessageChannel>,
    /// Where the foreground role listens.
    app: Destination,
    registry_gate: Arc<AtomicBool>,
    subscriptions: Subscriptions,
    suppressing: bool,
    shutdown: Option<watch::Sender<bool>>,
}

impl Handler for ServiceMachine {
    type Event = ServiceEvent;

    fn process_event(&mut self, event: ServiceEvent, _timers: &mut Timers<Self>) -> Result<()> {
        tracing::debug!(?event, suppressing = self.suppressing, "service event");
        match event {
            ServiceEvent::TargetProcessDetected => {
                if self.suppressing {
                    self.kill_targets();
                }
                self.relay(ChannelEvent::TargetProcessDetected);
            }
            ServiceEvent::ConfigValueTouched => self.relay(ChannelEvent::ConfigValueTouched),
            ServiceEvent::DenyTarget => {
                self.suppressing = true;
                self.kill_targets();
            }
            ServiceEvent::AllowTarget => self.suppressing = false,
            ServiceEvent::BeginMonitoring => {
                if !self.registry_gate.swap(true, Ordering::SeqCst) {
                    tracing::info!("Registry monitoring enabled");
                }
            }
            ServiceEvent::MonitorFailed => {
                self.notify_subscribers(ChannelEvent::MonitorFailed);
                self.exit();
            }
            ServiceEvent::Exit => self.exit(),
        }
        Ok(())
    }
}

impl ServiceMachine {
    pub fn new(
        config: SharedConfig,
        processes: Arc<dyn ProcessUtils>,
        channel: Arc<dyn MessageChannel>,
        app: Destination,
        registry_gate: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            processes,
            channel,
            app,
            registry_gate,
            subscriptions: Arc::default(),
            suppressing: false,
            shutdown: None,
        }
    }

    /// Set to `true` once the machine has decided to exit.
    pub fn with_shutdown(mut self, tx: watch::Sender<bool>) -> Self {
        self.shutdown = Some(tx);
        self
    }

    /// Shared list for the message listener to add to.
    pub fn subscriptions(&self) -> Subscriptions {
        Arc::clone(&self.subscriptions)
    }

    #[cfg(test)]
    pub(crate) fn is_suppressing(&self) -> bool {
        self.suppressing
    }

    fn kill_targets(&self) {
        let target = config::snapshot(&self.config).target;
        for name in target.names() {
            match self.processes.kill(name) {
                Ok(0) => {}
                Ok(killed) => tracing::info!(name, killed, "Target suppressed"),
                Err(e) => tracing::warn!("{e:#}"),
            }
        }
    }

    fn relay(&self, event: ChannelEvent) {
        self.post(&self.app, event);
    }

    /// Tells every subscriber of `event` once and forgets them.  The foreground
    /// instance hears about it even if it never subscribed.
    fn notify_subscribers(&self, event: ChannelEvent) {
        let due: Vec<Subscription> = {
            let mut list = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            let (due, keep) = list.drain(..).partition(|s| s.event == event);
            *list = keep;
            due
        };
        for subscription in &due {
            self.post(&subscription.target, event);
        }
        if !due.iter().any(|s| s.target == self.app) {
            self.relay(event);
        }
    }

    fn exit(&mut self) {
        self.registry_gate.store(false, Ordering::SeqCst);
        self.suppressing = false;
        if let Some(tx) = &self.shutdown {
            tx.send_replace(true);
        }
        tracing::info!("Service exiting");
    }

    fn post(&self, dest: &Destination, event: ChannelEvent) {
        if let Err(e) = self.channel.post(dest, &Message::event(event)) {
            tracing::warn!(?event, %dest, "Failed to deliver: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::config::Config;
    use crate::process::WindowHandle;
    use std::collections::HashSet;

    #[derive(Default)]
    struct KillLog(Mutex<Vec<String>>);

    impl ProcessUtils for KillLog {
        fn find_all_by_name(&self, _name: &str) -> HashSet<u32> {
            HashSet::new()
        }

        fn get_window(&self, _pids: &HashSet<u32>, _title: &str) -> Option<WindowHandle> {
            None
        }

        fn start(&self, _command: &str, _args: &[String]) -> Option<u32> {
            None
        }

        fn kill(&self, name: &str) -> Result<usize> {
            self.0.lock().unwrap().push(name.to_string());
            Ok(1)
        }

        fn focus(&self, _window: WindowHandle) -> bool {
            false
        }
    }

    struct Rig {
        machine: ServiceMachine,
        timers: Timers<ServiceMachine>,
        kills: Arc<KillLog>,
        channel: Arc<LocalChannel>,
        gate: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
    }

    impl Rig {
        fn new() -> Self {
            let mut cfg = Config::default();
            cfg.target.process_names = "XboxPcApp.exe;GameBar.exe".to_string();
            let kills = Arc::new(KillLog::default());
            let channel = Arc::new(LocalChannel::new());
            let gate = Arc::new(AtomicBool::new(false));
            let (tx, shutdown) = watch::channel(false);
            let machine = ServiceMachine::new(
                config::shared(cfg),
                kills.clone(),
                channel.clone(),
                app(),
                Arc::clone(&gate),
            )
            .with_shutdown(tx);
            Self {
                machine,
                timers: Timers::new(),
                kills,
                channel,
                gate,
                shutdown,
            }
        }

        fn send(&mut self, event: ServiceEvent) {
            self.machine.process_event(event, &mut self.timers).unwrap();
        }

        fn kills(&self) -> usize {
            self.kills.0.lock().unwrap().len()
        }
    }

    fn app() -> Destination {
        Destination::new("app")
    }

    #[test]
    fn monitor_events_are_relayed_unmodified() {
        let mut rig = Rig::new();
        rig.send(ServiceEvent::TargetProcessDetected);
        rig.send(ServiceEvent::ConfigValueTouched);
        assert_eq!(
            rig.channel.events_to(&app()),
            vec![ChannelEvent::TargetProcessDetected, ChannelEvent::ConfigValueTouched]
        );
        assert_eq!(rig.kills(), 0);
    }

    #[test]
    fn deny_kills_every_alternative_and_keeps_suppressing() {
        let mut rig = Rig::new();
        rig.send(ServiceEvent::DenyTarget);
        assert!(rig.machine.is_suppressing());
        assert_eq!(*rig.kills.0.lock().unwrap(), vec!["XboxPcApp.exe", "GameBar.exe"]);

        rig.send(ServiceEvent::TargetProcessDetected);
        assert_eq!(rig.kills(), 4);
        assert_eq!(
            rig.channel.events_to(&app()),
            vec![ChannelEvent::TargetProcessDetected]
        );

        rig.send(ServiceEvent::AllowTarget);
        rig.send(ServiceEvent::TargetProcessDetected);
        assert!(!rig.machine.is_suppressing());
        assert_eq!(rig.kills(), 4);
    }

    #[test]
    fn begin_monitoring_opens_the_registry_gate() {
        let mut rig = Rig::new();
        rig.send(ServiceEvent::BeginMonitoring);
        rig.send(ServiceEvent::BeginMonitoring);
        assert!(rig.gate.load(Ordering::SeqCst));
    }

    #[test]
    fn monitor_failure_notifies_subscribers_once_and_exits() {
        let mut rig = Rig::new();
        let subs = rig.machine.subscriptions();
        let other = Destination::new("other");
        for target in [app(), other.clone(), app()] {
            subscribe(
                &subs,
                Subscription {
                    target,
                    event: ChannelEvent::MonitorFailed,
                },
            );
        }
        subscribe(
            &subs,
            Subscription {
                target: other.clone(),
                event: ChannelEvent::Ping,
            },
        );
        rig.send(ServiceEvent::BeginMonitoring);

        rig.send(ServiceEvent::MonitorFailed);
        assert_eq!(rig.channel.events_to(&app()), vec![ChannelEvent::MonitorFailed]);
        assert_eq!(rig.channel.events_to(&other), vec![ChannelEvent::MonitorFailed]);
        assert_eq!(subs.lock().unwrap().len(), 1);
        assert!(!rig.gate.load(Ordering::SeqCst));
        assert!(*rig.shutdown.borrow());
    }

    #[test]
    fn monitor_failure_reaches_foreground_without_subscription() {
        let mut rig = Rig::new();
        rig.send(ServiceEvent::MonitorFailed);
        assert_eq!(rig.channel.events_to(&app()), vec![ChannelEvent::MonitorFailed]);
    }

    #[test]
    fn exit_closes_gate_and_signals_shutdown() {
        let mut rig = Rig::new();
        rig.send(ServiceEvent::BeginMonitoring);
        rig.send(ServiceEvent::DenyTarget);
        rig.send(ServiceEvent::Exit);
        assert!(!rig.gate.load(Ordering::SeqCst));
        assert!(!rig.machine.is_suppressing());
        assert!(*rig.shutdown.borrow());
    }
}
