/// Foreground state machine.
///
/// Keeps the launcher in front while the full-screen mode is active: it covers
/// the screen with the splash while the launcher starts, pushes the target
/// process back out whenever it shows up, and briefly asks the service to keep
/// the target suppressed after every refocus.
///
/// The implicit states are tracked through the poll timer (waiting for the
/// launcher window), the splash visibility and [`LauncherState`].
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::watch;

use crate::channel::{ChannelEvent, Destination, Message, MessageChannel, Subscription};
use crate::clock::Clock;
use crate::config::{self, Config, SharedConfig};
use crate::dispatcher::{Handler, TimerHandle, Timers};
use crate::event::AppEvent;
use crate::mode::ModeProbe;
use crate::process::{ProcessUtils, WindowHandle};
use crate::splash::Splash;
use crate::status::{self, LauncherState, Role, ShellStatus};

const MONITOR_FAILED_MESSAGE: &str = "Activity monitor stopped; the target is no longer intercepted";

/// Everything the machine talks to.
pub struct AppDeps {
    pub config: SharedConfig,
    pub splash: Arc<dyn Splash>,
    pub processes: Arc<dyn ProcessUtils>,
    pub channel: Arc<dyn MessageChannel>,
    pub clock: Arc<dyn Clock>,
    pub mode: Arc<dyn ModeProbe>,
}

pub struct AppMachine {
    deps: AppDeps,
    /// Where the service role listens.
    service: Destination,
    /// Where this process listens; used as the subscription target.
    own: Destination,
    status_path: Option<PathBuf>,
    status: ShellStatus,
    shutdown: Option<watch::Sender<bool>>,
    poll: Option<TimerHandle>,
    prevent: Option<TimerHandle>,
    wait_started: Option<Instant>,
    last_target_seen: Option<Instant>,
    last_config_touch: Option<Instant>,
}

impl Handler for AppMachine {
    type Event = AppEvent;

    fn process_event(&mut self, event: AppEvent, timers: &mut Timers<Self>) -> Result<()> {
        let cfg = config::snapshot(&self.deps.config);
        tracing::debug!(?event, "app event");

        match event {
            AppEvent::Start | AppEvent::ModeEntered => self.on_enter(&cfg, timers),
            AppEvent::ModeExited => {}
            AppEvent::TargetProcessDetected => self.on_target(&cfg, timers),
            AppEvent::ConfigValueTouched => self.on_config_touched(&cfg, timers),
            AppEvent::OpenRequest => self.focus_or_start(&cfg, timers),
            AppEvent::MonitorFailed => self.on_monitor_failed(),
            AppEvent::Shutdown => self.on_shutdown(timers),
        }

        self.publish_status();
        Ok(())
    }
}

impl AppMachine {
    pub fn new(deps: AppDeps, service: Destination, own: Destination) -> Self {
        Self {
            deps,
            service,
            own,
            status_path: None,
            status: ShellStatus::new(Role::Foreground),
            shutdown: None,
            poll: None,
            prevent: None,
            wait_started: None,
            last_target_seen: None,
            last_config_touch: None,
        }
    }

    /// Mirrors the machine's state into `path` after every transition.
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_path = Some(path);
        self
    }

    /// Set to `true` once a shutdown has been handled.
    pub fn with_shutdown(mut self, tx: watch::Sender<bool>) -> Self {
        self.shutdown = Some(tx);
        self
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> &ShellStatus {
        &self.status
    }

    // ── events ────────────────────────────────────────────────────────────────

    fn on_enter(&mut self, cfg: &Config, timers: &mut Timers<Self>) {
        if !self.deps.mode.is_full_screen() {
            tracing::debug!("Not in full-screen mode; nothing to do");
            return;
        }
        self.post(ChannelEvent::BeginMonitoring);
        self.subscribe(ChannelEvent::MonitorFailed);
        self.launch_with_splash(cfg, timers);
    }

    fn on_target(&mut self, cfg: &Config, timers: &mut Timers<Self>) {
        self.last_target_seen = Some(self.deps.clock.now());
        if !self.deps.mode.is_full_screen() {
            return;
        }

        if self.deps.splash.is_visible() || self.prevent_active(timers) {
            self.deny(cfg);
        } else if !self.launcher_running(cfg) {
            self.launch_with_splash(cfg, timers);
        } else if cfg.policy.aggressive {
            self.deny(cfg);
            self.focus_or_start(cfg, timers);
            self.arm_prevent(cfg, timers);
        } else {
            tracing::debug!("Launcher running; leaving target alone");
        }
    }

    fn on_config_touched(&mut self, cfg: &Config, timers: &mut Timers<Self>) {
        let now = self.deps.clock.now();
        let previous = self.last_config_touch.replace(now);
        if !self.deps.mode.is_full_screen() {
            return;
        }

        if previous.is_some_and(|t| now.saturating_duration_since(t) < cfg.timing.task_switcher()) {
            tracing::trace!("Value read belongs to the previous task-switcher interaction");
            return;
        }
        if self
            .last_target_seen
            .is_some_and(|t| now.saturating_duration_since(t) < cfg.timing.young_target())
        {
            tracing::debug!("Value read right after a target start; ignoring");
            return;
        }

        self.focus_or_start(cfg, timers);
        self.arm_prevent(cfg, timers);
    }

    fn on_monitor_failed(&mut self) {
        tracing::error!("{MONITOR_FAILED_MESSAGE}");
        self.deps.splash.hide();
        self.status.error = Some(MONITOR_FAILED_MESSAGE.to_string());
    }

    fn on_shutdown(&mut self, timers: &mut Timers<Self>) {
        self.cancel_poll(timers);
        if let Some(prevent) = self.prevent.take() {
            timers.cancel_timer(prevent);
        }
        self.deps.splash.hide();
        self.post(ChannelEvent::AllowTarget);
        self.post(ChannelEvent::Exit);
        self.status.launcher = LauncherState::NoLauncher;
        if let Some(tx) = &self.shutdown {
            tx.send_replace(true);
        }
        tracing::info!("Foreground shut down");
    }

    // ── timers ────────────────────────────────────────────────────────────────

    fn on_poll(&mut self, timers: &mut Timers<Self>) -> Result<()> {
        let cfg = config::snapshot(&self.deps.config);
        let now = self.deps.clock.now();

        let pids = self.deps.processes.find_all_by_name(&cfg.launcher.process_name);
        match self.deps.processes.get_window(&pids, &cfg.launcher.window) {
            Some(window) if self.focus(window) => {
                self.arm_prevent(&cfg, timers);
                self.deps.splash.hide();
                self.cancel_poll(timers);
            }
            _ => {
                let started = *self.wait_started.get_or_insert(now);
                if now.saturating_duration_since(started) >= cfg.timing.launcher_timeout() {
                    tracing::warn!(
                        timeout = ?cfg.timing.launcher_timeout(),
                        "Launcher window never appeared; restarting launcher"
                    );
                    self.start_launcher(&cfg);
                }
            }
        }

        self.publish_status();
        Ok(())
    }

    fn on_prevent_expired(&mut self, _timers: &mut Timers<Self>) -> Result<()> {
        self.prevent = None;
        self.post(ChannelEvent::AllowTarget);
        Ok(())
    }

    fn arm_poll(&mut self, cfg: &Config, timers: &mut Timers<Self>) {
        if self.wait_started.is_none() {
            self.wait_started = Some(self.deps.clock.now());
        }
        if self.poll.is_some_and(|h| timers.is_pending(h)) {
            return;
        }
        self.poll = Some(timers.set_timer(cfg.timing.poll_interval(), true, Self::on_poll));
    }

    fn cancel_poll(&mut self, timers: &mut Timers<Self>) {
        if let Some(poll) = self.poll.take() {
            timers.cancel_timer(poll);
        }
        self.wait_started = None;
    }

    /// (Re)starts the window in which the service keeps the target suppressed.
    fn arm_prevent(&mut self, cfg: &Config, timers: &mut Timers<Self>) {
        if let Some(prevent) = self.prevent.take() {
            timers.cancel_timer(prevent);
        }
        self.prevent = Some(timers.set_timer(
            cfg.timing.prevent_window(),
            false,
            Self::on_prevent_expired,
        ));
    }

    fn prevent_active(&self, timers: &Timers<Self>) -> bool {
        self.prevent.is_some_and(|h| timers.is_pending(h))
    }

    // ── actions ───────────────────────────────────────────────────────────────

    fn launch_with_splash(&mut self, cfg: &Config, timers: &mut Timers<Self>) {
        self.deps.splash.show();
        self.deny(cfg);
        self.start_launcher(cfg);
        self.arm_poll(cfg, timers);
    }

    /// Brings an existing launcher window forward, or starts the launcher and
    /// waits for its window.
    fn focus_or_start(&mut self, cfg: &Config, timers: &mut Timers<Self>) {
        let pids = self.deps.processes.find_all_by_name(&cfg.launcher.process_name);
        if let Some(window) = self.deps.processes.get_window(&pids, &cfg.launcher.window) {
            if self.focus(window) {
                return;
            }
        }
        if pids.is_empty() {
            self.start_launcher(cfg);
        }
        self.arm_poll(cfg, timers);
    }

    fn start_launcher(&mut self, cfg: &Config) {
        match self.deps.processes.start(&cfg.launcher.command, &cfg.launcher.args) {
            Some(pid) => tracing::info!(pid, "Launcher started"),
            None => tracing::warn!("Launcher failed to start; will retry"),
        }
        self.wait_started = Some(self.deps.clock.now());
        self.status.launcher_started();
    }

    fn focus(&mut self, window: WindowHandle) -> bool {
        if self.deps.processes.focus(window) {
            self.status.launcher = LauncherState::Focused;
            true
        } else {
            tracing::debug!(?window, "Launcher refused focus");
            false
        }
    }

    /// Kills the target locally and asks the service to keep it down.
    fn deny(&self, cfg: &Config) {
        for name in cfg.target.names() {
            if let Err(e) = self.deps.processes.kill(name) {
                tracing::warn!("{e:#}");
            }
        }
        self.post(ChannelEvent::DenyTarget);
    }

    fn launcher_running(&self, cfg: &Config) -> bool {
        !self
            .deps
            .processes
            .find_all_by_name(&cfg.launcher.process_name)
            .is_empty()
    }

    fn post(&self, event: ChannelEvent) {
        if let Err(e) = self.deps.channel.post(&self.service, &Message::event(event)) {
            tracing::warn!(?event, "Failed to reach service: {e:#}");
        }
    }

    fn subscribe(&self, event: ChannelEvent) {
        let message = Message::Subscribe {
            subscription: Subscription {
                target: self.own.clone(),
                event,
            },
        };
        if let Err(e) = self.deps.channel.post(&self.service, &message) {
            tracing::warn!(?event, "Failed to subscribe: {e:#}");
        }
    }

    fn publish_status(&mut self) {
        self.status.splash_visible = self.deps.splash.is_visible();
        if let Some(path) = &self.status_path {
            status::write_status(path, &self.status);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::clock::ManualClock;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeProcesses {
        running: Mutex<HashMap<String, HashSet<u32>>>,
        window: Mutex<Option<WindowHandle>>,
        kills: Mutex<Vec<String>>,
        starts: Mutex<Vec<String>>,
        focused: Mutex<Vec<WindowHandle>>,
    }

    impl FakeProcesses {
        fn launch_launcher_window(&self) {
            self.running
                .lock()
                .unwrap()
                .insert("steam.exe".to_string(), HashSet::from([4000]));
            *self.window.lock().unwrap() = Some(WindowHandle(0x40));
        }

        fn kills(&self) -> usize {
            self.kills.lock().unwrap().len()
        }

        fn starts(&self) -> usize {
            self.starts.lock().unwrap().len()
        }

        fn focused(&self) -> usize {
            self.focused.lock().unwrap().len()
        }
    }

    impl ProcessUtils for FakeProcesses {
        fn find_all_by_name(&self, name: &str) -> HashSet<u32> {
            self.running
                .lock()
                .unwrap()
                .get(&name.to_lowercase())
                .cloned()
                .unwrap_or_default()
        }

        fn get_window(&self, pids: &HashSet<u32>, _title_or_class: &str) -> Option<WindowHandle> {
            if pids.is_empty() {
                return None;
            }
            *self.window.lock().unwrap()
        }

        fn start(&self, command: &str, _args: &[String]) -> Option<u32> {
            let mut starts = self.starts.lock().unwrap();
            starts.push(command.to_string());
            Some(1000 + starts.len() as u32)
        }

        fn kill(&self, name: &str) -> Result<usize> {
            self.kills.lock().unwrap().push(name.to_string());
            Ok(1)
        }

        fn focus(&self, window: WindowHandle) -> bool {
            self.focused.lock().unwrap().push(window);
            true
        }
    }

    #[derive(Default)]
    struct CountingSplash {
        visible: AtomicBool,
        shows: AtomicUsize,
    }

    impl Splash for CountingSplash {
        fn show(&self) {
            self.shows.fetch_add(1, Ordering::SeqCst);
            self.visible.store(true, Ordering::SeqCst);
        }

        fn hide(&self) {
            self.visible.store(false, Ordering::SeqCst);
        }

        fn is_visible(&self) -> bool {
            self.visible.load(Ordering::SeqCst)
        }
    }

    struct FixedMode(AtomicBool);

    impl ModeProbe for FixedMode {
        fn is_full_screen(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn service() -> Destination {
        Destination::new("service")
    }

    struct Scenario {
        machine: AppMachine,
        timers: Timers<AppMachine>,
        clock: Arc<ManualClock>,
        processes: Arc<FakeProcesses>,
        splash: Arc<CountingSplash>,
        channel: Arc<LocalChannel>,
        mode: Arc<FixedMode>,
        config: SharedConfig,
    }

    impl Scenario {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let processes = Arc::new(FakeProcesses::default());
            let splash = Arc::new(CountingSplash::default());
            let channel = Arc::new(LocalChannel::new());
            let mode = Arc::new(FixedMode(AtomicBool::new(true)));
            let config = config::shared(Config::default());
            let deps = AppDeps {
                config: Arc::clone(&config),
                splash: splash.clone(),
                processes: processes.clone(),
                channel: channel.clone(),
                clock: clock.clone(),
                mode: mode.clone(),
            };
            Self {
                machine: AppMachine::new(deps, service(), Destination::new("app")),
                timers: Timers::new(),
                clock,
                processes,
                splash,
                channel,
                mode,
                config,
            }
        }

        fn send(&mut self, event: AppEvent) {
            self.machine.process_event(event, &mut self.timers).unwrap();
        }

        fn advance(&self, ms: u64) {
            self.clock.advance(Duration::from_millis(ms));
        }

        fn fire_poll(&mut self) -> bool {
            let poll = self.machine.poll.expect("poll timer armed");
            self.timers.fire(poll, &mut self.machine)
        }

        fn fire_prevent(&mut self) -> bool {
            let prevent = self.machine.prevent.expect("prevent timer armed");
            self.timers.fire(prevent, &mut self.machine)
        }

        fn poll_pending(&self) -> bool {
            self.machine.poll.is_some_and(|h| self.timers.is_pending(h))
        }

        fn prevent_pending(&self) -> bool {
            self.machine.prevent.is_some_and(|h| self.timers.is_pending(h))
        }

        fn to_service(&self) -> Vec<ChannelEvent> {
            self.channel.events_to(&service())
        }
    }

    // ── start / mode ──────────────────────────────────────────────────────────

    #[test]
    fn start_in_full_screen_covers_denies_launches_and_polls() {
        let mut s = Scenario::new();
        s.send(AppEvent::Start);

        assert_eq!(s.splash.shows.load(Ordering::SeqCst), 1);
        assert_eq!(*s.processes.kills.lock().unwrap(), vec!["XboxPcApp.exe"]);
        assert_eq!(s.processes.starts(), 1);
        assert_eq!(s.timers.pending(), 1);
        let poll = s.machine.poll.unwrap();
        assert_eq!(
            s.timers.interval_of(poll),
            Some((Duration::from_millis(500), true))
        );
        assert_eq!(
            s.to_service(),
            vec![ChannelEvent::BeginMonitoring, ChannelEvent::DenyTarget]
        );
        assert!(s.channel.sent().iter().any(|(_, m)| matches!(
            m,
            Message::Subscribe { subscription } if subscription.event == ChannelEvent::MonitorFailed
        )));
        assert_eq!(s.machine.status().launcher, LauncherState::Waiting);
    }

    #[test]
    fn start_on_desktop_does_nothing() {
        let mut s = Scenario::new();
        s.mode.0.store(false, Ordering::SeqCst);
        s.send(AppEvent::Start);
        s.send(AppEvent::ModeExited);
        assert_eq!(s.processes.starts(), 0);
        assert_eq!(s.timers.pending(), 0);
        assert!(s.channel.sent().is_empty());
    }

    #[test]
    fn mode_entered_behaves_like_start() {
        let mut s = Scenario::new();
        s.send(AppEvent::ModeEntered);
        assert!(s.splash.is_visible());
        assert_eq!(s.processes.starts(), 1);
        assert!(s.poll_pending());
    }

    // ── launcher wait ─────────────────────────────────────────────────────────

    #[test]
    fn launcher_window_ends_the_wait_and_opens_prevent_window() {
        let mut s = Scenario::new();
        s.send(AppEvent::Start);
        s.advance(500);
        assert!(s.fire_poll());
        assert!(s.poll_pending());
        assert_eq!(s.processes.focused(), 0);

        s.processes.launch_launcher_window();
        s.advance(500);
        s.fire_poll();
        assert_eq!(s.processes.focused(), 1);
        assert!(!s.splash.is_visible());
        assert!(!s.poll_pending());
        assert!(s.prevent_pending());
        assert_eq!(s.machine.status().launcher, LauncherState::Focused);

        s.fire_prevent();
        assert_eq!(s.to_service().last(), Some(&ChannelEvent::AllowTarget));
        assert!(!s.prevent_pending());
    }

    #[test]
    fn launcher_is_restarted_once_per_timeout() {
        let mut s = Scenario::new();
        s.send(AppEvent::Start);
        for _ in 0..61 {
            s.advance(500);
            s.fire_poll();
        }
        assert_eq!(s.processes.starts(), 2);
        assert!(s.poll_pending());
    }

    // ── target detection ──────────────────────────────────────────────────────

    #[test]
    fn target_while_splash_is_up_is_only_denied() {
        let mut s = Scenario::new();
        s.send(AppEvent::Start);
        s.send(AppEvent::TargetProcessDetected);
        s.advance(20);
        s.send(AppEvent::TargetProcessDetected);
        assert_eq!(s.processes.kills(), 3);
        assert_eq!(s.processes.starts(), 1);
        assert_eq!(s.splash.shows.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn target_without_launcher_launches_it() {
        let mut s = Scenario::new();
        s.send(AppEvent::TargetProcessDetected);
        assert!(s.splash.is_visible());
        assert_eq!(s.processes.kills(), 1);
        assert_eq!(s.processes.starts(), 1);
        assert!(s.poll_pending());
    }

    #[test]
    fn target_inside_prevent_window_is_denied() {
        let mut s = Scenario::new();
        s.processes.launch_launcher_window();
        s.send(AppEvent::ConfigValueTouched);
        assert!(s.prevent_pending());

        s.send(AppEvent::TargetProcessDetected);
        assert_eq!(s.processes.kills(), 1);
        assert_eq!(s.processes.starts(), 0);
    }

    #[test]
    fn target_next_to_running_launcher_depends_on_policy() {
        let mut s = Scenario::new();
        s.processes.launch_launcher_window();

        s.send(AppEvent::TargetProcessDetected);
        assert_eq!(s.processes.kills(), 0);
        assert_eq!(s.processes.focused(), 0);

        s.config.write().unwrap().policy.aggressive = true;
        s.send(AppEvent::TargetProcessDetected);
        assert_eq!(s.processes.kills(), 1);
        assert_eq!(s.processes.focused(), 1);
        assert!(s.prevent_pending());
        assert_eq!(s.processes.starts(), 0);
    }

    // ── config value reads ────────────────────────────────────────────────────

    #[test]
    fn reads_inside_task_switcher_window_count_once() {
        let mut s = Scenario::new();
        s.processes.launch_launcher_window();

        s.send(AppEvent::ConfigValueTouched);
        assert_eq!(s.processes.focused(), 1);
        assert!(s.prevent_pending());

        s.advance(30);
        s.send(AppEvent::ConfigValueTouched);
        assert_eq!(s.processes.focused(), 1);

        s.advance(100);
        s.send(AppEvent::ConfigValueTouched);
        assert_eq!(s.processes.focused(), 2);
    }

    #[test]
    fn reads_right_after_target_start_are_ignored() {
        let mut s = Scenario::new();
        s.processes.launch_launcher_window();
        s.send(AppEvent::TargetProcessDetected);

        s.advance(1_000);
        s.send(AppEvent::ConfigValueTouched);
        assert_eq!(s.processes.focused(), 0);

        s.advance(1_500);
        s.send(AppEvent::ConfigValueTouched);
        assert_eq!(s.processes.focused(), 1);
    }

    #[test]
    fn read_without_launcher_starts_it() {
        let mut s = Scenario::new();
        s.send(AppEvent::ConfigValueTouched);
        assert_eq!(s.processes.starts(), 1);
        assert!(s.poll_pending());
        assert!(s.prevent_pending());
        assert!(!s.splash.is_visible());
    }

    // ── requests and lifecycle ────────────────────────────────────────────────

    #[test]
    fn open_request_launches_without_splash() {
        let mut s = Scenario::new();
        s.mode.0.store(false, Ordering::SeqCst);
        s.send(AppEvent::OpenRequest);
        assert_eq!(s.processes.starts(), 1);
        assert_eq!(s.processes.kills(), 0);
        assert!(!s.splash.is_visible());

        s.processes.launch_launcher_window();
        s.send(AppEvent::OpenRequest);
        assert_eq!(s.processes.focused(), 1);
        assert_eq!(s.processes.starts(), 1);
    }

    #[test]
    fn monitor_failure_hides_splash_and_records_error() {
        let mut s = Scenario::new();
        s.send(AppEvent::Start);
        s.send(AppEvent::MonitorFailed);
        assert!(!s.splash.is_visible());
        assert!(s.machine.status().error.is_some());
        assert!(s.poll_pending());
    }

    #[test]
    fn shutdown_cancels_timers_and_releases_target() {
        let (tx, rx) = watch::channel(false);
        let mut s = Scenario::new();
        s.machine.shutdown = Some(tx);
        s.processes.launch_launcher_window();
        s.send(AppEvent::Start);
        s.fire_poll();
        assert_eq!(s.timers.pending(), 1);

        s.channel.clear();
        s.send(AppEvent::Shutdown);
        assert_eq!(s.timers.pending(), 0);
        assert!(!s.splash.is_visible());
        assert_eq!(
            s.to_service(),
            vec![ChannelEvent::AllowTarget, ChannelEvent::Exit]
        );
        assert!(*rx.borrow());
    }

    #[test]
    fn status_file_tracks_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let mut s = Scenario::new();
        s.machine.status_path = Some(path.clone());

        s.send(AppEvent::Start);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("launcher = \"waiting\""), "{text}");
        assert!(text.contains("splash_visible = true"));
        assert!(text.contains("last_launcher_start"));

        s.processes.launch_launcher_window();
        s.fire_poll();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("launcher = \"focused\""));
        assert!(text.contains("splash_visible = false"));
    }
}
