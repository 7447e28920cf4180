mod app_machine;
mod channel;
mod clock;
mod config;
mod dispatcher;
mod event;
mod mode;
mod monitor;
mod paths;
mod process;
mod service_machine;
mod splash;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::app_machine::{AppDeps, AppMachine};
use crate::channel::{ChannelEvent, Destination, Message, MessageChannel, MessageSink, TcpChannel};
use crate::dispatcher::{Dispatcher, Handler, Notifier};
use crate::event::{AppEvent, ServiceEvent};
use crate::monitor::{MatchConfig, Monitor, MonitorEvent};
use crate::process::{ProcessUtils, SystemProcesses};
use crate::service_machine::ServiceMachine;

const DEFAULT_LOG_FILTER: &str = "info,couchmode=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Foreground shell coordinator (default).
    Foreground,
    /// Privileged activity monitor.
    Service,
    /// Ask a running foreground instance to bring up the launcher.
    Open,
    /// Ask a running foreground instance to shut down.
    Quit,
}

impl Role {
    fn from_args(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut role = Role::Foreground;
        for arg in args {
            role = match arg.as_str() {
                "--service" => Role::Service,
                "--open" => Role::Open,
                "--quit" => Role::Quit,
                other => bail!("Unknown argument: {other}\nUsage: couchmode [--service | --open | --quit]"),
            };
        }
        Ok(role)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let role = Role::from_args(std::env::args().skip(1))?;

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir()?;
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create app data directory {}", app_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path()?;
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Config error (using defaults): {e:#}");
        config::Config::default()
    });
    let shared_config = config::shared(initial_config);

    tracing::info!(?role, version = env!("CARGO_PKG_VERSION"), "couchmode starting");

    match role {
        Role::Open => hand_off(&shared_config, ChannelEvent::OpenRequest).await,
        Role::Quit => hand_off(&shared_config, ChannelEvent::Exit).await,
        Role::Service => run_service(shared_config, config_path).await,
        Role::Foreground => run_foreground(shared_config, config_path).await,
    }
}

/// Delivers `event` to the running foreground instance.
async fn hand_off(shared: &config::SharedConfig, event: ChannelEvent) -> Result<()> {
    let app = Destination::new(config::snapshot(shared).channel.app_addr);
    let reply = tokio::task::spawn_blocking(move || {
        TcpChannel::default().request(&app, &Message::event(event))
    })
    .await
    .context("Hand-off task failed")?
    .context("No running couchmode instance")?;
    if !reply.ok {
        bail!("Running instance rejected {event:?}");
    }
    Ok(())
}

async fn foreground_running(app: &Destination) -> bool {
    let app = app.clone();
    tokio::task::spawn_blocking(move || {
        TcpChannel::default()
            .request(&app, &Message::event(ChannelEvent::Ping))
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

/// Routes listener messages into a dispatcher.  `subscribe` receives
/// subscription requests; roles that do not take any pass `None`.
fn message_sink<E, F>(
    notifier: Notifier<E>,
    translate: F,
    subscribe: Option<service_machine::Subscriptions>,
) -> MessageSink
where
    E: Send + std::fmt::Debug + 'static,
    F: Fn(ChannelEvent) -> Option<E> + Send + Sync + 'static,
{
    Arc::new(move |message| match message {
        Message::Event {
            event: ChannelEvent::Ping,
        } => {}
        Message::Event { event } => match translate(event) {
            Some(e) => notifier.notify(e),
            None => tracing::debug!(?event, "Ignoring message not meant for this role"),
        },
        Message::Subscribe { subscription } => match &subscribe {
            Some(list) => service_machine::subscribe(list, subscription),
            None => tracing::debug!(?subscription, "Ignoring subscription"),
        },
    })
}

/// Posts `on_signal` into the dispatcher on Ctrl+C.
fn spawn_ctrl_c<E: Send + std::fmt::Debug + 'static>(notifier: Notifier<E>, on_signal: E) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            notifier.notify(on_signal);
        }
    });
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Stops and joins a dispatcher off the async runtime.
async fn stop_dispatcher<H: Handler>(dispatcher: Dispatcher<H>) {
    if let Err(e) = tokio::task::spawn_blocking(move || dispatcher.stop()).await {
        tracing::error!("Failed to stop dispatcher: {e}");
    }
}

async fn run_foreground(shared: config::SharedConfig, config_path: PathBuf) -> Result<()> {
    let cfg = config::snapshot(&shared);
    let app_dest = Destination::new(&cfg.channel.app_addr);

    if foreground_running(&app_dest).await {
        tracing::info!("Foreground instance already running; handing off");
        return hand_off(&shared, ChannelEvent::OpenRequest).await;
    }
    let listener = channel::bind(&cfg.channel.app_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mode: Arc<dyn mode::ModeProbe> = Arc::new(mode::ConfiguredMode::new(Arc::clone(&shared)));
    let deps = AppDeps {
        config: Arc::clone(&shared),
        splash: Arc::new(splash::HeadlessSplash::default()),
        processes: Arc::new(SystemProcesses::default()),
        channel: Arc::new(TcpChannel::spawn()),
        clock: Arc::new(clock::SystemClock),
        mode: Arc::clone(&mode),
    };
    let machine = AppMachine::new(deps, Destination::new(&cfg.channel.service_addr), app_dest)
        .with_status_file(paths::status_file_path()?)
        .with_shutdown(shutdown_tx);

    let dispatcher = Dispatcher::new("app-dispatcher", machine);
    dispatcher.start()?;
    let notifier = dispatcher.notifier();

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(channel::serve(
        listener,
        message_sink(notifier.clone(), AppEvent::from_channel, None),
    ));
    tokio::spawn(config::watch_config(config_path, Arc::clone(&shared)));
    tokio::spawn(mode::watch(mode, notifier.clone(), cfg.timing.mode_poll()));
    spawn_ctrl_c(notifier.clone(), AppEvent::Shutdown);

    notifier.notify(AppEvent::Start);
    wait_for_shutdown(shutdown_rx).await;

    stop_dispatcher(dispatcher).await;
    tracing::info!("Foreground stopped");
    Ok(())
}

async fn run_service(shared: config::SharedConfig, config_path: PathBuf) -> Result<()> {
    let cfg = config::snapshot(&shared);
    let listener = channel::bind(&cfg.channel.service_addr).await?;
    let processes: Arc<dyn ProcessUtils> = Arc::new(SystemProcesses::default());

    // The shell is normally running long before the monitor starts.
    let shell_pid = processes
        .find_all_by_name(&cfg.target.shell_process)
        .into_iter()
        .min();
    let mut monitor = Monitor::new(monitor::system_backend(), MatchConfig::from_target(&cfg.target))
        .with_shell_pid(shell_pid);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let machine = ServiceMachine::new(
        Arc::clone(&shared),
        processes,
        Arc::new(TcpChannel::spawn()),
        Destination::new(&cfg.channel.app_addr),
        monitor.registry_gate(),
    )
    .with_shutdown(shutdown_tx);
    let subscriptions = machine.subscriptions();

    let dispatcher = Dispatcher::new("service-dispatcher", machine);
    dispatcher.start()?;
    let notifier = dispatcher.notifier();

    let on_match = notifier.clone();
    let started = monitor.start(monitor::new_callback(move |event| {
        on_match.notify(match event {
            MonitorEvent::ProcessDetected => ServiceEvent::TargetProcessDetected,
            MonitorEvent::ConfigValueTouched(_) => ServiceEvent::ConfigValueTouched,
            MonitorEvent::Failed(_) => ServiceEvent::MonitorFailed,
        })
    }));
    if let Err(e) = started {
        tracing::error!("Activity monitor unavailable: {e:#}");
        notifier.notify(ServiceEvent::MonitorFailed);
    }

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(channel::serve(
        listener,
        message_sink(notifier.clone(), ServiceEvent::from_channel, Some(subscriptions)),
    ));
    tokio::spawn(config::watch_config(config_path, Arc::clone(&shared)));
    spawn_ctrl_c(notifier.clone(), ServiceEvent::Exit);

    wait_for_shutdown(shutdown_rx).await;

    if let Err(e) = tokio::task::spawn_blocking(move || monitor.stop()).await {
        tracing::error!("Failed to stop monitor: {e}");
    }
    stop_dispatcher(dispatcher).await;
    tracing::info!("Service stopped");
    Ok(())
}
