use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_TARGET_PROCESSES: &str = "XboxPcApp.exe";
pub const DEFAULT_SHELL_PROCESS: &str = "explorer.exe";
pub const DEFAULT_LAUNCHER_COMMAND: &str = r"C:\Program Files (x86)\Steam\steam.exe";
pub const DEFAULT_LAUNCHER_PROCESS: &str = "steam.exe";
pub const DEFAULT_LAUNCHER_WINDOW: &str = "Steam Big Picture Mode";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_LAUNCHER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PREVENT_WINDOW_MS: u64 = 3_000;
/// Empirical debounce: a target start this recent means the next shell value
/// read belongs to it rather than to the user.  Tunable, not derived.
pub const DEFAULT_YOUNG_TARGET_MS: u64 = 2_000;
/// Empirical debounce: value reads closer together than this come from one
/// task-switcher interaction.  Tunable, not derived.
pub const DEFAULT_TASK_SWITCHER_MS: u64 = 50;
pub const DEFAULT_MODE_POLL_MS: u64 = 1_000;

pub const MIN_POLL_INTERVAL_MS: u64 = 50;
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;
pub const MIN_LAUNCHER_TIMEOUT_SECS: u64 = 1;
pub const MAX_LAUNCHER_TIMEOUT_SECS: u64 = 600;
pub const MAX_PREVENT_WINDOW_MS: u64 = 60_000;
pub const MAX_DEBOUNCE_MS: u64 = 60_000;
pub const MIN_MODE_POLL_MS: u64 = 100;
pub const MAX_MODE_POLL_MS: u64 = 60_000;

pub const DEFAULT_SERVICE_ADDR: &str = "127.0.0.1:47810";
pub const DEFAULT_APP_ADDR: &str = "127.0.0.1:47811";

/// Configuration shared between the watcher and the state machines.  Handlers
/// take a snapshot at handling time, so reloads apply to the next event.
pub type SharedConfig = Arc<RwLock<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// Clones the current configuration out of `shared`.
pub fn snapshot(shared: &SharedConfig) -> Config {
    shared.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Root configuration structure. Deserialized from %APPDATA%\Couchmode\config.toml.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub mode: ModeConfig,
}

/// The process that must not take over the full-screen shell.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// Executable names, `;`-separated alternatives (e.g. "XboxPcApp.exe;GameBar.exe").
    #[serde(default = "default_target_processes")]
    pub process_names: String,
    /// Shell process whose registry reads reveal task-switcher and start-menu use.
    #[serde(default = "default_shell_process")]
    pub shell_process: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            process_names: default_target_processes(),
            shell_process: default_shell_process(),
        }
    }
}

impl TargetConfig {
    /// Returns the individual target names, trimmed, with empty entries dropped.
    pub fn names(&self) -> Vec<&str> {
        split_names(&self.process_names)
    }
}

/// Splits a `;`-separated list of process names.
pub fn split_names(list: &str) -> Vec<&str> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// The application brought to the foreground instead of the target.
#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    #[serde(default = "default_launcher_command")]
    pub command: String,
    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,
    /// Executable name used to decide whether the launcher is running.
    #[serde(default = "default_launcher_process")]
    pub process_name: String,
    /// Window title or class that marks the launcher as ready.
    #[serde(default = "default_launcher_window")]
    pub window: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            command: default_launcher_command(),
            args: default_launcher_args(),
            process_name: default_launcher_process(),
            window: default_launcher_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Kill and refocus immediately when the target appears next to a running
    /// launcher, instead of leaving the user in control.
    #[serde(default)]
    pub aggressive: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub launcher_timeout_secs: u64,
    pub prevent_window_ms: u64,
    pub young_target_ms: u64,
    pub task_switcher_ms: u64,
    pub mode_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            launcher_timeout_secs: DEFAULT_LAUNCHER_TIMEOUT_SECS,
            prevent_window_ms: DEFAULT_PREVENT_WINDOW_MS,
            young_target_ms: DEFAULT_YOUNG_TARGET_MS,
            task_switcher_ms: DEFAULT_TASK_SWITCHER_MS,
            mode_poll_ms: DEFAULT_MODE_POLL_MS,
        }
    }
}

/// Accessors clamp the raw values, so a zero period or an overflowing
/// deadline never reaches the timers.
impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    pub fn launcher_timeout(&self) -> Duration {
        Duration::from_secs(
            self.launcher_timeout_secs
                .clamp(MIN_LAUNCHER_TIMEOUT_SECS, MAX_LAUNCHER_TIMEOUT_SECS),
        )
    }

    pub fn prevent_window(&self) -> Duration {
        Duration::from_millis(self.prevent_window_ms.min(MAX_PREVENT_WINDOW_MS))
    }

    pub fn young_target(&self) -> Duration {
        Duration::from_millis(self.young_target_ms.min(MAX_DEBOUNCE_MS))
    }

    pub fn task_switcher(&self) -> Duration {
        Duration::from_millis(self.task_switcher_ms.min(MAX_DEBOUNCE_MS))
    }

    pub fn mode_poll(&self) -> Duration {
        Duration::from_millis(self.mode_poll_ms.clamp(MIN_MODE_POLL_MS, MAX_MODE_POLL_MS))
    }
}

/// Loopback addresses the two processes listen on.
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    #[serde(default = "default_service_addr")]
    pub service_addr: String,
    #[serde(default = "default_app_addr")]
    pub app_addr: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            service_addr: default_service_addr(),
            app_addr: default_app_addr(),
        }
    }
}

/// How the full-screen mode is detected.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModeConfig {
    /// Treat the session as full-screen regardless of the probe.
    #[serde(default)]
    pub force_full_screen: bool,
    /// HKCU subkey holding a DWORD that is non-zero while the mode is active.
    pub registry_key: Option<String>,
    pub registry_value: Option<String>,
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it into `shared`.
pub async fn watch_config(path: PathBuf, shared: SharedConfig) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!("Failed to create config watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            tracing::error!("Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::error!("Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    *shared.write().unwrap_or_else(PoisonError::into_inner) = config;
                    tracing::info!("Config reloaded");
                }
                Err(e) => tracing::warn!("Failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_target_processes() -> String {
    DEFAULT_TARGET_PROCESSES.to_string()
}

fn default_shell_process() -> String {
    DEFAULT_SHELL_PROCESS.to_string()
}

fn default_launcher_command() -> String {
    DEFAULT_LAUNCHER_COMMAND.to_string()
}

fn default_launcher_args() -> Vec<String> {
    vec!["-gamepadui".to_string()]
}

fn default_launcher_process() -> String {
    DEFAULT_LAUNCHER_PROCESS.to_string()
}

fn default_launcher_window() -> String {
    DEFAULT_LAUNCHER_WINDOW.to_string()
}

fn default_service_addr() -> String {
    DEFAULT_SERVICE_ADDR.to_string()
}

fn default_app_addr() -> String {
    DEFAULT_APP_ADDR.to_string()
}
