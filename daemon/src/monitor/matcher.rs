use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::decode::{
    decode_process_start, decode_registry_value_name, Guid, RecordHeader, PROCESS_START,
    REGISTRY_QUERY_VALUE,
};
use crate::config::{split_names, TargetConfig};

/// Microsoft-Windows-Kernel-Process.
pub const PROCESS_PROVIDER: Guid = Guid(0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716);
/// Microsoft-Windows-Kernel-Registry.
pub const REGISTRY_PROVIDER: Guid = Guid(0x70eb4f03_c1de_4f73_a051_33d13d5413bd);

/// Registry values the shell reads when the task switcher opens.
pub const WATCHED_VALUES: [(&str, WatchedValue); 2] = [
    ("AltTabSettings", WatchedValue::Primary),
    ("MultiTaskingAltTabFilter", WatchedValue::Secondary),
];

/// The shell reads a value several times per interaction; repeats inside this
/// window are one touch.
pub const REGISTRY_DEDUP_WINDOW: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedValue {
    Primary,
    Secondary,
}

/// Notification raised by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ProcessDetected,
    ConfigValueTouched(WatchedValue),
    /// The consumer stopped on its own; no further events will arrive.
    Failed(String),
}

/// What to look for in the record stream.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub targets: Vec<String>,
    pub shell: String,
}

impl MatchConfig {
    pub fn from_target(target: &TargetConfig) -> Self {
        Self {
            targets: split_names(&target.process_names)
                .into_iter()
                .map(str::to_string)
                .collect(),
            shell: target.shell_process.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MatchState {
    pub shell_pid: Option<u32>,
    last_touch: Option<(WatchedValue, Instant)>,
}

/// Turns decoded records into [`MonitorEvent`]s.  Runs on the consumer thread.
pub struct Matcher {
    config: MatchConfig,
    state: MatchState,
    registry_gate: Arc<AtomicBool>,
}

impl Matcher {
    /// Registry matches are only surfaced while `registry_gate` is set.
    pub fn new(config: MatchConfig, registry_gate: Arc<AtomicBool>) -> Self {
        Self {
            config,
            state: MatchState::default(),
            registry_gate,
        }
    }

    pub fn with_shell_pid(mut self, pid: Option<u32>) -> Self {
        self.state.shell_pid = pid;
        self
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &MatchState {
        &self.state
    }

    pub fn on_record(
        &mut self,
        header: &RecordHeader,
        data: &[u8],
        now: Instant,
    ) -> Option<MonitorEvent> {
        if header.provider == PROCESS_PROVIDER && header.is(PROCESS_START) {
            self.on_process_start(header, data)
        } else if header.provider == REGISTRY_PROVIDER && header.is(REGISTRY_QUERY_VALUE) {
            self.on_registry_query(header, data, now)
        } else {
            None
        }
    }

    fn on_process_start(&mut self, header: &RecordHeader, data: &[u8]) -> Option<MonitorEvent> {
        let start = decode_process_start(header.version, data)?;
        let name = start.file_name();

        if name.eq_ignore_ascii_case(&self.config.shell) {
            tracing::debug!(pid = start.process_id, "Shell process started");
            self.state.shell_pid = Some(start.process_id);
        }

        let is_target = self
            .config
            .targets
            .iter()
            .any(|t| name.eq_ignore_ascii_case(t));
        if is_target {
            tracing::info!(name, pid = start.process_id, "Target process started");
            return Some(MonitorEvent::ProcessDetected);
        }
        None
    }

    fn on_registry_query(
        &mut self,
        header: &RecordHeader,
        data: &[u8],
        now: Instant,
    ) -> Option<MonitorEvent> {
        if !self.registry_gate.load(Ordering::Relaxed) {
            return None;
        }
        if self.state.shell_pid != Some(header.process_id) {
            return None;
        }

        let name = decode_registry_value_name(data)?;
        let (_, which) = WATCHED_VALUES
            .iter()
            .find(|(watched, _)| name.eq_ignore_ascii_case(watched))?;

        if let Some((last, at)) = self.state.last_touch {
            if last == *which && now.saturating_duration_since(at) < REGISTRY_DEDUP_WINDOW {
                return None;
            }
        }
        self.state.last_touch = Some((*which, now));
        tracing::debug!(value = %name, "Shell touched watched value");
        Some(MonitorEvent::ConfigValueTouched(*which))
    }
}
