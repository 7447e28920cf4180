use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::{self, SharedConfig};
use crate::dispatcher::Notifier;
use crate::event::AppEvent;

/// Reports whether the full-screen gaming mode is currently active.
pub trait ModeProbe: Send + Sync {
    fn is_full_screen(&self) -> bool;
}

/// Probe driven by the `[mode]` config section: `force_full_screen` wins,
/// otherwise a non-zero HKCU DWORD marks the mode as active.
pub struct ConfiguredMode {
    config: SharedConfig,
}

impl ConfiguredMode {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

impl ModeProbe for ConfiguredMode {
    fn is_full_screen(&self) -> bool {
        let mode = config::snapshot(&self.config).mode;
        if mode.force_full_screen {
            return true;
        }
        match (mode.registry_key.as_deref(), mode.registry_value.as_deref()) {
            (Some(key), Some(value)) => read_dword(key, value).is_some_and(|v| v != 0),
            _ => false,
        }
    }
}

#[cfg(windows)]
fn read_dword(key: &str, value: &str) -> Option<u32> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::System::Registry::{RegGetValueW, HKEY_CURRENT_USER, RRF_RT_REG_DWORD};

    let wide = |s: &str| s.encode_utf16().chain(std::iter::once(0)).collect::<Vec<u16>>();
    let (key, value) = (wide(key), wide(value));
    let mut data = 0u32;
    let mut size = std::mem::size_of::<u32>() as u32;
    let err = unsafe {
        RegGetValueW(
            HKEY_CURRENT_USER,
            PCWSTR(key.as_ptr()),
            PCWSTR(value.as_ptr()),
            RRF_RT_REG_DWORD,
            None,
            Some((&mut data as *mut u32).cast()),
            Some(&mut size),
        )
    };
    (err == ERROR_SUCCESS).then_some(data)
}

#[cfg(not(windows))]
fn read_dword(_key: &str, _value: &str) -> Option<u32> {
    None
}

/// Remembers the last observed mode and reports transitions.
#[derive(Debug, Default)]
pub struct ModeTracker {
    full_screen: Option<bool>,
}

impl ModeTracker {
    /// The first observation only records the mode; startup is covered by
    /// [`AppEvent::Start`].
    pub fn observe(&mut self, full_screen: bool) -> Option<AppEvent> {
        let previous = self.full_screen.replace(full_screen);
        match (previous, full_screen) {
            (Some(false), true) => Some(AppEvent::ModeEntered),
            (Some(true), false) => Some(AppEvent::ModeExited),
            _ => None, // No change.
        }
    }
}

/// Polls `probe` every `period` and posts [`AppEvent::ModeEntered`] /
/// [`AppEvent::ModeExited`] whenever the mode flips.
pub async fn watch(probe: Arc<dyn ModeProbe>, notifier: Notifier<AppEvent>, period: Duration) {
    let mut tracker = ModeTracker::default();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let full_screen = probe.is_full_screen();
        if let Some(event) = tracker.observe(full_screen) {
            tracing::info!(full_screen, "Mode changed");
            notifier.notify(event);
        }
    }
}
