use std::sync::atomic::{AtomicBool, Ordering};

/// Full-screen cover shown while the launcher is starting.
pub trait Splash: Send + Sync {
    fn show(&self);
    fn hide(&self);
    fn is_visible(&self) -> bool;
}

/// Splash that only tracks visibility.  Drawing and video playback belong to
/// the external UI, which reads the visibility from the status file.
#[derive(Default)]
pub struct HeadlessSplash {
    visible: AtomicBool,
}

impl Splash for HeadlessSplash {
    fn show(&self) {
        if !self.visible.swap(true, Ordering::SeqCst) {
            tracing::info!("Splash shown");
        }
    }

    fn hide(&self) {
        if self.visible.swap(false, Ordering::SeqCst) {
            tracing::info!("Splash hidden");
        }
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}
