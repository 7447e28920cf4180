use crate::channel::ChannelEvent;

/// Events handled by the foreground state machine.  None carry a payload;
/// context is read from shared state when the event is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    /// The foreground process finished starting up.
    Start,
    /// The service saw the target process start.
    TargetProcessDetected,
    /// The full-screen mode became active.
    ModeEntered,
    /// The full-screen mode ended.
    ModeExited,
    /// The shell read one of the watched registry values.
    ConfigValueTouched,
    /// A second foreground instance asked for the launcher.
    OpenRequest,
    /// The service's activity monitor died; interception has stopped.
    MonitorFailed,
    /// Ctrl+C or a service request; tear down and exit.
    Shutdown,
}

impl AppEvent {
    /// Maps a message received from the service into a foreground event.
    pub fn from_channel(event: ChannelEvent) -> Option<Self> {
        match event {
            ChannelEvent::TargetProcessDetected => Some(Self::TargetProcessDetected),
            ChannelEvent::ConfigValueTouched => Some(Self::ConfigValueTouched),
            ChannelEvent::OpenRequest => Some(Self::OpenRequest),
            ChannelEvent::MonitorFailed => Some(Self::MonitorFailed),
            ChannelEvent::Exit => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Events handled by the privileged service state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The monitor decoded a start of the target process.
    TargetProcessDetected,
    /// The monitor saw the shell read a watched registry value.
    ConfigValueTouched,
    /// Kill the target and keep killing it until allowed again.
    DenyTarget,
    /// Stop suppressing the target.
    AllowTarget,
    /// Start surfacing registry value reads.
    BeginMonitoring,
    /// The trace session could not be kept alive.
    MonitorFailed,
    /// Tear down and quit.
    Exit,
}

impl ServiceEvent {
    /// Maps a message received from the foreground into a service event.
    pub fn from_channel(event: ChannelEvent) -> Option<Self> {
        match event {
            ChannelEvent::DenyTarget => Some(Self::DenyTarget),
            ChannelEvent::AllowTarget => Some(Self::AllowTarget),
            ChannelEvent::BeginMonitoring => Some(Self::BeginMonitoring),
            ChannelEvent::Exit => Some(Self::Exit),
            _ => None,
        }
    }
}
