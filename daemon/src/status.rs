use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which process wrote the status file.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Foreground,
    Service,
}

/// Progress of the launcher as seen by the foreground machine.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum LauncherState {
    /// Nothing started by us and nothing being waited for.
    NoLauncher,
    /// Launcher started (or restarted); polling for its window.
    Waiting,
    /// Launcher window found and brought to the foreground.
    Focused,
}

/// Runtime status written to %APPDATA%\Couchmode\status.toml.
/// The settings UI reads this file (read-only) to display shell state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ShellStatus {
    /// Binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub role: Role,
    pub launcher: LauncherState,
    pub splash_visible: bool,
    /// RFC 3339 timestamp of the most recent launcher start, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_launcher_start: Option<String>,
    /// Human-readable error message if interception stopped working.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShellStatus {
    pub fn new(role: Role) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            role,
            launcher: LauncherState::NoLauncher,
            splash_visible: false,
            last_launcher_start: None,
            error: None,
        }
    }

    /// Stamps the launcher start time with the local wall clock.
    pub fn launcher_started(&mut self) {
        self.launcher = LauncherState::Waiting;
        self.last_launcher_start = Some(chrono::Local::now().to_rfc3339());
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// A status write failure is logged and otherwise ignored.
pub fn write_status(path: &Path, status: &ShellStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::warn!("Failed to write status file: {e}");
            }
        }
        Err(e) => tracing::warn!("Failed to serialize status: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── ShellStatus::new ──────────────────────────────────────────────────────

    #[test]
    fn new_starts_without_launcher() {
        let s = ShellStatus::new(Role::Foreground);
        assert_eq!(s.launcher, LauncherState::NoLauncher);
        assert!(!s.splash_visible);
        assert!(s.last_launcher_start.is_none());
        assert!(s.error.is_none());
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn launcher_started_records_rfc3339_time() {
        let mut s = ShellStatus::new(Role::Foreground);
        s.launcher_started();
        assert_eq!(s.launcher, LauncherState::Waiting);
        let stamp = s.last_launcher_start.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok(), "{stamp}");
    }

    // ── serialization ─────────────────────────────────────────────────────────

    #[test]
    fn enums_serialize_in_file_format() {
        let mut s = ShellStatus::new(Role::Service);
        s.launcher = LauncherState::NoLauncher;
        let text = toml::to_string_pretty(&s).unwrap();
        assert!(text.contains("role = \"service\""));
        assert!(text.contains("launcher = \"no_launcher\""));

        s.launcher = LauncherState::Focused;
        let text = toml::to_string_pretty(&s).unwrap();
        assert!(text.contains("launcher = \"focused\""));
    }

    // ── write_status ──────────────────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("status.toml");
        write_status(&path, &ShellStatus::new(Role::Foreground));
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let mut original = ShellStatus::new(Role::Foreground);
        original.launcher = LauncherState::Focused;
        original.splash_visible = true;
        original.error = Some("monitor stopped".to_string());
        write_status(&path, &original);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: ShellStatus = toml::from_str(&content).unwrap();
        assert_eq!(parsed.launcher, LauncherState::Focused);
        assert!(parsed.splash_visible);
        assert_eq!(parsed.error.as_deref(), Some("monitor stopped"));
    }

    #[test]
    fn write_status_omits_none_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &ShellStatus::new(Role::Foreground));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("last_launcher_start"));
        assert!(!content.contains("error"));
    }
}
