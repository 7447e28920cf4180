/// Canonical file paths for Couchmode data files.
///
/// Both files live under %APPDATA%\Couchmode\:
///   - config.toml  Written by the settings UI, read by both roles.
///   - status.toml  Written by the foreground role, read by the settings UI.
use std::path::PathBuf;

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = "Couchmode";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the application data directory: %APPDATA%\Couchmode\
pub fn app_data_dir() -> Result<PathBuf> {
    let appdata = std::env::var_os("APPDATA").context("APPDATA environment variable not set")?;
    Ok(PathBuf::from(appdata).join(APP_DIR_NAME))
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

#[cfg(test)]
#[cfg(windows)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_is_couchmode_inside_appdata() {
        let appdata = std::env::var("APPDATA").unwrap();
        let dir = app_data_dir().unwrap();
        assert_eq!(dir.file_name().unwrap(), "Couchmode");
        assert!(dir.starts_with(&appdata));
    }

    #[test]
    fn config_and_status_share_same_parent_dir() {
        let config = config_file_path().unwrap();
        let status = status_file_path().unwrap();
        assert_eq!(config.file_name().unwrap(), CONFIG_FILE_NAME);
        assert_eq!(status.file_name().unwrap(), STATUS_FILE_NAME);
        assert_eq!(config.parent(), status.parent());
    }
}
