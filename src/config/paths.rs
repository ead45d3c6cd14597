//! Platform-specific data directory paths.
//!
//!   Windows: %APPDATA%/visiontest-station/data
//!   macOS:   ~/Library/Application Support/visiontest-station/data
//!   Linux:   $XDG_CONFIG_HOME/visiontest-station/data (default ~/.config)

use std::path::PathBuf;

/// Get the vision-test station data directory (cross-platform).
pub fn get_data_dir() -> PathBuf {
    get_config_base().join("visiontest-station").join("data")
}

/// Get the platform-appropriate base config directory.
fn get_config_base() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata);
        }
        dirs::config_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("AppData")
                .join("Roaming")
        })
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Application Support")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    }
}
