//! Engine configuration and its JSON persistence.
//!
//! The settings panel writes `voice_engine.json` into the data directory;
//! the engine reads it once at construction. Every field has a default so
//! a missing file or a partial one still yields a usable config (minus
//! credentials, which keep the engine unavailable until filled in).

pub mod paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

/// Default recognition endpoint and resource.
pub const DEFAULT_WS_URL: &str = "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel";
pub const DEFAULT_RESOURCE_ID: &str = "volc.bigasr.sauc.duration";

/// Static engine configuration, supplied at construction time only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Credentials for the recognition service.
    pub app_id: String,
    pub access_token: String,
    pub secret_key: String,

    // Connection.
    pub ws_url: String,
    pub resource_id: String,
    pub uid: String,

    // Audio.
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub channels: u16,
    /// `-1` selects the system default input device.
    pub microphone_index: i32,
    /// Shortens the send-loop tick interval.
    pub low_latency_mode: bool,

    // Command filtering.
    pub command_timeout_secs: f64,
    pub post_test_ignore_window_secs: f64,

    // Reconnection.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            access_token: String::new(),
            secret_key: String::new(),
            ws_url: DEFAULT_WS_URL.to_string(),
            resource_id: DEFAULT_RESOURCE_ID.to_string(),
            uid: "vision_station".to_string(),
            sample_rate: 16000,
            chunk_size: 1024,
            channels: 1,
            microphone_index: -1,
            low_latency_mode: true,
            command_timeout_secs: 3.0,
            post_test_ignore_window_secs: 10.0,
            max_reconnect_attempts: 3,
            reconnect_delay_secs: 5.0,
        }
    }
}

impl EngineConfig {
    /// Whether the credentials needed to open a session are present.
    pub fn has_credentials(&self) -> bool {
        !self.app_id.is_empty() && !self.access_token.is_empty()
    }

    /// Ring buffer capacity: ten seconds of audio at the configured rate.
    pub fn ring_capacity(&self) -> usize {
        (self.sample_rate as usize) * 10
    }
}

/// Read the engine config from the default location.
pub fn read_engine_config() -> EngineConfig {
    read_engine_config_from(&get_config_path())
}

/// Read the engine config from an explicit path (`--config` override).
pub fn read_engine_config_from(path: &Path) -> EngineConfig {
    read_json_file(path).unwrap_or_default()
}

/// Path to voice_engine.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("voice_engine.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sample_rate, 16000);
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.microphone_index, -1);
        assert!(cfg.low_latency_mode);
        assert_eq!(cfg.command_timeout_secs, 3.0);
        assert_eq!(cfg.post_test_ignore_window_secs, 10.0);
        assert_eq!(cfg.max_reconnect_attempts, 3);
        assert_eq!(cfg.reconnect_delay_secs, 5.0);
        assert_eq!(cfg.ring_capacity(), 160_000);
        assert!(!cfg.has_credentials());
    }

    #[test]
    fn partial_file_fills_missing_fields_from_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"app_id": "app-1", "access_token": "tok", "chunk_size": 512}}"#
        )
        .unwrap();

        let cfg = read_engine_config_from(file.path());
        assert_eq!(cfg.app_id, "app-1");
        assert_eq!(cfg.chunk_size, 512);
        assert_eq!(cfg.sample_rate, 16000);
        assert!(cfg.has_credentials());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let cfg = read_engine_config_from(file.path());
        assert!(!cfg.has_credentials());
        assert_eq!(cfg.sample_rate, 16000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = read_engine_config_from(Path::new("/nonexistent/voice_engine.json"));
        assert_eq!(cfg.ws_url, DEFAULT_WS_URL);
    }
}
