//! IPC protocol types for communication with the station GUI.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (engine -> GUI).
//! Commands use `{"command": "<name>", ...}` format (GUI -> engine).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::audio::AudioDeviceInfo;
use crate::engine::EngineEvent;

// ---------------------------------------------------------------------------
// Events: engine -> GUI (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the GUI via stdout as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum StationEvent {
    Starting {},
    Ready {},
    CommandRecognized {
        category: String,
        value: String,
        original_text: String,
    },
    StatusChanged {
        message: String,
    },
    ErrorOccurred {
        message: String,
    },
    AudioLevelChanged {
        percent: u8,
    },
    AudioDevices {
        input: Vec<AudioDeviceInfo>,
    },
    Pong {},
    Stopping {},
}

impl From<EngineEvent> for StationEvent {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::CommandRecognized {
                category,
                value,
                original_text,
            } => Self::CommandRecognized {
                category: category.as_str().to_string(),
                value,
                original_text,
            },
            EngineEvent::StatusChanged { message } => Self::StatusChanged { message },
            EngineEvent::ErrorOccurred { message } => Self::ErrorOccurred { message },
            EngineEvent::AudioLevelChanged { percent } => Self::AudioLevelChanged { percent },
        }
    }
}

// ---------------------------------------------------------------------------
// Commands: GUI -> engine (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the GUI via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum StationCommand {
    StartListening {},
    StopListening {},
    SetTestInProgress { in_progress: bool },
    ListAudioDevices {},
    Ping {},
    Shutdown {},
}
