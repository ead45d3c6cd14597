//! Streaming voice-command engine for the vision-test station.
//!
//! The engine opens a persistent WebSocket to a cloud speech-recognition
//! service, streams microphone audio as sequenced binary frames, decodes
//! recognition results, and filters them into discrete station commands
//! (directions for the optotype, test control, system control). The GUI
//! consumes the engine through four outward event types; see
//! [`engine::EngineEvent`].

pub mod audio;
pub mod command;
pub mod config;
pub mod engine;
pub mod ipc;
pub mod protocol;
pub mod session;
