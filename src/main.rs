//! Vision-test station voice core.
//!
//! Communicates with the station GUI via JSON-line IPC on stdin/stdout.
//! This is the entry point that loads configuration, builds the engine,
//! and runs the main event loop.

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use voice_core::audio::capture::list_input_devices;
use voice_core::config::{read_engine_config, read_engine_config_from};
use voice_core::engine::VoiceEngine;
use voice_core::ipc::bridge::{emit_event, spawn_stdin_reader};
use voice_core::ipc::{StationCommand, StationEvent};

#[tokio::main]
async fn main() {
    // Initialize tracing (respects RUST_LOG env, defaults to info).
    // Logs go to stderr; stdout carries the IPC event stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Emit starting event immediately so the GUI knows we're alive.
    emit_event(&StationEvent::Starting {});

    let config = match config_path_override() {
        Some(path) => read_engine_config_from(&path),
        None => read_engine_config(),
    };
    info!(
        sample_rate = config.sample_rate,
        chunk_size = config.chunk_size,
        low_latency = config.low_latency_mode,
        "Configuration loaded"
    );

    let (mut engine, mut engine_events) = VoiceEngine::new(config);
    let mut cmd_rx = spawn_stdin_reader();

    emit_event(&StationEvent::Ready {});
    info!("Voice core ready: {}", engine.status());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        if !handle_command(&mut engine, command).await {
                            break; // Shutdown command received
                        }
                    }
                    None => {
                        // stdin closed — parent process gone
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            event = engine_events.recv() => {
                if let Some(event) = event {
                    emit_event(&event.into());
                }
            }
        }
    }

    engine.stop().await;
    info!("Voice core shutting down");
}

/// `--config <path>` overrides the default config location.
fn config_path_override() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

/// Handle a single command from the GUI.
/// Returns `false` if the main loop should exit.
async fn handle_command(engine: &mut VoiceEngine, cmd: StationCommand) -> bool {
    match cmd {
        StationCommand::Ping {} => {
            emit_event(&StationEvent::Pong {});
        }

        StationCommand::Shutdown {} => {
            emit_event(&StationEvent::Stopping {});
            return false;
        }

        StationCommand::StartListening {} => {
            // Start/error events flow back through the engine channel.
            engine.start();
        }

        StationCommand::StopListening {} => {
            // The stopped status flows back through the engine channel.
            engine.stop().await;
        }

        StationCommand::SetTestInProgress { in_progress } => {
            engine.set_test_in_progress(in_progress);
        }

        StationCommand::ListAudioDevices {} => {
            emit_event(&StationEvent::AudioDevices {
                input: list_input_devices(),
            });
        }
    }

    true
}
