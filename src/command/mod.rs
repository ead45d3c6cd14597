//! Turning recognized text into discrete station commands.
//!
//! Free text from the recognizer is noisy: partial results repeat, the
//! user corrects themselves mid-utterance, and recognitions from a test
//! that just ended can trail in afterwards. This module owns the keyword
//! tables, the priority rules, the debounce state, and the post-test gate
//! that together guarantee at most one command per utterance.

mod keywords;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use keywords::{extract_keyword_command, has_start_keyword};

/// Command families, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    SystemControl,
    TestControl,
    Direction,
}

impl CommandCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemControl => "system_control",
            Self::TestControl => "test_control",
            Self::Direction => "direction",
        }
    }
}

/// The single externally observable output of interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub category: CommandCategory,
    pub value: String,
    pub original_text: String,
}

/// Duplicate-suppression state, updated only when a command is accepted.
struct DebounceState {
    last_processed_text: String,
    last_command_time: Option<Instant>,
}

/// Post-test suppression window. A test that just finished must not have
/// trailing recognitions leak into the next interaction.
struct GateState {
    test_in_progress: bool,
    test_completed_at: Option<Instant>,
}

/// Stateful text-to-command interpreter for one engine instance.
pub struct CommandInterpreter {
    command_timeout: Duration,
    post_test_ignore_window: Duration,
    state: Mutex<DebounceState>,
    gate: Mutex<GateState>,
}

impl CommandInterpreter {
    pub fn new(command_timeout: Duration, post_test_ignore_window: Duration) -> Self {
        Self {
            command_timeout,
            post_test_ignore_window,
            state: Mutex::new(DebounceState {
                last_processed_text: String::new(),
                last_command_time: None,
            }),
            gate: Mutex::new(GateState {
                test_in_progress: false,
                test_completed_at: None,
            }),
        }
    }

    /// Interpret a recognition result, producing at most one command.
    pub fn interpret(&self, text: &str) -> Option<CommandEvent> {
        self.interpret_at(text, Instant::now())
    }

    /// Mark a test as started or stopped. Stopping stamps the completion
    /// time and opens the post-test ignore window.
    pub fn set_test_in_progress(&self, in_progress: bool) {
        self.set_test_in_progress_at(in_progress, Instant::now());
    }

    pub(crate) fn set_test_in_progress_at(&self, in_progress: bool, now: Instant) {
        let mut gate = self.gate.lock().unwrap();
        gate.test_in_progress = in_progress;
        if in_progress {
            info!("Test started, accepting commands");
        } else {
            gate.test_completed_at = Some(now);
            info!(
                window_secs = self.post_test_ignore_window.as_secs_f64(),
                "Test finished, ignoring stale commands"
            );
        }
    }

    pub(crate) fn interpret_at(&self, text: &str, now: Instant) -> Option<CommandEvent> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        // An interpretation is already in flight for an overlapping
        // result; drop this one rather than double-process.
        let mut state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(%text, "Interpretation in flight, dropping overlapping result");
                return None;
            }
        };

        if self.gate_ignores(now) {
            if !has_start_keyword(text) {
                debug!(%text, "Post-test window active, ignoring stale command");
                return None;
            }
            // A fresh start request re-opens the gate immediately.
            self.set_test_in_progress_at(true, now);
        }

        if self.is_duplicate(&state, text, now) {
            debug!(%text, "Duplicate or rapid repeat, suppressed");
            return None;
        }

        let (category, value) = extract_keyword_command(text)?;

        state.last_processed_text = text.to_string();
        state.last_command_time = Some(now);
        drop(state);

        match value {
            "start_test" => self.set_test_in_progress_at(true, now),
            "stop_test" => self.set_test_in_progress_at(false, now),
            _ => {}
        }

        info!(%text, command = value, "Recognized command");
        Some(CommandEvent {
            category,
            value: value.to_string(),
            original_text: text.to_string(),
        })
    }

    /// Whether the post-test window currently swallows non-start text.
    fn gate_ignores(&self, now: Instant) -> bool {
        let gate = self.gate.lock().unwrap();
        if gate.test_in_progress {
            return false;
        }
        match gate.test_completed_at {
            Some(completed) => now.duration_since(completed) < self.post_test_ignore_window,
            None => false,
        }
    }

    /// Duplicate and cooldown check. Any text inside the timeout window
    /// of the last accepted command is suppressed: the near-duplicate
    /// rule (same text, or same after stripping punctuation) and the
    /// unconditional between-commands cooldown share the one configured
    /// window.
    fn is_duplicate(&self, state: &DebounceState, text: &str, now: Instant) -> bool {
        let last = match state.last_command_time {
            Some(t) => t,
            None => return false,
        };
        if now.duration_since(last) >= self.command_timeout {
            return false;
        }
        if text == state.last_processed_text {
            return true;
        }
        if strip_punctuation(text) == strip_punctuation(&state.last_processed_text) {
            return true;
        }
        // Different content, but still inside the cooldown.
        true
    }
}

/// Remove CJK and ASCII punctuation plus whitespace for near-duplicate
/// comparison.
fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| {
            !c.is_whitespace()
                && !matches!(
                    c,
                    '。' | '，' | '、' | '！' | '？' | '；' | '：'
                        | '.' | ',' | '!' | '?' | ';' | ':'
                )
        })
        .collect()
}
