//! Keyword tables and the priority scan over recognized text.
//!
//! Matching is substring-based over the lowercased text, the way the
//! recognizer output actually arrives (no tokenization, punctuation glued
//! to words). Priority is fixed: system control, then test control, then
//! directions; within directions the last match in reading order wins, so
//! a user correcting themselves mid-utterance gets their final word.

use super::CommandCategory;

/// Words that open the post-test gate again.
const START_WORDS: &[&str] = &["开始", "测试", "start", "begin", "test"];

const CAMERA_WORDS: &[&str] = &["摄像头", "camera"];
const TEST_WORDS: &[&str] = &["测试", "test"];

const TURN_ON_WORDS: &[&str] = &["启动", "打开", "start", "open", "turn on"];
const TURN_OFF_WORDS: &[&str] = &["关闭", "停止", "结束", "stop", "close", "turn off"];

const BEGIN_WORDS: &[&str] = &["开始", "启动", "start", "begin"];
const END_WORDS: &[&str] = &["停止", "结束", "stop", "end", "finish"];

const SETTINGS_WORDS: &[&str] = &["设置", "配置", "settings"];
const SAVE_WORDS: &[&str] = &["保存", "save"];
const EXPORT_WORDS: &[&str] = &["导出", "export"];

/// Synonymous phrasings per direction. Longer phrasings first so log
/// output shows the fuller match; position-wise it makes no difference.
const DIRECTION_WORDS: &[(&str, &[&str])] = &[
    ("up", &["朝上", "向上", "上", "up"]),
    ("down", &["朝下", "向下", "下", "down"]),
    ("left", &["朝左", "向左", "左", "left"]),
    ("right", &["朝右", "向右", "右", "right"]),
];

pub(super) fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Whether the text contains a start keyword (gate override).
pub(super) fn has_start_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    contains_any(&lower, START_WORDS)
}

/// Scan the text for the single highest-priority command.
///
/// Returns `None` when no keyword group matches — plain speech, not an
/// error.
pub(super) fn extract_keyword_command(
    text: &str,
) -> Option<(CommandCategory, &'static str)> {
    let lower = text.to_lowercase();

    // System control first.
    if contains_any(&lower, CAMERA_WORDS) {
        if contains_any(&lower, TURN_ON_WORDS) {
            return Some((CommandCategory::SystemControl, "start_camera"));
        }
        if contains_any(&lower, TURN_OFF_WORDS) {
            return Some((CommandCategory::SystemControl, "stop_camera"));
        }
    }
    if contains_any(&lower, SETTINGS_WORDS) {
        return Some((CommandCategory::SystemControl, "open_settings"));
    }
    if contains_any(&lower, SAVE_WORDS) {
        return Some((CommandCategory::SystemControl, "save_results"));
    }
    if contains_any(&lower, EXPORT_WORDS) {
        return Some((CommandCategory::SystemControl, "export_report"));
    }

    // Then test control.
    if contains_any(&lower, TEST_WORDS) {
        if contains_any(&lower, BEGIN_WORDS) {
            return Some((CommandCategory::TestControl, "start_test"));
        }
        if contains_any(&lower, END_WORDS) {
            return Some((CommandCategory::TestControl, "stop_test"));
        }
    }

    // Then directions, lexically-last match winning.
    last_direction(&lower).map(|dir| (CommandCategory::Direction, dir))
}

/// Find the direction whose last occurrence sits furthest into the text.
fn last_direction(lower: &str) -> Option<&'static str> {
    let mut best: Option<(usize, &'static str)> = None;
    for (dir, words) in DIRECTION_WORDS {
        for word in *words {
            for (pos, _) in lower.match_indices(word) {
                match best {
                    Some((best_pos, _)) if pos < best_pos => {}
                    _ => best = Some((pos, dir)),
                }
            }
        }
    }
    best.map(|(_, dir)| dir)
}
