//! Loop and tool-budget thresholds (spec §4.J.3).
//!
//! Grounded on `original_source/user_container/agent/loop_detector.py` for
//! the numeric thresholds themselves. That module's example tool set
//! (`web_search`, `web_fetch`, `edit_file`) doesn't exist in this registry
//! (see `tools.rs`), so the per-tool caps and the research-mode trigger are
//! re-keyed onto the tools this crate actually dispatches: `edit_file`'s
//! cap becomes `write_file`'s, and the two information-gathering tools
//! that exist here (`read_file`, `explore_task`) stand in for
//! `web_search`/`web_fetch` as the research-artifact-mode trigger.

use serde_json::Value;
use sha2::{Digest, Sha256};

use warden_domain::model::{Message, Role};

/// History-window size for the "identical tool call N times in a row"
/// check over persisted messages.
pub const HISTORY_WINDOW: usize = 3;
/// Soft-repeat threshold: every Nth consecutive identical call triggers a
/// recovery nudge and resets the streak.
pub const SOFT_REPEAT_THRESHOLD: u32 = 3;
/// Number of recovery nudges tolerated before hard-stopping the job.
pub const RECOVERY_CAP: u32 = 3;
/// Absolute cap on consecutive identical calls regardless of recovery.
pub const ABSOLUTE_SAME_TOOL_CAP: u32 = 10;
/// Per-tool call caps within a single turn; exceeding one is a soft nudge,
/// not a hard stop.
pub const TOOL_CAPS: &[(&str, u32)] =
    &[("read_file", 30), ("write_file", 30), ("shell", 25), ("delegate_task", 5), ("explore_task", 10)];
/// Aggregate cap across every tool in a single turn.
pub const TOTAL_LIMIT: u32 = 60;
/// Tools whose repeated use switches the turn into research-artifact mode.
pub const RESEARCH_TRIGGER_TOOLS: &[&str] = &["read_file", "explore_task"];
pub const RESEARCH_MODE_THRESHOLD: u32 = 3;

/// A stable signature for "this tool, called with these arguments",
/// used to detect consecutive identical calls.
pub fn tool_signature(name: &str, arguments: &Value) -> String {
    format!("{name}:{arguments}")
}

/// Short content-addressed signature for the duplicate-call cache. Not
/// literally MD5 (this crate doesn't carry that dependency) — any stable
/// hash of the same inputs satisfies the same "have we seen this exact
/// call before" check.
pub fn duplicate_signature(name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(arguments.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("{name}:{}", hex::encode(&digest[..4]))
}

/// True when the last `HISTORY_WINDOW` assistant messages that carried
/// tool calls all made the exact same call (spec §4.J.3's history-based
/// check, distinct from the per-turn `LoopState` tracking).
pub fn history_loop_detected(messages: &[Message]) -> bool {
    let signatures: Vec<String> = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant && m.has_tool_calls())
        .take(HISTORY_WINDOW)
        .filter_map(|m| {
            let calls = m.tool_calls.as_ref()?;
            let first = calls.first()?;
            Some(tool_signature(&first.name, &first.arguments))
        })
        .collect();

    signatures.len() == HISTORY_WINDOW && signatures.windows(2).all(|w| w[0] == w[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_tool_msg(id: i64, name: &str, args: Value) -> Message {
        Message {
            id,
            conversation_id: "c1".into(),
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![warden_domain::model::ToolCall { id: format!("t{id}"), name: name.into(), arguments: args }]),
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn duplicate_signature_is_stable_for_same_input() {
        let args = json!({"path": "a.txt"});
        assert_eq!(duplicate_signature("read_file", &args), duplicate_signature("read_file", &args));
    }

    #[test]
    fn duplicate_signature_differs_by_tool_name() {
        let args = json!({"path": "a.txt"});
        assert_ne!(duplicate_signature("read_file", &args), duplicate_signature("write_file", &args));
    }

    #[test]
    fn history_loop_detected_on_three_identical_calls() {
        let args = json!({"path": "a.txt"});
        let messages = vec![
            assistant_tool_msg(1, "read_file", args.clone()),
            assistant_tool_msg(2, "read_file", args.clone()),
            assistant_tool_msg(3, "read_file", args),
        ];
        assert!(history_loop_detected(&messages));
    }

    #[test]
    fn history_loop_not_detected_when_args_differ() {
        let messages = vec![
            assistant_tool_msg(1, "read_file", json!({"path": "a.txt"})),
            assistant_tool_msg(2, "read_file", json!({"path": "b.txt"})),
            assistant_tool_msg(3, "read_file", json!({"path": "c.txt"})),
        ];
        assert!(!history_loop_detected(&messages));
    }

    #[test]
    fn history_loop_not_detected_with_fewer_than_window_messages() {
        let messages = vec![assistant_tool_msg(1, "read_file", json!({"path": "a.txt"}))];
        assert!(!history_loop_detected(&messages));
    }
}
