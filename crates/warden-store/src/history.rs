//! `get_conversation_history` — §4.A's non-trivial compression helper.
//!
//! Pure functions over message slices so the compression algorithm can be
//! exercised without touching disk. Grounded on the teacher's
//! `gateway/runtime/compact.rs::split_for_compaction` (walk backward counting
//! user turns to find a safe keep boundary) generalized from transcript
//! lines to the persisted `Message` model and extended with the tool-result
//! and tool-argument compression spec.md §4.A.3/4 actually asks for.

use serde_json::{json, Value};

use warden_domain::model::{Message, Role};
use warden_domain::tool::{self, ContentPart, MessageContent};

const THINKING_PLACEHOLDER: &str = "[earlier reasoning omitted]";
const NEW_TOOL_RESULT_LIMIT: usize = 4 * 1024;
const NEW_TOOL_RESULT_HEAD: usize = 1536;
const NEW_TOOL_RESULT_TAIL: usize = 1536;
const NEW_TOOL_ARGS_LIMIT: usize = 2 * 1024;

/// Walk backward from the end, counting non-internal user messages. The
/// `recent_exchanges`-th one found is the safe split boundary: messages at
/// and after it stay verbatim (lightly truncated); everything before is
/// aggressively compressed. Returns `None` if fewer than `recent_exchanges`
/// non-internal user messages exist, in which case compression is skipped
/// entirely.
pub fn safe_split_index(messages: &[Message], recent_exchanges: usize) -> Option<usize> {
    if recent_exchanges == 0 {
        return Some(messages.len());
    }
    let mut user_count = 0;
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::User && !m.internal {
            user_count += 1;
            if user_count == recent_exchanges {
                return Some(i);
            }
        }
    }
    None
}

/// Build a `tool_call_id -> (tool_name, arguments)` map by scanning every
/// assistant tool_calls entry once. Used to compress tool-result content
/// (which only carries the call id) by the name of the tool that produced it.
fn tool_call_index(messages: &[Message]) -> std::collections::HashMap<String, (String, Value)> {
    let mut index = std::collections::HashMap::new();
    for m in messages {
        if let Some(calls) = &m.tool_calls {
            for call in calls {
                index.insert(call.id.clone(), (call.name.clone(), call.arguments.clone()));
            }
        }
    }
    index
}

/// Compress the result of a single tool call down to a one-line summary,
/// keyed by tool name (spec §4.A.3).
fn compress_tool_result(tool_name: &str, arguments: Option<&Value>, content: &str) -> String {
    match tool_name {
        "write_file" | "file_write" => "[File written successfully]".to_string(),
        "read_file" | "file_read" => {
            let lines = content.lines().count();
            format!("[Read file: {lines} lines]")
        }
        "shell" => {
            let cmd = arguments
                .and_then(|a| a.get("command"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let first_line = truncate(cmd.lines().next().unwrap_or(""), 80);
            format!("[Ran: {first_line}]")
        }
        other => format!("[{other} result omitted]"),
    }
}

/// Compress tool-call arguments to a minimal stub, preserving a `path` or
/// `query` key verbatim if present, else the first line of the serialized
/// arguments (spec §4.A.3).
fn compress_tool_call_args(args: &Value) -> Value {
    if let Some(obj) = args.as_object() {
        if let Some(path) = obj.get("path") {
            return json!({ "path": path });
        }
        if let Some(query) = obj.get("query") {
            return json!({ "query": query });
        }
    }
    let serialized = args.to_string();
    let first_line = truncate(serialized.lines().next().unwrap_or(""), 120);
    json!({ "_stub": first_line })
}

/// Light truncation applied to messages after the split point: tool results
/// over 4kB get a head/middle-marker/tail treatment; bulky write/edit/shell
/// arguments over 2kB collapse to a structured stub (spec §4.A.4).
fn truncate_tool_result_light(content: &str) -> String {
    if content.len() <= NEW_TOOL_RESULT_LIMIT {
        return content.to_string();
    }
    let head = safe_prefix(content, NEW_TOOL_RESULT_HEAD);
    let tail = safe_suffix(content, NEW_TOOL_RESULT_TAIL);
    format!("{head}\n... [{} bytes omitted] ...\n{tail}", content.len() - head.len() - tail.len())
}

fn truncate_tool_args_light(tool_name: &str, args: &Value) -> Value {
    let is_bulky_writer = matches!(tool_name, "write_file" | "file_write" | "edit_file" | "shell");
    if !is_bulky_writer {
        return args.clone();
    }
    let serialized = args.to_string();
    if serialized.len() <= NEW_TOOL_ARGS_LIMIT {
        return args.clone();
    }
    let path = args.as_object().and_then(|o| o.get("path")).cloned();
    json!({ "path": path, "size_bytes": serialized.len(), "_stub": true })
}

fn safe_prefix(s: &str, max: usize) -> &str {
    let mut b = max.min(s.len());
    while b > 0 && !s.is_char_boundary(b) {
        b -= 1;
    }
    &s[..b]
}

fn safe_suffix(s: &str, max: usize) -> &str {
    let start = s.len().saturating_sub(max);
    let mut b = start;
    while b < s.len() && !s.is_char_boundary(b) {
        b += 1;
    }
    &s[b..]
}

fn truncate(s: &str, max: usize) -> String {
    let prefix = safe_prefix(s, max);
    if prefix.len() == s.len() {
        prefix.to_string()
    } else {
        format!("{prefix}...")
    }
}

/// Convert one persisted `Message` into its provider-neutral wire form,
/// optionally compressing it as an "old" (pre-split) message.
fn to_wire(msg: &Message, calls: &std::collections::HashMap<String, (String, Value)>, compress: bool) -> tool::Message {
    let role = match msg.role {
        Role::System => tool::Role::System,
        Role::User => tool::Role::User,
        Role::Assistant => tool::Role::Assistant,
        Role::Tool => tool::Role::Tool,
    };

    let content = if msg.role == Role::Tool {
        let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
        let raw = msg.content.clone().unwrap_or_default();
        let text = if compress {
            let (name, args) = calls
                .get(&tool_use_id)
                .cloned()
                .unwrap_or_else(|| ("unknown".to_string(), Value::Null));
            compress_tool_result(&name, Some(&args), &raw)
        } else {
            truncate_tool_result_light(&raw)
        };
        MessageContent::Parts(vec![ContentPart::ToolResult {
            tool_use_id,
            content: text,
            is_error: false,
        }])
    } else if msg.has_tool_calls() {
        let mut parts = Vec::new();
        if let Some(text) = &msg.content {
            if !text.is_empty() {
                parts.push(ContentPart::Text { text: text.clone() });
            }
        }
        for call in msg.tool_calls.as_ref().unwrap() {
            let input = if compress {
                compress_tool_call_args(&call.arguments)
            } else {
                truncate_tool_args_light(&call.name, &call.arguments)
            };
            parts.push(ContentPart::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input,
            });
        }
        MessageContent::Parts(parts)
    } else {
        MessageContent::Text(msg.content.clone().unwrap_or_default())
    };

    let thinking = if compress {
        msg.thinking.as_ref().map(|_| THINKING_PLACEHOLDER.to_string())
    } else {
        msg.thinking.clone()
    };

    tool::Message {
        role,
        content,
        thinking,
        thinking_signature: if compress { None } else { msg.thinking_signature.clone() },
    }
}

/// The full §4.A.1-6 algorithm. `messages` must already be in ascending
/// `id` order (the order `MessageTable` stores them in).
pub fn get_conversation_history(
    messages: &[Message],
    compress_old: bool,
    recent_exchanges: usize,
) -> Vec<tool::Message> {
    let calls = tool_call_index(messages);

    let split = if compress_old {
        safe_split_index(messages, recent_exchanges)
    } else {
        None
    };

    match split {
        Some(split) => {
            let mut out: Vec<tool::Message> = messages[..split]
                .iter()
                .map(|m| to_wire(m, &calls, true))
                .collect();
            out.extend(messages[split..].iter().map(|m| to_wire(m, &calls, false)));
            out
        }
        None => messages.iter().map(|m| to_wire(m, &calls, false)).collect(),
    }
}

/// Walk the sequence and confirm every assistant message carrying N
/// tool_calls is immediately followed by exactly N tool messages whose
/// `tool_use_id`s match, in order, with nothing interleaved (the universal
/// invariant from spec §8).
pub fn validate_tool_pairing(messages: &[tool::Message]) -> bool {
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.role != tool::Role::Assistant {
            i += 1;
            continue;
        }
        let call_ids: Vec<&str> = match &msg.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => Vec::new(),
        };
        if call_ids.is_empty() {
            i += 1;
            continue;
        }
        for (offset, expected_id) in call_ids.iter().enumerate() {
            let Some(next) = messages.get(i + 1 + offset) else {
                return false;
            };
            if next.role != tool::Role::Tool {
                return false;
            }
            let matches = match &next.content {
                MessageContent::Parts(parts) => parts.iter().any(|p| {
                    matches!(p, ContentPart::ToolResult { tool_use_id, .. } if tool_use_id == expected_id)
                }),
                MessageContent::Text(_) => false,
            };
            if !matches {
                return false;
            }
        }
        i += 1 + call_ids.len();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_domain::model::ToolCall as ModelToolCall;
    use warden_domain::model::Role as ModelRole;

    fn user(id: i64, content: &str, internal: bool) -> Message {
        Message {
            id,
            conversation_id: "c1".into(),
            role: ModelRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal,
            created_at: chrono::Utc::now(),
        }
    }

    fn assistant_with_tool(id: i64, call_id: &str, tool_name: &str, args: Value) -> Message {
        Message {
            id,
            conversation_id: "c1".into(),
            role: ModelRole::Assistant,
            content: None,
            tool_calls: Some(vec![ModelToolCall {
                id: call_id.into(),
                name: tool_name.into(),
                arguments: args,
            }]),
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: true,
            created_at: chrono::Utc::now(),
        }
    }

    fn tool_result(id: i64, call_id: &str, content: &str) -> Message {
        Message {
            id,
            conversation_id: "c1".into(),
            role: ModelRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn split_finds_nth_user_message_from_end() {
        let messages = vec![
            user(1, "one", false),
            user(2, "two", false),
            user(3, "three", false),
        ];
        assert_eq!(safe_split_index(&messages, 2), Some(1));
    }

    #[test]
    fn split_none_when_not_enough_user_messages() {
        let messages = vec![user(1, "one", false)];
        assert_eq!(safe_split_index(&messages, 5), None);
    }

    #[test]
    fn split_ignores_internal_user_messages() {
        let messages = vec![user(1, "hidden", true), user(2, "visible", false)];
        assert_eq!(safe_split_index(&messages, 1), Some(1));
    }

    #[test]
    fn old_tool_results_compressed_by_tool_name() {
        let messages = vec![
            user(1, "write the file", false),
            assistant_with_tool(2, "call1", "write_file", json!({"path": "/a.txt"})),
            tool_result(3, "call1", "ok"),
            user(4, "second turn", false),
            user(5, "third turn", false),
        ];
        let history = get_conversation_history(&messages, true, 2);
        // split keeps the last 2 user turns (id 4, 5); id 1-3 are compressed.
        let compressed_tool_msg = &history[2];
        match &compressed_tool_msg.content {
            MessageContent::Parts(parts) => {
                let ContentPart::ToolResult { content, .. } = &parts[0] else {
                    panic!("expected tool result");
                };
                assert_eq!(content, "[File written successfully]");
            }
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn pairing_invariant_holds_after_compression() {
        let messages = vec![
            user(1, "a", false),
            assistant_with_tool(2, "call1", "read_file", json!({"path": "/x"})),
            tool_result(3, "call1", "a\nb\nc"),
            user(4, "b", false),
            user(5, "c", false),
        ];
        let history = get_conversation_history(&messages, true, 1);
        assert!(validate_tool_pairing(&history));
    }

    #[test]
    fn skip_compression_when_not_enough_turns() {
        let messages = vec![user(1, "only one turn", false)];
        let history = get_conversation_history(&messages, true, 5);
        assert_eq!(history.len(), 1);
        // Not compressed: content preserved verbatim.
        assert_eq!(history[0].content.text(), Some("only one turn"));
    }

    #[test]
    fn new_tool_result_truncated_when_oversized() {
        let big = "x".repeat(5000);
        let messages = vec![
            user(1, "go", false),
            assistant_with_tool(2, "call1", "shell", json!({"command": "cat big"})),
            tool_result(3, "call1", &big),
        ];
        let history = get_conversation_history(&messages, true, 5);
        // not enough user turns to compress -> but new-path truncation
        // only applies inside the compressed branch; verify via direct call.
        let light = truncate_tool_result_light(&big);
        assert!(light.len() < big.len());
        assert!(light.contains("omitted"));
        let _ = history;
    }

    #[test]
    fn validate_pairing_rejects_missing_tool_result() {
        let broken = vec![
            tool::Message::user("hi"),
            tool::Message {
                role: tool::Role::Assistant,
                content: MessageContent::Parts(vec![ContentPart::ToolUse {
                    id: "call1".into(),
                    name: "read_file".into(),
                    input: json!({}),
                }]),
                thinking: None,
                thinking_signature: None,
            },
            tool::Message::assistant("oops, no tool result"),
        ];
        assert!(!validate_tool_pairing(&broken));
    }
}
