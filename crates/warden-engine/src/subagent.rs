//! Delegate / Explore sub-agent executors (spec §4.I): bounded tool-using
//! loops driven by the `cheap` role, sharing the parent's cancellation
//! fabric but never writing to the parent conversation and never recursing.
//!
//! Grounded on the teacher's `gateway/runtime/agent.rs` (`AgentContext`,
//! cancel-group registration, draining a child turn to a single result
//! string) generalized to the fixed step bounds and restricted tool subsets
//! spec §4.I names, trimming the teacher's richer per-agent workspace/
//! skills/model-override scoping down to what the spec actually uses.

use serde::Serialize;

use warden_domain::tool::{self, ToolChoice};
use warden_providers::{ChatRequest, LlmRouter, ROLE_CHEAP};

use crate::cancel::CancelToken;
use crate::tools::{ToolContext, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubagentResult {
    pub status: SubagentStatus,
    pub output: String,
    pub steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentKind {
    Delegate,
    Explore,
}

impl SubagentKind {
    fn max_steps(self) -> u32 {
        match self {
            SubagentKind::Delegate => 10,
            SubagentKind::Explore => 15,
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            SubagentKind::Delegate => {
                "You are a delegate sub-agent executing one bounded task on behalf of a parent \
                 agent. You do not have access to delegate_task yourself. Work the task to \
                 completion or report why you cannot, then stop calling tools and reply with a \
                 single summary of what you did or found."
            }
            SubagentKind::Explore => {
                "You are a read-only explore sub-agent. You may only read files, list \
                 directories, search text, and recall prior chat context — you cannot write, \
                 execute, or delegate. Investigate the task, then stop calling tools and reply \
                 with a single summary of what you found."
            }
        }
    }

    /// Tool names visible to this sub-agent kind (spec §4.I: delegate omits
    /// the delegate tool; explore is restricted to read-only tools).
    pub fn allowed_tools(self) -> &'static [&'static str] {
        match self {
            SubagentKind::Delegate => &[
                "read_file",
                "write_file",
                "list_dir",
                "search_in_files",
                "recall_from_chat",
                "shell",
                "explore_task",
            ],
            SubagentKind::Explore => &["read_file", "list_dir", "search_in_files", "recall_from_chat"],
        }
    }
}

/// Runs one bounded sub-agent loop to completion. Shares the tool-dispatch
/// protocol with the main loop, but has no loop detection (the step bound
/// is the safety net) and persists nothing to the parent's conversation.
pub async fn run_subagent(
    kind: SubagentKind,
    task: &str,
    router: &LlmRouter,
    tools: &ToolRegistry,
    cancel: &CancelToken,
) -> SubagentResult {
    let mut history = vec![
        tool::Message::system(kind.system_prompt()),
        tool::Message::user(task),
    ];

    let ctx = ToolContext {
        cancel: cancel.clone(),
        ..Default::default()
    };

    for step in 1..=kind.max_steps() {
        if cancel.is_cancelled() {
            return SubagentResult {
                status: SubagentStatus::Error,
                output: String::new(),
                steps: step - 1,
                error: Some("cancelled".into()),
            };
        }

        let defs = tools.specs_for(kind.allowed_tools());
        let req = ChatRequest {
            messages: history.clone(),
            tools: defs,
            tool_choice: ToolChoice::Auto,
            max_tokens: Some(8 * 1024),
            component: match kind {
                SubagentKind::Delegate => "delegate".into(),
                SubagentKind::Explore => "explore".into(),
            },
            ..Default::default()
        };

        let resp = match router.chat_for_role(ROLE_CHEAP, req, None).await {
            Ok(r) => r,
            Err(e) => {
                return SubagentResult {
                    status: SubagentStatus::Error,
                    output: String::new(),
                    steps: step,
                    error: Some(e.to_string()),
                }
            }
        };

        if resp.tool_calls.is_empty() {
            let output = resp.content.unwrap_or_default();
            return SubagentResult {
                status: SubagentStatus::Success,
                output,
                steps: step,
                error: None,
            };
        }

        let assistant_msg = tool::Message {
            role: tool::Role::Assistant,
            content: tool::MessageContent::Parts(
                resp.tool_calls
                    .iter()
                    .map(|c| tool::ContentPart::ToolUse {
                        id: c.call_id.clone(),
                        name: c.tool_name.clone(),
                        input: c.arguments.clone(),
                    })
                    .collect(),
            ),
            thinking: resp.thinking,
            thinking_signature: resp.thinking_signature,
        };
        history.push(assistant_msg);

        for call in &resp.tool_calls {
            if cancel.is_cancelled() {
                return SubagentResult {
                    status: SubagentStatus::Error,
                    output: String::new(),
                    steps: step,
                    error: Some("cancelled".into()),
                };
            }
            let result = tools.call(&call.tool_name, call.arguments.clone(), &ctx).await;
            let (content, is_error) = match result {
                Ok(v) => (v.to_string(), false),
                Err(e) => (e.to_string(), true),
            };
            let mut msg = tool::Message::tool_result(&call.call_id, content);
            if is_error {
                if let tool::MessageContent::Parts(parts) = &mut msg.content {
                    if let Some(tool::ContentPart::ToolResult { is_error, .. }) = parts.get_mut(0) {
                        *is_error = true;
                    }
                }
            }
            history.push(msg);
        }
    }

    SubagentResult {
        status: SubagentStatus::Timeout,
        output: String::new(),
        steps: kind.max_steps(),
        error: Some(format!("step bound ({}) reached", kind.max_steps())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegate_cannot_see_delegate_task() {
        assert!(!SubagentKind::Delegate.allowed_tools().contains(&"delegate_task"));
    }

    #[test]
    fn explore_is_read_only() {
        let tools = SubagentKind::Explore.allowed_tools();
        assert!(!tools.contains(&"write_file"));
        assert!(!tools.contains(&"shell"));
        assert!(tools.contains(&"read_file"));
    }

    #[test]
    fn step_bounds_match_spec() {
        assert_eq!(SubagentKind::Delegate.max_steps(), 10);
        assert_eq!(SubagentKind::Explore.max_steps(), 15);
    }
}
