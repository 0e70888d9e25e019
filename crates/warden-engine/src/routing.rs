//! RoutingAgent (spec §4.H): single-shot depth classification. New module —
//! grounded on `original_source/user_container/agent/routing.py` (single
//! digit `0`/`1` classification, parse-failure-defaults-to-1, last-N-message
//! context with per-message 200-char truncation) translated into the
//! teacher's provider-call idiom (`LlmRouter::chat_for_role` via the
//! `routing` factory).

use warden_domain::model::{Message, Role};
use warden_domain::Result;
use warden_providers::{ChatRequest, LlmRouter, ToolChoice, ROLE_ROUTING};

/// How many prior messages (beyond the latest user message) are sent as
/// context for the classification call.
const CONTEXT_TAIL: usize = 6;
/// Per-message truncation applied when building the classification prompt.
const PER_MESSAGE_TRUNCATE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Direct = 0,
    Standard = 1,
}

impl Depth {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

const SYSTEM_PROMPT: &str = "Classify the complexity of the user's latest message given the \
recent conversation context. Respond with a single digit only: 0 for a direct, simple request \
answerable immediately; 1 for anything requiring multi-step reasoning, tool use, or planning. \
Do not explain your answer.";

pub struct RoutingAgent<'a> {
    router: &'a LlmRouter,
}

impl<'a> RoutingAgent<'a> {
    pub fn new(router: &'a LlmRouter) -> Self {
        Self { router }
    }

    /// Classify `user_message` given the tail of `history`. On any
    /// provider error or unparseable reply, defaults to `Depth::Standard`
    /// (spec §4.H: "on any parse failure, default to depth 1").
    pub async fn classify(
        &self,
        history: &[Message],
        user_message: &str,
        job_id: Option<String>,
        conversation_id: Option<String>,
    ) -> Depth {
        let prompt = build_prompt(history, user_message);
        let req = ChatRequest {
            messages: vec![
                warden_domain::tool::Message::system(SYSTEM_PROMPT),
                warden_domain::tool::Message::user(prompt),
            ],
            tool_choice: ToolChoice::None,
            temperature: Some(0.0),
            max_tokens: Some(4),
            component: "routing".into(),
            job_id,
            conversation_id,
            ..Default::default()
        };

        match self.router.chat_for_role(ROLE_ROUTING, req, None).await {
            Ok(resp) => parse_depth(resp.content.as_deref().unwrap_or("")),
            Err(e) => {
                tracing::warn!(error = %e, "routing classification failed, defaulting to depth 1");
                Depth::Standard
            }
        }
    }
}

fn parse_depth(raw: &str) -> Depth {
    match raw.trim().chars().find(|c| c.is_ascii_digit()) {
        Some('0') => Depth::Direct,
        Some('1') => Depth::Standard,
        _ => Depth::Standard,
    }
}

fn build_prompt(history: &[Message], user_message: &str) -> String {
    let tail: Vec<&Message> = history.iter().rev().take(CONTEXT_TAIL).rev().collect();
    let mut out = String::new();
    if !tail.is_empty() {
        out.push_str("RECENT CONTEXT:\n");
        for m in &tail {
            let label = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let content = m.content.as_deref().unwrap_or("");
            let truncated: String = content.chars().take(PER_MESSAGE_TRUNCATE).collect();
            out.push_str(&format!("{label}: {truncated}\n"));
        }
        out.push('\n');
    }
    out.push_str("LATEST MESSAGE:\n");
    out.push_str(user_message);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zero() {
        assert_eq!(parse_depth("0"), Depth::Direct);
    }

    #[test]
    fn parses_one() {
        assert_eq!(parse_depth("1"), Depth::Standard);
    }

    #[test]
    fn whitespace_and_punctuation_tolerated() {
        assert_eq!(parse_depth("  0\n"), Depth::Direct);
        assert_eq!(parse_depth("Depth: 1"), Depth::Standard);
    }

    #[test]
    fn unparseable_defaults_to_standard() {
        assert_eq!(parse_depth(""), Depth::Standard);
        assert_eq!(parse_depth("I'm not sure"), Depth::Standard);
    }

    #[test]
    fn prompt_truncates_long_context_messages() {
        let long = "x".repeat(1000);
        let history = vec![Message {
            id: 1,
            conversation_id: "c1".into(),
            role: Role::User,
            content: Some(long),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: false,
            created_at: chrono::Utc::now(),
        }];
        let prompt = build_prompt(&history, "hi");
        assert!(prompt.len() < 1000);
    }
}
