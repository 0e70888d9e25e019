//! Context window management (spec §4.E): token estimation, the five-step
//! `compress()` pipeline, and the mandatory post-validation fallback.
//!
//! Grounded on the teacher's `gateway/runtime/compact.rs` (`should_compact`,
//! `split_for_compaction`, `build_conversation_text` truncation), extended
//! with the plan-preservation step and the stricter post-validation
//! fallback-to-original behavior the teacher's compaction does not perform
//! (it always appends its summary marker; here an invariant violation must
//! discard the compressed result and keep the original).

use warden_domain::tool::{self, ContentPart, MessageContent, Role};
use warden_domain::Result;
use warden_providers::{ChatRequest, LlmRouter, ToolChoice};
use warden_store::history::validate_tool_pairing;

/// Rough token estimate: ~4 characters per token, matching the teacher's
/// summarization-prompt sizing heuristics.
const CHARS_PER_TOKEN: usize = 4;

/// Marker the main loop's planning injection wraps its plan text in
/// (spec §4.J.2 step 5's "planning injection").
pub const PLAN_MARKER: &str = "<plan>";

pub struct ContextManager {
    /// Fraction of `max_tokens` at which compression kicks in (default 0.7).
    pub threshold: f32,
    pub max_tokens: usize,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            max_tokens: 200_000,
        }
    }
}

fn message_char_len(m: &tool::Message) -> usize {
    let mut len = match &m.content {
        MessageContent::Text(t) => t.len(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.len(),
                ContentPart::ToolUse { input, .. } => input.to_string().len(),
                ContentPart::ToolResult { content, .. } => content.len(),
                ContentPart::Image { url, .. } => url.len(),
            })
            .sum(),
    };
    len += m.thinking.as_ref().map(|t| t.len()).unwrap_or(0);
    len
}

impl ContextManager {
    pub fn estimate_tokens(&self, messages: &[tool::Message]) -> usize {
        messages.iter().map(message_char_len).sum::<usize>() / CHARS_PER_TOKEN
    }

    pub fn usage_percent(&self, messages: &[tool::Message]) -> f32 {
        self.estimate_tokens(messages) as f32 / self.max_tokens as f32
    }

    pub fn should_compress(&self, messages: &[tool::Message]) -> bool {
        messages.len() > 4 && self.usage_percent(messages) >= self.threshold
    }

    /// The five-step compression pipeline plus post-validation fallback
    /// (spec §4.E steps 1-6).
    pub async fn compress(
        &self,
        messages: Vec<tool::Message>,
        preserve_plan: bool,
        router: &LlmRouter,
        job_id: Option<String>,
        conversation_id: Option<String>,
    ) -> Result<Vec<tool::Message>> {
        // Step 1: below threshold or too short, return unchanged.
        if !self.should_compress(&messages) {
            return Ok(messages);
        }

        let system = messages.first().filter(|m| m.role == Role::System).cloned();
        let body_start = if system.is_some() { 1 } else { 0 };
        let body = &messages[body_start..];

        // Step 2: safe split point, only at non-internal user-message
        // boundaries, counted from the tail — reuse the same halving
        // heuristic the history compressor uses (keep roughly the last
        // quarter of the body verbatim).
        let keep_from = safe_split_point(body);
        if keep_from == 0 {
            return Ok(messages);
        }
        let mut middle: Vec<tool::Message> = body[..keep_from].to_vec();
        let recent: Vec<tool::Message> = body[keep_from..].to_vec();

        // Step 3: pull the plan message out of the middle, if preserving.
        let plan_msg = if preserve_plan {
            extract_plan_message(&mut middle)
        } else {
            None
        };

        if middle.is_empty() {
            return Ok(messages);
        }

        // Step 4: summarize the middle via the cheap role.
        let summary = match summarize(router, &middle, job_id, conversation_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "context compression summarization failed, keeping original history");
                return Ok(messages);
            }
        };

        // Step 5: reassemble.
        let mut rebuilt = Vec::with_capacity(recent.len() + 3);
        if let Some(sys) = system {
            rebuilt.push(sys);
        }
        rebuilt.push(tool::Message::user(format!(
            "[Previous context summary]\n{summary}"
        )));
        if let Some(plan) = plan_msg {
            rebuilt.push(plan);
        }
        rebuilt.extend(recent);

        // Step 6: post-validation. An invariant violation discards the
        // compressed result and keeps the original, never half-applies.
        if validate_tool_pairing(&rebuilt) {
            Ok(rebuilt)
        } else {
            tracing::warn!("compressed history failed tool-pairing validation, keeping original");
            Ok(messages)
        }
    }
}

/// Find the boundary that keeps the trailing ~25% of the body (by message
/// count) as "recent", never splitting inside a tool_use/tool_result pair.
/// Grounded on `compact.rs::split_for_compaction`'s backward user-turn walk,
/// adapted to count messages rather than `TranscriptLine` turns.
fn safe_split_point(body: &[tool::Message]) -> usize {
    if body.len() < 4 {
        return 0;
    }
    let mut candidate = body.len() / 4 * 3;
    while candidate > 0 && body[candidate].role == Role::Tool {
        candidate -= 1;
    }
    candidate
}

fn extract_plan_message(middle: &mut Vec<tool::Message>) -> Option<tool::Message> {
    let idx = middle.iter().position(|m| {
        m.content
            .text()
            .map(|t| t.contains(PLAN_MARKER))
            .unwrap_or(false)
    })?;
    let mut plan = middle.remove(idx);
    plan.thinking = plan.thinking.clone();
    // The plan's own tool_calls would now dangle (their results live in the
    // part of the middle being summarized away), so render it as plain text.
    if let MessageContent::Parts(parts) = &plan.content {
        let text: String = parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        plan.content = MessageContent::Text(text);
    }
    Some(plan)
}

const SUMMARIZE_PROMPT_PREFIX: &str = "Summarize the following conversation excerpt into a \
concise digest that preserves the current goal, key decisions, open threads, and any concrete \
values (prices, names, paths) mentioned. Write in present tense, omit pleasantries.\n\nEXCERPT:\n";

async fn summarize(
    router: &LlmRouter,
    middle: &[tool::Message],
    job_id: Option<String>,
    conversation_id: Option<String>,
) -> Result<String> {
    let transcript = render_transcript(middle);
    let req = ChatRequest {
        messages: vec![tool::Message::user(format!(
            "{SUMMARIZE_PROMPT_PREFIX}{transcript}"
        ))],
        tool_choice: ToolChoice::None,
        temperature: Some(0.1),
        max_tokens: Some(2000),
        component: "context_compress".into(),
        job_id,
        conversation_id,
        ..Default::default()
    };
    let resp = router.chat_for_role(warden_providers::ROLE_CHEAP, req, None).await?;
    Ok(resp.content.unwrap_or_default())
}

fn render_transcript(messages: &[tool::Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let label = match m.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&m.content.extract_all_text());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, text: &str) -> tool::Message {
        tool::Message {
            role,
            content: MessageContent::Text(text.into()),
            thinking: None,
            thinking_signature: None,
        }
    }

    #[test]
    fn estimate_tokens_scales_with_content_length() {
        let cm = ContextManager::default();
        let short = vec![msg(Role::User, "hi")];
        let long = vec![msg(Role::User, &"x".repeat(4000))];
        assert!(cm.estimate_tokens(&long) > cm.estimate_tokens(&short));
    }

    #[test]
    fn should_compress_false_below_threshold() {
        let cm = ContextManager {
            threshold: 0.7,
            max_tokens: 1_000_000,
        };
        let messages = vec![msg(Role::User, "hello"); 10];
        assert!(!cm.should_compress(&messages));
    }

    #[test]
    fn should_compress_true_when_large() {
        let cm = ContextManager {
            threshold: 0.1,
            max_tokens: 100,
        };
        let messages: Vec<_> = (0..20).map(|_| msg(Role::User, &"x".repeat(100))).collect();
        assert!(cm.should_compress(&messages));
    }

    #[tokio::test]
    async fn compress_below_threshold_is_idempotent() {
        let cm = ContextManager::default();
        let messages = vec![msg(Role::User, "hi"), msg(Role::Assistant, "hello")];
        // below threshold — compress() must not even attempt a router call.
        let router = LlmRouter::from_config(&warden_domain::config::LlmConfig::default()).unwrap();
        let out = cm
            .compress(messages.clone(), true, &router, None, None)
            .await
            .unwrap();
        assert_eq!(out.len(), messages.len());
    }

    #[test]
    fn safe_split_point_never_starts_on_tool_role() {
        let mut body = vec![msg(Role::User, "a"); 8];
        body[5] = tool::Message::tool_result("call-1", "result");
        let split = safe_split_point(&body);
        assert_ne!(body[split].role, Role::Tool);
    }
}
