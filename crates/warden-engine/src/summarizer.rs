//! Rolling conversation summary (spec §4.F): an incremental, threshold
//! triggered digest distinct from `context`'s turn-count-triggered
//! compaction. Grounded on the teacher's `compact.rs::generate_summary`
//! prompt-construction style (temperature 0.1, bounded max_tokens, explicit
//! retention instructions), adapted to the incremental update cadence.

use warden_domain::model::{Conversation, Message, Role};
use warden_domain::Result;
use warden_providers::{ChatRequest, LlmRouter, ToolChoice, ROLE_CHEAP};
use warden_store::Store;

/// Below this total message count, no summary is attempted yet.
pub const INITIAL_THRESHOLD: i64 = 15;
/// Once a summary exists, refresh it every `UPDATE_INTERVAL` new messages.
pub const UPDATE_INTERVAL: i64 = 10;

const TOOL_OUTPUT_PREVIEW: usize = 200;

pub struct ConversationSummarizer<'a> {
    store: &'a Store,
    router: &'a LlmRouter,
}

impl<'a> ConversationSummarizer<'a> {
    pub fn new(store: &'a Store, router: &'a LlmRouter) -> Self {
        Self { store, router }
    }

    /// Whether a (re)summarization pass should run for this conversation.
    pub fn should_update_summary(&self, conversation: &Conversation, total_messages: i64) -> bool {
        match conversation.summary_up_to_message_id {
            None => total_messages >= INITIAL_THRESHOLD,
            Some(up_to) => {
                let last_id = self.store.message_count(&conversation.id) as i64;
                last_id - up_to >= UPDATE_INTERVAL
            }
        }
    }

    /// Generate (or refine) the summary synchronously, persisting the new
    /// summary text and high-water `summary_up_to_message_id`.
    pub async fn generate_summary_sync(
        &self,
        conversation: &Conversation,
        job_id: Option<String>,
    ) -> Result<String> {
        let all_messages = self.store.list_messages(&conversation.id);
        let up_to = conversation.summary_up_to_message_id.unwrap_or(0);
        let new_messages: Vec<&Message> = all_messages.iter().filter(|m| m.id > up_to).collect();

        let last_id = new_messages.last().map(|m| m.id).unwrap_or(up_to);
        if new_messages.is_empty() {
            return Ok(conversation.summary.clone().unwrap_or_default());
        }

        let formatted = format_turns(&new_messages);
        let prior = conversation.summary.clone().unwrap_or_default();

        let prompt = build_prompt(&prior, &formatted);
        let req = ChatRequest {
            messages: vec![warden_domain::tool::Message::user(prompt)],
            tool_choice: ToolChoice::None,
            temperature: Some(0.1),
            max_tokens: Some(1200),
            component: "conversation_summary".into(),
            job_id,
            conversation_id: Some(conversation.id.clone()),
            ..Default::default()
        };

        let resp = self.router.chat_for_role(ROLE_CHEAP, req, None).await?;
        let summary = resp.content.unwrap_or(prior);

        self.store
            .save_conversation_summary(&conversation.id, summary.clone(), last_id)?;
        Ok(summary)
    }

    /// Build the short injection message that precedes recent history when
    /// a summary exists: how many earlier messages are hidden plus the
    /// summary itself and guidance to recall exact values on demand.
    pub fn build_context_header(total: i64, visible: i64, summary: Option<&str>) -> Option<String> {
        let summary = summary?;
        let hidden = (total - visible).max(0);
        Some(format!(
            "[Context] {hidden} earlier message(s) are summarized below; {visible} recent \
             message(s) follow verbatim. If you need an exact earlier value (a price, name, \
             path, or decision) that isn't in the summary, use recall_from_chat.\n\n{summary}"
        ))
    }
}

fn format_turns(messages: &[&Message]) -> String {
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
        match m.role {
            Role::Tool => {
                let content = m.content.as_deref().unwrap_or("");
                if content.len() > TOOL_OUTPUT_PREVIEW {
                    out.push_str(&content[..TOOL_OUTPUT_PREVIEW]);
                    out.push_str(" […]");
                } else {
                    out.push_str(content);
                }
            }
            _ => out.push_str(m.content.as_deref().unwrap_or("")),
        }
        out.push('\n');
    }
    out
}

fn build_prompt(prior_summary: &str, new_turns: &str) -> String {
    let prior_section = if prior_summary.is_empty() {
        String::new()
    } else {
        format!("EXISTING SUMMARY:\n{prior_summary}\n\n")
    };
    format!(
        "Update the conversation summary below with the new turns that follow. \
         Write concise bullet points that retain concrete values (prices, names, paths, \
         decisions) and the current task state. Do not drop facts already in the existing \
         summary unless they have been explicitly superseded.\n\n{prior_section}NEW TURNS:\n{new_turns}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Store::open(dir.path()).unwrap(), dir)
    }

    fn router() -> LlmRouter {
        LlmRouter::from_config(&warden_domain::config::LlmConfig::default()).unwrap()
    }

    #[test]
    fn should_update_when_crossing_initial_threshold() {
        let (store, _dir) = store();
        let conv = store.create_conversation(None).unwrap();
        let router = router();
        let summarizer = ConversationSummarizer::new(&store, &router);
        assert!(!summarizer.should_update_summary(&conv, 5));
        assert!(summarizer.should_update_summary(&conv, 16));
    }

    #[test]
    fn should_update_when_interval_exceeded() {
        let (store, _dir) = store();
        let mut conv = store.create_conversation(None).unwrap();
        conv.summary = Some("so far...".into());
        conv.summary_up_to_message_id = Some(0);
        for i in 0..12 {
            store
                .append_message(
                    &conv.id,
                    Message {
                        id: 0,
                        conversation_id: conv.id.clone(),
                        role: Role::User,
                        content: Some(format!("msg {i}")),
                        tool_calls: None,
                        tool_call_id: None,
                        thinking: None,
                        thinking_signature: None,
                        metadata: None,
                        internal: false,
                        created_at: chrono::Utc::now(),
                    },
                )
                .unwrap();
        }
        let router = router();
        let summarizer = ConversationSummarizer::new(&store, &router);
        assert!(summarizer.should_update_summary(&conv, 12));
    }

    #[test]
    fn context_header_mentions_hidden_count() {
        let header = ConversationSummarizer::build_context_header(20, 6, Some("recap")).unwrap();
        assert!(header.contains("14 earlier"));
        assert!(header.contains("recap"));
    }

    #[test]
    fn context_header_absent_without_summary() {
        assert!(ConversationSummarizer::build_context_header(20, 6, None).is_none());
    }

}
