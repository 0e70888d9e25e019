//! SkillRouter (spec §4.G): per-turn TTL-based active-skill selection.
//!
//! Grounded on `original_source/user_container/agent/skill_router.py` (the
//! add/keep/drop JSON contract, TTL decay on no-mention, and conversation
//! formatting that always keeps the first user message in view) translated
//! into the teacher's provider-call idiom (`LlmRouter::chat_for_role` via
//! the cheap role), matching `routing.rs`'s treatment of a single-shot
//! classifier call.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use warden_domain::model::{AgentContext, Message, Role};
use warden_providers::{ChatRequest, LlmRouter, ToolChoice, ROLE_CHEAP};

/// Steps a newly added or reconfirmed skill stays active without being
/// mentioned again.
pub const DEFAULT_TTL: i32 = 3;
const HISTORY_LIMIT: usize = 10;
const FIRST_MESSAGE_TRUNCATE: usize = 500;
const MESSAGE_TRUNCATE: usize = 500;
const TOOL_FOLLOWUP_TRUNCATE: usize = 200;

#[derive(Debug, Clone)]
pub struct AvailableSkill {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Deserialize, Default)]
struct RouteDecision {
    #[serde(default)]
    add: Vec<String>,
    #[serde(default)]
    keep: Vec<String>,
    #[serde(default)]
    drop: Vec<String>,
}

pub struct SkillRouter<'a> {
    router: &'a LlmRouter,
    ttl: i32,
}

impl<'a> SkillRouter<'a> {
    pub fn new(router: &'a LlmRouter) -> Self {
        Self { router, ttl: DEFAULT_TTL }
    }

    /// Decide the new active-skills map for this step. On any provider
    /// error or unparseable reply, falls back to decaying every currently
    /// active skill by one (spec §4.G fallback).
    pub async fn route(
        &self,
        history: &[Message],
        available_skills: &[AvailableSkill],
        active: &AgentContext,
        job_id: Option<String>,
        conversation_id: Option<String>,
    ) -> HashMap<String, i32> {
        if available_skills.is_empty() {
            return active.skills.clone();
        }

        let system = build_system_prompt(available_skills, &active.skills);
        let prompt = build_user_prompt(history);

        let req = ChatRequest {
            messages: vec![
                warden_domain::tool::Message::system(system),
                warden_domain::tool::Message::user(prompt),
            ],
            tool_choice: ToolChoice::None,
            temperature: Some(0.0),
            max_tokens: Some(300),
            component: "skill_router".into(),
            job_id,
            conversation_id,
            ..Default::default()
        };

        let content = match self.router.chat_for_role(ROLE_CHEAP, req, None).await {
            Ok(resp) => resp.content,
            Err(e) => {
                tracing::warn!(error = %e, "skill router call failed, decaying active skills");
                return decay(&active.skills);
            }
        };

        let Some(content) = content.filter(|c| !c.is_empty()) else {
            return decay(&active.skills);
        };

        let decision: RouteDecision = match serde_json::from_str(&extract_json(&content)) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "skill router returned invalid JSON, decaying active skills");
                return decay(&active.skills);
            }
        };

        apply_decision(&active.skills, &decision, available_skills, self.ttl)
    }
}

fn apply_decision(
    active: &HashMap<String, i32>,
    decision: &RouteDecision,
    available_skills: &[AvailableSkill],
    ttl: i32,
) -> HashMap<String, i32> {
    let valid_names: HashSet<&str> = available_skills.iter().map(|s| s.name.as_str()).collect();
    let mut updated = active.clone();

    for name in &decision.drop {
        updated.remove(name);
    }
    for name in &decision.keep {
        if updated.contains_key(name) {
            updated.insert(name.clone(), ttl);
        }
    }
    for name in &decision.add {
        if valid_names.contains(name.as_str()) && !updated.contains_key(name) {
            updated.insert(name.clone(), ttl);
        }
    }

    let mentioned: HashSet<&String> = decision
        .add
        .iter()
        .chain(decision.keep.iter())
        .chain(decision.drop.iter())
        .collect();
    for name in updated.keys().cloned().collect::<Vec<_>>() {
        if !mentioned.contains(&name) {
            let entry = updated.get_mut(&name).expect("key from its own keys()");
            *entry -= 1;
            if *entry <= 0 {
                updated.remove(&name);
            }
        }
    }

    updated
}

fn decay(active: &HashMap<String, i32>) -> HashMap<String, i32> {
    let mut updated = active.clone();
    for name in updated.keys().cloned().collect::<Vec<_>>() {
        let entry = updated.get_mut(&name).expect("key from its own keys()");
        *entry -= 1;
        if *entry <= 0 {
            updated.remove(&name);
        }
    }
    updated
}

fn build_system_prompt(available: &[AvailableSkill], active: &HashMap<String, i32>) -> String {
    let skills_json = serde_json::to_string_pretty(
        &available
            .iter()
            .map(|s| serde_json::json!({"name": s.name, "description": s.description}))
            .collect::<Vec<_>>(),
    )
    .unwrap_or_default();

    let active_info = if active.is_empty() {
        "(none)".to_string()
    } else {
        active
            .iter()
            .map(|(name, ttl)| format!("- {name} (TTL={ttl})"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are a skill router. Your job is to analyze a conversation and decide which \
         skills should be active for the AI assistant.\n\nAvailable skills:\n{skills_json}\n\n\
         Currently active skills (with remaining TTL):\n{active_info}\n\nYour task:\n\
         1. Decide which skills from \"Available skills\" should be ADDED (newly needed)\n\
         2. Decide which \"Currently active skills\" should be KEPT (still needed) or DROPPED \
         (no longer needed)\n\nRules:\n\
         - ADD a skill when the user's request clearly matches its description\n\
         - KEEP an active skill if the assistant is still working on a task that needs it\n\
         - DROP an active skill ONLY if the user has EXPLICITLY asked for something unrelated\n\
         - Usually 0-2 skills are sufficient\n\n\
         Return ONLY valid JSON in this exact format: {{\"add\": [], \"keep\": [], \"drop\": []}}"
    )
}

/// Formats the trailing window of history for the router prompt, always
/// keeping the very first user message in view so the original intent
/// survives truncation.
fn build_user_prompt(history: &[Message]) -> String {
    let tail: &[Message] = if history.len() > HISTORY_LIMIT {
        &history[history.len() - HISTORY_LIMIT..]
    } else {
        history
    };

    let mut lines = Vec::new();
    if let Some(first) = history.iter().find(|m| m.role == Role::User && m.content.is_some()) {
        let content = first.content.as_deref().unwrap_or("");
        let truncated: String = content.chars().take(FIRST_MESSAGE_TRUNCATE).collect();
        lines.push(format!("[ORIGINAL REQUEST] User: {truncated}"));
        lines.push(String::new());
    }

    for m in tail {
        if m.role == Role::Tool {
            continue;
        }
        if m.role == Role::Assistant && m.has_tool_calls() {
            let names: Vec<&str> = m
                .tool_calls
                .as_ref()
                .expect("has_tool_calls checked Some")
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            lines.push(format!("Assistant: [used tools: {}]", names.join(", ")));
            if let Some(content) = m.content.as_deref().filter(|c| !c.is_empty()) {
                let truncated: String = content.chars().take(TOOL_FOLLOWUP_TRUNCATE).collect();
                lines.push(format!("Assistant: {truncated}"));
            }
            continue;
        }
        if let Some(content) = m.content.as_deref().filter(|c| !c.is_empty()) {
            let label = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let truncated: String = content.chars().take(MESSAGE_TRUNCATE).collect();
            lines.push(format!("{label}: {truncated}"));
        }
    }

    if lines.is_empty() {
        "(empty conversation)".to_string()
    } else {
        lines.join("\n")
    }
}

fn extract_json(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(name: &str) -> AvailableSkill {
        AvailableSkill { name: name.into(), description: format!("does {name} things") }
    }

    fn msg(id: i64, role: Role, content: &str) -> Message {
        Message {
            id,
            conversation_id: "c1".into(),
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn extract_json_from_code_fence() {
        let text = "```json\n{\"add\": [\"pdf\"]}\n```";
        assert_eq!(extract_json(text), "{\"add\": [\"pdf\"]}");
    }

    #[test]
    fn extract_json_passthrough_when_no_fence() {
        let text = "{\"add\": []}";
        assert_eq!(extract_json(text), "{\"add\": []}");
    }

    #[test]
    fn decay_removes_expired_skills() {
        let mut active = HashMap::new();
        active.insert("pdf".to_string(), 1);
        active.insert("docx".to_string(), 3);
        let updated = decay(&active);
        assert!(!updated.contains_key("pdf"));
        assert_eq!(updated["docx"], 2);
    }

    #[test]
    fn apply_decision_adds_only_valid_skills() {
        let active = HashMap::new();
        let decision = RouteDecision {
            add: vec!["pdf".into(), "unknown".into()],
            keep: vec![],
            drop: vec![],
        };
        let available = vec![skill("pdf")];
        let updated = apply_decision(&active, &decision, &available, DEFAULT_TTL);
        assert_eq!(updated.get("pdf"), Some(&DEFAULT_TTL));
        assert!(!updated.contains_key("unknown"));
    }

    #[test]
    fn apply_decision_drop_wins_over_decay() {
        let mut active = HashMap::new();
        active.insert("pdf".into(), 1);
        let decision = RouteDecision { add: vec![], keep: vec![], drop: vec!["pdf".into()] };
        let updated = apply_decision(&active, &decision, &[skill("pdf")], DEFAULT_TTL);
        assert!(!updated.contains_key("pdf"));
    }

    #[test]
    fn apply_decision_keep_resets_ttl() {
        let mut active = HashMap::new();
        active.insert("pdf".into(), 1);
        let decision = RouteDecision { add: vec![], keep: vec!["pdf".into()], drop: vec![] };
        let updated = apply_decision(&active, &decision, &[skill("pdf")], DEFAULT_TTL);
        assert_eq!(updated["pdf"], DEFAULT_TTL);
    }

    #[test]
    fn apply_decision_unmentioned_active_skill_decays() {
        let mut active = HashMap::new();
        active.insert("pdf".into(), 2);
        let decision = RouteDecision::default();
        let updated = apply_decision(&active, &decision, &[skill("pdf")], DEFAULT_TTL);
        assert_eq!(updated["pdf"], 1);
    }

    #[test]
    fn user_prompt_keeps_first_message_despite_truncation_window() {
        let mut history = vec![msg(1, Role::User, "original ask")];
        for i in 2..20 {
            history.push(msg(i, Role::User, "filler"));
        }
        let prompt = build_user_prompt(&history);
        assert!(prompt.contains("[ORIGINAL REQUEST] User: original ask"));
    }

    #[test]
    fn user_prompt_skips_tool_messages() {
        let history = vec![msg(1, Role::User, "hi"), msg(2, Role::Tool, "raw tool output")];
        let prompt = build_user_prompt(&history);
        assert!(!prompt.contains("raw tool output"));
    }

    #[test]
    fn user_prompt_empty_history_has_placeholder() {
        assert_eq!(build_user_prompt(&[]), "(empty conversation)");
    }

    #[tokio::test]
    async fn route_falls_back_to_decay_without_a_configured_provider() {
        let router = LlmRouter::from_config(&warden_domain::config::LlmConfig::default()).unwrap();
        let skill_router = SkillRouter::new(&router);
        let mut active = AgentContext { conversation_id: "c1".into(), skills: HashMap::new() };
        active.skills.insert("pdf".into(), 2);

        let updated = skill_router
            .route(&[], &[skill("pdf")], &active, None, Some("c1".into()))
            .await;
        assert_eq!(updated["pdf"], 1);
    }

    #[tokio::test]
    async fn route_returns_unchanged_active_when_no_skills_available() {
        let router = LlmRouter::from_config(&warden_domain::config::LlmConfig::default()).unwrap();
        let skill_router = SkillRouter::new(&router);
        let mut active = AgentContext { conversation_id: "c1".into(), skills: HashMap::new() };
        active.skills.insert("pdf".into(), 2);

        let updated = skill_router.route(&[], &[], &active, None, None).await;
        assert_eq!(updated["pdf"], 2);
    }
}
