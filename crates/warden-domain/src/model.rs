//! Persisted and in-memory entities (data model).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Id = String;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Id,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub forked_from: Option<Id>,
    #[serde(default)]
    pub branch_number: Option<u32>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub scheduler_id: Option<Id>,
    #[serde(default)]
    pub is_scheduler_run: bool,
    #[serde(default)]
    pub read_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub summary_up_to_message_id: Option<i64>,
}

impl Conversation {
    /// `last_message_at > read_at` governs unread detection.
    pub fn is_unread(&self, last_message_at: Option<chrono::DateTime<chrono::Utc>>) -> bool {
        match (last_message_at, self.read_at) {
            (Some(last), Some(read)) => last > read,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Auto-increment, ordered within a conversation.
    pub id: i64,
    pub conversation_id: Id,
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// Opaque reasoning trace; must round-trip verbatim to the provider
    /// if reasoning stays enabled, or be stripped if it's later disabled.
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub thinking_signature: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Intermediate agent turn: excluded from user-visible listings,
    /// preserved in replay.
    #[serde(default)]
    pub internal: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,
    pub conversation_id: Id,
    pub message: String,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub question_options: Option<Vec<String>>,
    #[serde(default)]
    pub user_response: Option<String>,
    /// Cooperative flag polled by the main loop.
    #[serde(default)]
    pub is_cancelled: bool,
    /// Cooperative flag polled by the main loop.
    #[serde(default)]
    pub is_force_respond: bool,
    #[serde(default)]
    pub skip_history: bool,
    #[serde(default)]
    pub headless: bool,
    #[serde(default)]
    pub ask_user_default: Option<String>,
}

impl Job {
    pub fn new(conversation_id: Id, message: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            message,
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            worker_id: None,
            question: None,
            question_options: None,
            user_response: None,
            is_cancelled: false,
            is_force_respond: false,
            skip_history: false,
            headless: false,
            ask_user_default: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JobActivity (append-only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Open enum of activity kinds. Kept as a string newtype rather than a
/// closed Rust enum: new kinds get added at the edges (delegate/explore,
/// loop machinery) without touching every match arm that logs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityType(pub String);

impl ActivityType {
    pub const ROUTING: &'static str = "routing";
    pub const STEP: &'static str = "step";
    pub const THINKING: &'static str = "thinking";
    pub const THINKING_STREAM: &'static str = "thinking_stream";
    pub const PLANNING: &'static str = "planning";
    pub const REFLECTION: &'static str = "reflection";
    pub const LLM_CALL: &'static str = "llm_call";
    pub const LLM_RESPONSE: &'static str = "llm_response";
    pub const TOOL_CALL: &'static str = "tool_call";
    pub const TOOL_RESULT: &'static str = "tool_result";
    pub const DELEGATE_START: &'static str = "delegate_start";
    pub const DELEGATE_STEP: &'static str = "delegate_step";
    pub const DELEGATE_END: &'static str = "delegate_end";
    pub const EXPLORE_START: &'static str = "explore_start";
    pub const EXPLORE_STEP: &'static str = "explore_step";
    pub const EXPLORE_END: &'static str = "explore_end";
    pub const WARNING: &'static str = "warning";
    pub const ERROR: &'static str = "error";
    pub const LOOP_DETECTED: &'static str = "loop_detected";
    pub const LOOP_RECOVERY: &'static str = "loop_recovery";
    pub const LOOP_WARNING: &'static str = "loop_warning";
    pub const LOOP_HARD_STOP: &'static str = "loop_hard_stop";
    pub const TOOL_LIMIT: &'static str = "tool_limit";
    pub const DUPLICATE_TOOL: &'static str = "duplicate_tool";
    pub const RESEARCH_MODE: &'static str = "research_mode";
    pub const CANCELLED: &'static str = "cancelled";
    pub const COMPLETE: &'static str = "complete";
    pub const PROGRESS_STEP: &'static str = "progress_step";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl From<&str> for ActivityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobActivity {
    pub id: i64,
    pub job_id: Id,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    pub message: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScheduledJob / ScheduledJobRun
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Id,
    /// Source conversation this schedule was created from.
    pub conversation_id: Id,
    pub name: String,
    pub prompt: String,
    pub cron_expression: String,
    pub schedule_description: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub next_run_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub context_json: Option<serde_json::Value>,
    #[serde(default)]
    pub files_dir: Option<String>,
}

fn default_timezone() -> String {
    "Europe/Warsaw".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledRunStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJobRun {
    pub id: i64,
    pub scheduled_job_id: Id,
    pub job_id: Id,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: ScheduledRunStatus,
    #[serde(default)]
    pub result_preview: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentContext — per-conversation skill TTL map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentContext {
    pub conversation_id: Id,
    /// skill_name -> remaining_ttl (steps)
    pub skills: HashMap<String, i32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UsageLog (append-only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: i64,
    #[serde(default)]
    pub job_id: Option<Id>,
    #[serde(default)]
    pub conversation_id: Option<Id>,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub component: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LoopState (per-job, in-memory only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub last_tool_signature: Option<String>,
    pub consecutive_same_tool: u32,
    pub consecutive_same_result: u32,
    pub tool_results_hash: Option<String>,
    pub recovery_attempts: u32,
    /// per-tool call counts plus a `_total` aggregate.
    pub tool_counts: HashMap<String, u32>,
    /// signature -> preview, used to short-circuit identical repeats.
    pub tool_cache: HashMap<String, String>,
    pub research_file_created: bool,
}

impl LoopState {
    pub fn total_tool_calls(&self) -> u32 {
        self.tool_counts.values().copied().sum()
    }

    pub fn record_tool_call(&mut self, tool_name: &str) {
        *self.tool_counts.entry(tool_name.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unread_when_last_message_after_read_at() {
        let mut c = Conversation {
            id: "c1".into(),
            created_at: chrono::Utc::now(),
            preview: None,
            forked_from: None,
            branch_number: None,
            is_archived: false,
            scheduler_id: None,
            is_scheduler_run: false,
            read_at: None,
            summary: None,
            summary_up_to_message_id: None,
        };
        let t0 = chrono::Utc::now();
        assert!(c.is_unread(Some(t0)));
        c.read_at = Some(t0 + chrono::Duration::seconds(1));
        assert!(!c.is_unread(Some(t0)));
    }

    #[test]
    fn job_starts_pending() {
        let job = Job::new("c1".into(), "do the thing".into());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_cancelled);
    }

    #[test]
    fn loop_state_counts_total_across_tools() {
        let mut state = LoopState::default();
        state.record_tool_call("shell");
        state.record_tool_call("shell");
        state.record_tool_call("read_file");
        assert_eq!(state.total_tool_calls(), 3);
    }
}
