use serde::Serialize;

/// Structured trace events emitted across warden crates.
///
/// Separate from `tracing::info!` free-text lines: these are greppable,
/// machine-parseable JSON blobs carried inside a single tracing field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    JobEnqueued {
        job_id: String,
        conversation_id: String,
    },
    JobStatusChanged {
        job_id: String,
        from: String,
        to: String,
    },
    LlmRequest {
        provider: String,
        model: String,
        component: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    LlmRetry {
        provider: String,
        attempt: u32,
        backoff_ms: u64,
        reason: String,
    },
    CompactionRun {
        conversation_id: String,
        messages_before: usize,
        messages_after: usize,
        fallback_to_original: bool,
    },
    SummaryUpdated {
        conversation_id: String,
        up_to_message_id: i64,
    },
    SkillsRouted {
        conversation_id: String,
        active: usize,
        added: usize,
        dropped: usize,
    },
    LoopDetected {
        job_id: String,
        tool_name: String,
        repetitions: u32,
    },
    ScheduleFired {
        scheduled_job_id: String,
        job_id: String,
        conversation_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "warden_event");
    }
}
