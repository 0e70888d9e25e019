//! The agent main loop (spec §4.J): the step loop that drives one job from
//! its triggering user message to a terminal `TurnOutcome`.
//!
//! Grounded on the teacher's `gateway/runtime/turn.rs` (`MAX_TOOL_LOOPS`
//! step loop, streaming accumulation, concurrent tool dispatch via
//! `futures_util::future::join_all`, cancellation-checkpoint placement) and
//! `gateway/runtime/mod.rs` (`truncate_str`, assembling the assistant
//! tool-call message). Loop/limit detection is new: the teacher has no
//! equivalent subsystem, so the thresholds come from
//! `original_source/user_container/agent/loop_detector.py` rather than
//! being invented here. The example tool set that subsystem was written
//! against (`web_search`/`web_fetch`/`edit_file`) doesn't exist in this
//! registry, so the per-tool caps and the research-artifact trigger are
//! re-keyed onto the tools this crate actually registers
//! (`read_file`/`write_file`/`shell`/`delegate_task`/`explore_task`); see
//! `limits::TOOL_CAPS` and `limits::RESEARCH_TRIGGER_TOOLS`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use warden_domain::model::{self, ActivityType, JobActivity, LoopState, Role as ModelRole};
use warden_domain::tool;
use warden_domain::trace::TraceEvent;
use warden_domain::Error;
use warden_providers::{CancellationCheck, ChatRequest, LlmRouter, ToolChoice, ROLE_DEFAULT};
use warden_skills::SkillsRegistry;
use warden_store::Store;

use crate::cancel::CancelToken;
use crate::context::{ContextManager, PLAN_MARKER};
use crate::routing::{Depth, RoutingAgent};
use crate::skill_router::{AvailableSkill, SkillRouter};
use crate::subagent::{self, SubagentKind, SubagentStatus};
use crate::tools::{ToolContext, ToolRegistry};

mod limits;
use limits::{duplicate_signature, history_loop_detected, tool_signature};

/// Dependencies wired once at process start and shared across every turn.
pub struct TurnDeps {
    pub store: Arc<Store>,
    pub router: Arc<LlmRouter>,
    pub tools: Arc<ToolRegistry>,
    pub skills: Arc<SkillsRegistry>,
    pub context: ContextManager,
    pub max_steps: usize,
    pub reflection_interval: usize,
    pub recent_exchanges: usize,
}

pub struct TurnInput {
    pub job_id: String,
    pub conversation_id: String,
    pub user_message: String,
    pub skip_history: bool,
    pub headless: bool,
    pub ask_user_default: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Success,
    WaitingForInput,
    Cancelled,
    Timeout,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub steps: u32,
    pub elapsed_seconds: f64,
    pub context_usage_percent: f32,
}

const MAX_CONSECUTIVE_TRUNCATIONS: u32 = 3;
const MAX_CONSECUTIVE_EMPTY: u32 = 3;

/// Byte-boundary-safe truncation with a trailing marker, used for activity
/// detail (the full value is kept in `detail`, this is just the headline).
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

struct StepNotes {
    texts: Vec<String>,
}

impl StepNotes {
    fn new() -> Self {
        Self { texts: Vec::new() }
    }
    fn push(&mut self, s: impl Into<String>) {
        self.texts.push(s.into());
    }
    fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.texts)
    }
}

/// Drive one job to completion. The caller is responsible for the
/// `pending -> running` transition and for registering `cancel` before
/// calling this; `run_turn` only ever reads it.
pub async fn run_turn(deps: &TurnDeps, input: TurnInput, cancel: &CancelToken) -> TurnOutcome {
    let start = Instant::now();
    let job_id = input.job_id.clone();
    let conversation_id = input.conversation_id.clone();

    let conversation = match deps.store.get_conversation(&conversation_id) {
        Some(c) => c,
        None => {
            return error_outcome(deps, &job_id, 0, start, "conversation not found");
        }
    };

    deps.store
        .append_message(
            &conversation_id,
            model::Message {
                id: 0,
                conversation_id: conversation_id.clone(),
                role: ModelRole::User,
                content: Some(input.user_message.clone()),
                tool_calls: None,
                tool_call_id: None,
                thinking: None,
                thinking_signature: None,
                metadata: None,
                internal: false,
                created_at: chrono::Utc::now(),
            },
        )
        .ok();

    let persisted_history = deps.store.list_messages(&conversation_id);
    let routing = RoutingAgent::new(&deps.router);
    let depth = routing
        .classify(
            &persisted_history,
            &input.user_message,
            Some(job_id.clone()),
            Some(conversation_id.clone()),
        )
        .await;

    log_activity(deps, &job_id, ActivityType::ROUTING, format!("depth={}", depth.as_u8()), None, false);

    let available_skills: Vec<AvailableSkill> = deps
        .skills
        .list_ready()
        .into_iter()
        .map(|s| AvailableSkill { name: s.name, description: s.description })
        .collect();
    let skill_router = SkillRouter::new(&deps.router);

    let mut loop_state = LoopState::default();
    let mut notes = StepNotes::new();
    let mut consecutive_truncations: u32 = 0;
    let mut consecutive_empty: u32 = 0;
    let mut tool_only_streak: u32 = 0;
    let mut last_context_usage: f32 = 0.0;

    for step in 1..=deps.max_steps as u32 {
        if cancel.is_cancelled() {
            return cancelled_outcome(deps, &job_id, step, start);
        }

        log_activity(deps, &job_id, ActivityType::STEP, format!("step {step}"), None, false);

        // Skill routing: recompute the active set every step so additions
        // and drops track the conversation as it unfolds.
        let history_for_routing = deps.store.list_messages(&conversation_id);
        let active_before = deps.store.get_agent_context(&conversation_id);
        let updated_skills = skill_router
            .route(
                &history_for_routing,
                &available_skills,
                &active_before,
                Some(job_id.clone()),
                Some(conversation_id.clone()),
            )
            .await;
        let added = updated_skills.keys().filter(|k| !active_before.skills.contains_key(*k)).count();
        let dropped = active_before.skills.keys().filter(|k| !updated_skills.contains_key(*k)).count();
        if added > 0 || dropped > 0 {
            TraceEvent::SkillsRouted {
                conversation_id: conversation_id.clone(),
                active: updated_skills.len(),
                added,
                dropped,
            }
            .emit();
        }
        deps.store
            .upsert_agent_context(model::AgentContext {
                conversation_id: conversation_id.clone(),
                skills: updated_skills.clone(),
            })
            .ok();

        let system_text = build_system_prompt(
            deps,
            &conversation.id,
            step,
            depth,
            &updated_skills,
            &conversation.summary,
            input.skip_history,
            &mut notes,
        );

        let body = if input.skip_history {
            vec![tool::Message::user(&input.user_message)]
        } else {
            deps.store.get_conversation_history(&conversation_id, true, deps.recent_exchanges)
        };

        let mut full = vec![tool::Message::system(system_text)];
        full.extend(body);

        if cancel.is_cancelled() {
            return cancelled_outcome(deps, &job_id, step, start);
        }

        let compressed = match deps
            .context
            .compress(full, true, &deps.router, Some(job_id.clone()), Some(conversation_id.clone()))
            .await
        {
            Ok(m) => m,
            Err(_) => {
                return error_outcome(deps, &job_id, step, start, "context compression failed");
            }
        };
        last_context_usage = deps.context.usage_percent(&compressed) * 100.0;

        let tool_specs = deps.tools.get_openai_specs();
        let cancel_for_check = cancel.clone();
        let cancellation_check: CancellationCheck = Arc::new(move || cancel_for_check.is_cancelled());

        let (thinking_budget, reasoning_effort) = match depth {
            Depth::Standard => (Some(4096), Some("medium".to_string())),
            Depth::Direct => (None, None),
        };

        let req = ChatRequest {
            messages: compressed,
            tools: tool_specs,
            tool_choice: ToolChoice::Auto,
            thinking_budget,
            reasoning_effort,
            max_tokens: Some(8 * 1024),
            component: "agent".into(),
            job_id: Some(job_id.clone()),
            conversation_id: Some(conversation_id.clone()),
            ..Default::default()
        };

        let resp = match deps.router.chat_for_role(ROLE_DEFAULT, req, Some(cancellation_check)).await {
            Ok(r) => r,
            Err(Error::Cancelled) => return cancelled_outcome(deps, &job_id, step, start),
            Err(e) => {
                return error_outcome(deps, &job_id, step, start, &e.to_string());
            }
        };

        log_activity(
            deps,
            &job_id,
            ActivityType::LLM_RESPONSE,
            format!("model={} tool_calls={}", resp.model, resp.tool_calls.len()),
            Some(json!({"usage": {"prompt_tokens": resp.usage.prompt_tokens, "completion_tokens": resp.usage.completion_tokens}})),
            false,
        );
        if resp.truncated {
            log_activity(deps, &job_id, ActivityType::WARNING, "response truncated at max_tokens".into(), None, true);
        }

        if cancel.is_cancelled() {
            return cancelled_outcome(deps, &job_id, step, start);
        }

        let has_tool_calls = !resp.tool_calls.is_empty();
        let has_text = resp.content.as_deref().map(|c| !c.trim().is_empty()).unwrap_or(false);

        if has_tool_calls {
            if resp.truncated {
                consecutive_truncations += 1;
                if consecutive_truncations >= MAX_CONSECUTIVE_TRUNCATIONS {
                    return error_outcome(deps, &job_id, step, start, "response truncated 3 turns in a row");
                }
            } else {
                consecutive_truncations = 0;
            }
            consecutive_empty = 0;

            let tool_calls: Vec<model::ToolCall> = resp
                .tool_calls
                .iter()
                .map(|c| model::ToolCall { id: c.call_id.clone(), name: c.tool_name.clone(), arguments: c.arguments.clone() })
                .collect();

            deps.store
                .append_message(
                    &conversation_id,
                    model::Message {
                        id: 0,
                        conversation_id: conversation_id.clone(),
                        role: ModelRole::Assistant,
                        content: resp.content.clone(),
                        tool_calls: Some(tool_calls),
                        tool_call_id: None,
                        thinking: resp.thinking.clone(),
                        thinking_signature: resp.thinking_signature.clone(),
                        metadata: None,
                        internal: true,
                        created_at: chrono::Utc::now(),
                    },
                )
                .ok();

            if resp.thinking.is_some() {
                log_activity(deps, &job_id, ActivityType::THINKING_STREAM, "reasoning".into(), None, false);
            }

            let outcome = execute_tool_calls(
                deps,
                &job_id,
                &conversation_id,
                &input,
                &resp.tool_calls,
                &mut loop_state,
                &mut notes,
                cancel,
            )
            .await;

            match outcome {
                ToolBatchOutcome::Cancelled => return cancelled_outcome(deps, &job_id, step, start),
                ToolBatchOutcome::AskUser { question, options } => {
                    deps.store
                        .append_message(
                            &conversation_id,
                            model::Message {
                                id: 0,
                                conversation_id: conversation_id.clone(),
                                role: ModelRole::Assistant,
                                content: Some(question.clone()),
                                tool_calls: None,
                                tool_call_id: None,
                                thinking: None,
                                thinking_signature: None,
                                metadata: Some(json!({"type": "question", "options": options})),
                                internal: false,
                                created_at: chrono::Utc::now(),
                            },
                        )
                        .ok();
                    return TurnOutcome {
                        status: TurnStatus::WaitingForInput,
                        summary: Some(question),
                        steps: step,
                        elapsed_seconds: start.elapsed().as_secs_f64(),
                        context_usage_percent: last_context_usage,
                    };
                }
                ToolBatchOutcome::HardStop(reason) => {
                    return error_outcome(deps, &job_id, step, start, &reason);
                }
                ToolBatchOutcome::Continue => {
                    tool_only_streak += 1;
                    if tool_only_streak >= 15 {
                        return error_outcome(deps, &job_id, step, start, "tool-only stall: 15 steps without a final answer");
                    }
                    if tool_only_streak > 0 && tool_only_streak % 5 == 0 {
                        notes.push(format!(
                            "You have called tools for {tool_only_streak} consecutive steps without responding \
                             to the user. If you have enough information, stop and answer now."
                        ));
                    }
                    if history_loop_detected(&deps.store.list_messages(&conversation_id)) {
                        log_activity(deps, &job_id, ActivityType::LOOP_DETECTED, "repeated identical tool calls".into(), None, true);
                        notes.push(
                            "You have called the same tool with the same arguments several times in a row. \
                             Stop repeating yourself: either change your approach or report what you found."
                                .to_string(),
                        );
                    }
                    continue;
                }
            }
        }

        if resp.thinking.is_some() && !has_text {
            deps.store
                .append_message(
                    &conversation_id,
                    model::Message {
                        id: 0,
                        conversation_id: conversation_id.clone(),
                        role: ModelRole::Assistant,
                        content: None,
                        tool_calls: None,
                        tool_call_id: None,
                        thinking: resp.thinking.clone(),
                        thinking_signature: resp.thinking_signature.clone(),
                        metadata: None,
                        internal: true,
                        created_at: chrono::Utc::now(),
                    },
                )
                .ok();
            tool_only_streak = 0;
            continue;
        }

        if !has_text {
            consecutive_empty += 1;
            if tool_only_streak > 0 {
                // The previous step executed tools; an empty follow-up reply
                // means the model considers the task done.
                return finish_success(deps, &job_id, &conversation_id, step, start, last_context_usage, "Done.".to_string());
            }
            if consecutive_empty >= MAX_CONSECUTIVE_EMPTY {
                return error_outcome(deps, &job_id, step, start, "model returned empty responses 3 turns in a row");
            }
            continue;
        }

        let final_text = resp.content.unwrap_or_default();
        return finish_success(deps, &job_id, &conversation_id, step, start, last_context_usage, final_text);
    }

    log_activity(deps, &job_id, ActivityType::WARNING, "max_steps reached".into(), None, true);
    TurnOutcome {
        status: TurnStatus::Timeout,
        summary: None,
        steps: deps.max_steps as u32,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        context_usage_percent: last_context_usage,
    }
}

fn finish_success(
    deps: &TurnDeps,
    job_id: &str,
    conversation_id: &str,
    step: u32,
    start: Instant,
    context_usage_percent: f32,
    text: String,
) -> TurnOutcome {
    deps.store
        .append_message(
            conversation_id,
            model::Message {
                id: 0,
                conversation_id: conversation_id.to_string(),
                role: ModelRole::Assistant,
                content: Some(text.clone()),
                tool_calls: None,
                tool_call_id: None,
                thinking: None,
                thinking_signature: None,
                metadata: None,
                internal: false,
                created_at: chrono::Utc::now(),
            },
        )
        .ok();
    log_activity(deps, job_id, ActivityType::COMPLETE, "turn complete".into(), None, false);
    TurnOutcome {
        status: TurnStatus::Success,
        summary: Some(text),
        steps: step,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        context_usage_percent,
    }
}

fn cancelled_outcome(deps: &TurnDeps, job_id: &str, step: u32, start: Instant) -> TurnOutcome {
    log_activity(deps, job_id, ActivityType::CANCELLED, "cancelled".into(), None, false);
    TurnOutcome {
        status: TurnStatus::Cancelled,
        summary: None,
        steps: step,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        context_usage_percent: 0.0,
    }
}

fn error_outcome(deps: &TurnDeps, job_id: &str, step: u32, start: Instant, message: &str) -> TurnOutcome {
    log_activity(deps, job_id, ActivityType::ERROR, message.to_string(), None, true);
    TurnOutcome {
        status: TurnStatus::Error,
        summary: Some(message.to_string()),
        steps: step,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        context_usage_percent: 0.0,
    }
}

fn log_activity(deps: &TurnDeps, job_id: &str, kind: &str, message: String, detail: Option<Value>, is_error: bool) {
    deps.store
        .append_activity(JobActivity {
            id: 0,
            job_id: job_id.to_string(),
            timestamp: chrono::Utc::now(),
            kind: ActivityType::new(kind),
            message,
            detail,
            tool_name: None,
            is_error,
        })
        .ok();
}

fn log_tool_activity(deps: &TurnDeps, job_id: &str, kind: &str, tool_name: &str, message: String, detail: Option<Value>, is_error: bool) {
    deps.store
        .append_activity(JobActivity {
            id: 0,
            job_id: job_id.to_string(),
            timestamp: chrono::Utc::now(),
            kind: ActivityType::new(kind),
            message,
            detail,
            tool_name: Some(tool_name.to_string()),
            is_error,
        })
        .ok();
}

#[allow(clippy::too_many_arguments)]
fn build_system_prompt(
    deps: &TurnDeps,
    conversation_id: &str,
    step: u32,
    depth: Depth,
    active_skills: &HashMap<String, i32>,
    summary: &Option<String>,
    skip_history: bool,
    notes: &mut StepNotes,
) -> String {
    let today = chrono::Utc::now().format("%Y-%m-%d");
    let mut sections = vec![format!(
        "You are warden, an autonomous coding and task assistant. Today's date is {today}."
    )];

    if !skip_history {
        let visible = deps.store.message_count(conversation_id) as i64;
        if let Some(header) = crate::summarizer::ConversationSummarizer::build_context_header(visible, visible, summary.as_deref()) {
            sections.push(header);
        }
    }

    if !active_skills.is_empty() {
        let mut names: Vec<&String> = active_skills.keys().collect();
        names.sort();
        let mut docs = Vec::new();
        for name in names {
            if let Ok(doc) = deps.skills.read_doc(name) {
                docs.push(doc);
            }
        }
        if !docs.is_empty() {
            sections.push(format!("Active skill instructions:\n\n{}", docs.join("\n\n---\n\n")));
        }
    } else {
        sections.push(format!("Available skills:\n{}", deps.skills.render_ready_index()));
    }

    if step == 1 && depth == Depth::Standard {
        sections.push(format!(
            "Before acting, write a brief plan wrapped in {PLAN_MARKER}...</plan> tags outlining \
             the steps you intend to take."
        ));
    }

    if depth == Depth::Standard && step > 1 && deps.reflection_interval > 0 && (step as usize) % deps.reflection_interval == 0 {
        sections.push(
            "Pause and reflect: are you still making progress toward the user's goal, or should \
             you change approach?"
                .to_string(),
        );
    }

    for note in notes.take() {
        sections.push(note);
    }

    sections.join("\n\n")
}

enum ToolBatchOutcome {
    Continue,
    Cancelled,
    AskUser { question: String, options: Option<Value> },
    HardStop(String),
}

#[allow(clippy::too_many_arguments)]
async fn execute_tool_calls(
    deps: &TurnDeps,
    job_id: &str,
    conversation_id: &str,
    input: &TurnInput,
    calls: &[tool::ToolCall],
    loop_state: &mut LoopState,
    notes: &mut StepNotes,
    cancel: &CancelToken,
) -> ToolBatchOutcome {
    let (delegate_calls, sequential_calls): (Vec<_>, Vec<_>) =
        calls.iter().cloned().partition(|c| c.tool_name == "delegate_task");

    let ctx = ToolContext {
        job_id: Some(job_id.to_string()),
        conversation_id: Some(conversation_id.to_string()),
        headless: input.headless,
        ask_user_default: input.ask_user_default.clone(),
        cancel: cancel.clone(),
    };

    for call in &sequential_calls {
        if cancel.is_cancelled() {
            return ToolBatchOutcome::Cancelled;
        }

        if let Err(reason) = deps.tools.validate_required(&call.tool_name, &call.arguments) {
            persist_tool_result(deps, conversation_id, &call.call_id, json!({"error": reason}).to_string(), true);
            continue;
        }

        record_call(deps, job_id, loop_state, notes, call);

        log_tool_activity(
            deps,
            job_id,
            ActivityType::TOOL_CALL,
            &call.tool_name,
            truncate_str(&call.arguments.to_string(), 200),
            Some(call.arguments.clone()),
            false,
        );

        let result = deps.tools.call(&call.tool_name, call.arguments.clone(), &ctx).await;
        let (content, is_error) = match result {
            Ok(v) => (v.to_string(), false),
            Err(e) => (e.to_string(), true),
        };

        if !is_error {
            if let Ok(v) = serde_json::from_str::<Value>(&content) {
                if v.get("stop_execution").and_then(Value::as_bool) == Some(true) {
                    let question = v.get("question").and_then(Value::as_str).unwrap_or("").to_string();
                    let options = v.get("options").cloned();
                    return ToolBatchOutcome::AskUser { question, options };
                }
            }
        }

        log_tool_activity(
            deps,
            job_id,
            ActivityType::TOOL_RESULT,
            &call.tool_name,
            truncate_str(&content, 200),
            Some(json!({"full": content})),
            is_error,
        );
        persist_tool_result(deps, conversation_id, &call.call_id, content, is_error);

        if let Some(stop) = check_limits(deps, job_id, loop_state, notes, &call.tool_name) {
            return stop;
        }
    }

    if !delegate_calls.is_empty() {
        if cancel.is_cancelled() {
            return ToolBatchOutcome::Cancelled;
        }
        for call in &delegate_calls {
            record_call(deps, job_id, loop_state, notes, call);
            log_tool_activity(deps, job_id, ActivityType::DELEGATE_START, &call.tool_name, truncate_str(&call.arguments.to_string(), 200), None, false);
        }

        let futures = delegate_calls.iter().map(|call| {
            let task = call
                .arguments
                .get("task")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let router = deps.router.clone();
            let tools = deps.tools.clone();
            let cancel = cancel.clone();
            async move { subagent::run_subagent(SubagentKind::Delegate, &task, &router, &tools, &cancel).await }
        });
        let results = futures_util::future::join_all(futures).await;

        for (call, result) in delegate_calls.iter().zip(results) {
            let is_error = result.status != SubagentStatus::Success;
            let content = serde_json::to_string(&result).unwrap_or_default();
            log_tool_activity(
                deps,
                job_id,
                ActivityType::DELEGATE_END,
                &call.tool_name,
                truncate_str(&result.output, 200),
                Some(json!({"full": result.output})),
                is_error,
            );
            persist_tool_result(deps, conversation_id, &call.call_id, content, is_error);

            if let Some(stop) = check_limits(deps, job_id, loop_state, notes, &call.tool_name) {
                return stop;
            }
        }
    }

    ToolBatchOutcome::Continue
}

fn record_call(deps: &TurnDeps, job_id: &str, loop_state: &mut LoopState, notes: &mut StepNotes, call: &tool::ToolCall) {
    loop_state.record_tool_call(&call.tool_name);

    let sig = tool_signature(&call.tool_name, &call.arguments);
    if loop_state.last_tool_signature.as_deref() == Some(&sig) {
        loop_state.consecutive_same_tool += 1;
    } else {
        loop_state.consecutive_same_tool = 1;
        loop_state.last_tool_signature = Some(sig.clone());
    }

    let dup_key = duplicate_signature(&call.tool_name, &call.arguments);
    if loop_state.tool_cache.contains_key(&dup_key) {
        log_tool_activity(deps, job_id, ActivityType::DUPLICATE_TOOL, &call.tool_name, "identical call seen before".into(), None, false);
    } else {
        loop_state.tool_cache.insert(dup_key, sig);
    }

    if limits::RESEARCH_TRIGGER_TOOLS.contains(&call.tool_name.as_str())
        && !loop_state.research_file_created
        && loop_state.tool_counts.get(&call.tool_name).copied().unwrap_or(0) > limits::RESEARCH_MODE_THRESHOLD
    {
        loop_state.research_file_created = true;
        log_tool_activity(deps, job_id, ActivityType::RESEARCH_MODE, &call.tool_name, "switching to research-artifact mode".into(), None, false);
        notes.push(
            "You have made several investigative tool calls. From now on, keep a running list of \
             findings in a file under the workspace so nothing is lost if the conversation is \
             summarized."
                .to_string(),
        );
    }
}

/// Checks the limit machinery after one tool call lands. Returns `Some` to
/// hard-stop the job; otherwise pushes a soft nudge into `notes` and
/// returns `None` so the loop continues.
fn check_limits(deps: &TurnDeps, job_id: &str, loop_state: &mut LoopState, notes: &mut StepNotes, tool_name: &str) -> Option<ToolBatchOutcome> {
    if loop_state.consecutive_same_tool >= limits::ABSOLUTE_SAME_TOOL_CAP {
        log_tool_activity(deps, job_id, ActivityType::LOOP_HARD_STOP, tool_name, "same tool called too many times".into(), None, true);
        return Some(ToolBatchOutcome::HardStop(format!(
            "stopped: {tool_name} was called {} times in a row",
            loop_state.consecutive_same_tool
        )));
    }

    if loop_state.consecutive_same_tool > 0 && loop_state.consecutive_same_tool % limits::SOFT_REPEAT_THRESHOLD == 0 {
        loop_state.recovery_attempts += 1;
        log_tool_activity(deps, job_id, ActivityType::LOOP_RECOVERY, tool_name, format!("recovery attempt {}", loop_state.recovery_attempts), None, true);
        if loop_state.recovery_attempts >= limits::RECOVERY_CAP {
            return Some(ToolBatchOutcome::HardStop(format!(
                "stopped: repeated {tool_name} calls without progress after {} recovery attempts",
                loop_state.recovery_attempts
            )));
        }
        notes.push(format!(
            "You've called {tool_name} with the same arguments {} times in a row. Try a different \
             approach or explain why you cannot proceed.",
            loop_state.consecutive_same_tool
        ));
        loop_state.consecutive_same_tool = 0;
    }

    let cap = limits::TOOL_CAPS.iter().find(|entry| entry.0 == tool_name).map(|entry| entry.1);
    if let Some(cap) = cap {
        let count = loop_state.tool_counts.get(tool_name).copied().unwrap_or(0);
        if count == cap {
            log_tool_activity(deps, job_id, ActivityType::TOOL_LIMIT, tool_name, format!("reached {cap} calls"), None, true);
            notes.push(format!(
                "You've used {tool_name} {cap} times this turn. Summarize what you've learned and \
                 decide whether more calls are actually necessary."
            ));
        }
    }

    if loop_state.total_tool_calls() == limits::TOTAL_LIMIT {
        log_tool_activity(deps, job_id, ActivityType::TOOL_LIMIT, tool_name, format!("reached {} total tool calls this turn", limits::TOTAL_LIMIT), None, true);
        notes.push("You're approaching the overall tool-call budget for this turn. Wrap up soon.".to_string());
    }

    None
}

fn persist_tool_result(deps: &TurnDeps, conversation_id: &str, call_id: &str, content: String, is_error: bool) {
    deps.store
        .append_message(
            conversation_id,
            model::Message {
                id: 0,
                conversation_id: conversation_id.to_string(),
                role: ModelRole::Tool,
                content: Some(content),
                tool_calls: None,
                tool_call_id: Some(call_id.to_string()),
                thinking: None,
                thinking_signature: None,
                metadata: if is_error { Some(json!({"is_error": true})) } else { None },
                internal: true,
                created_at: chrono::Utc::now(),
            },
        )
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_within_limit_is_unchanged() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn truncate_str_over_limit_appends_ellipsis() {
        assert_eq!(truncate_str("hello world", 5), "hello...");
    }

    #[test]
    fn truncate_str_respects_multibyte_boundaries() {
        let s = "a\u{1F600}b";
        let truncated = truncate_str(s, 2);
        assert!(s.is_char_boundary(truncated.len() - 3) || !truncated.ends_with('\u{FFFD}'));
    }

    #[test]
    fn truncate_str_zero_max_on_empty_is_empty() {
        assert_eq!(truncate_str("", 0), "");
    }
}
