//! The external control plane (spec §6): `Warden` composes every subsystem
//! into one facade and exposes it as inherent async methods rather than
//! HTTP routes — an HTTP layer sits outside this crate.
//!
//! Grounded on the teacher's `gateway/src/state.rs` `AppState` (one struct
//! wiring config, store, providers, skills, and runtime services, built
//! once at startup and handed out as `Arc` fields) and `gateway/src/main.rs`'s
//! periodic `tokio::spawn` interval loops (session flush, schedule runner
//! tick), which `run_worker_loop`/`run_scheduler_loop` below follow for the
//! queue-drain and cron-tick background tasks. `write_api_key`'s
//! preserve-other-lines `.env` rewrite is ported from
//! `original_source/user_container/app.py`'s `/setup` handler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use warden_domain::config::Config;
use warden_domain::model::{Conversation, Id, Job, JobActivity, JobStatus, ScheduledJob, ScheduledJobRun};
use warden_domain::{Error, Result};
use warden_providers::LlmRouter;
use warden_skills::SkillsRegistry;
use warden_store::{JobOptions, Store};

use crate::cancel::CancelMap;
use crate::context::ContextManager;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;
use crate::tools::ToolRegistry;
use crate::turn::{self, TurnDeps, TurnInput, TurnOutcome};

/// Everything the main loop, scheduler, and control-plane callers need,
/// wired once at process start.
pub struct Warden {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    scheduler: Arc<Scheduler>,
    router: Arc<LlmRouter>,
    tools: Arc<ToolRegistry>,
    skills: Arc<SkillsRegistry>,
    cancel_map: Arc<CancelMap>,
    workspace_root: PathBuf,
    context: ContextManager,
    max_steps: usize,
    reflection_interval: usize,
    recent_exchanges: usize,
    ask_user_timeout: Duration,
    scheduler_tick_interval: Duration,
}

/// Caller-facing snapshot of a job's progress (spec §6 "poll job status").
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub question: Option<String>,
    pub question_options: Option<Vec<String>>,
    pub activities: Vec<JobActivity>,
    pub current_operation: Option<String>,
    pub suggestions: Vec<String>,
}

/// Non-secret view of the configured LLM providers (spec §6 "read settings").
#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub configured: bool,
    pub providers: Vec<String>,
    pub roles: std::collections::HashMap<String, String>,
}

impl Warden {
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(Store::open(&config.store.path)?);
        let queue = Arc::new(JobQueue::new(store.clone()));
        let scheduler = Arc::new(Scheduler::new(store.clone(), queue.clone()));
        let router = Arc::new(LlmRouter::from_config(&config.llm)?);
        let skills = Arc::new(SkillsRegistry::load(&config.skills.path).unwrap_or_else(|_| SkillsRegistry::empty()));
        let tools = Arc::new(ToolRegistry::new(config.workspace.path.clone(), store.clone(), router.clone()));

        Ok(Self {
            store,
            queue,
            scheduler,
            router,
            tools,
            skills,
            cancel_map: Arc::new(CancelMap::new()),
            workspace_root: config.workspace.path,
            context: ContextManager {
                threshold: (config.context.compress_threshold_percent / 100.0) as f32,
                max_tokens: config.context.max_context_tokens,
            },
            max_steps: config.job.max_steps,
            reflection_interval: config.job.reflection_interval,
            recent_exchanges: config.context.recent_exchanges,
            ask_user_timeout: Duration::from_secs(config.job.ask_user_timeout_secs),
            scheduler_tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs),
        })
    }

    fn turn_deps(&self) -> TurnDeps {
        TurnDeps {
            store: self.store.clone(),
            router: self.router.clone(),
            tools: self.tools.clone(),
            skills: self.skills.clone(),
            context: ContextManager { threshold: self.context.threshold, max_tokens: self.context.max_tokens },
            max_steps: self.max_steps,
            reflection_interval: self.reflection_interval,
            recent_exchanges: self.recent_exchanges,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ── Job control plane (spec §6) ────────────────────────────────────

    /// Create a job for `conversation_id`, creating the conversation first
    /// if it's absent, then enqueue it. The triggering message is persisted
    /// once `run_turn` picks the job up.
    pub async fn create_job(
        &self,
        conversation_id: Option<Id>,
        message: impl Into<String>,
        headless: bool,
        ask_user_default: Option<String>,
    ) -> Result<Job> {
        let conversation_id = match conversation_id {
            Some(id) if self.store.get_conversation(&id).is_some() => id,
            _ => self.store.create_conversation(None)?.id,
        };
        let opts = JobOptions { headless, ask_user_default, skip_history: false };
        let job = self.queue.create_job(&conversation_id, message, opts)?;
        self.queue.enqueue(&job.id);
        Ok(job)
    }

    /// Poll a job's current status (spec §6's "poll job status"): terminal
    /// result/error, activities since `since_activity_id`, a best-effort
    /// "current operation" derived from the latest activity, and any
    /// generated suggestions.
    pub fn poll_job(&self, job_id: &Id, since_activity_id: i64) -> Option<JobStatusView> {
        let job = self.queue.get_job(job_id)?;
        let activities = self.store.list_activities_since(job_id, since_activity_id);
        let current_operation = self
            .store
            .list_activities(job_id)
            .last()
            .map(|a| match &a.tool_name {
                Some(tool) => format!("{}:{tool}", a.kind.0),
                None => a.kind.0.clone(),
            });

        Some(JobStatusView {
            status: job.status,
            result: job.result,
            error: job.error,
            question: job.question,
            question_options: job.question_options,
            activities,
            current_operation,
            suggestions: self.queue.get_suggestions(job_id),
        })
    }

    /// Respond to a job's pending question (transitions
    /// `waiting_for_input -> running`).
    pub fn respond_to_question(&self, job_id: &Id, text: impl Into<String>) -> Result<()> {
        self.queue.set_response(job_id, text)
    }

    /// Cooperatively cancel a running job and any sub-agents registered
    /// under it.
    pub fn cancel_job(&self, job_id: &Id) {
        self.queue.cancel(job_id);
        self.cancel_map.cancel(job_id);
    }

    /// Stop further tool calls and force a final user-facing message on the
    /// next loop iteration.
    pub fn force_respond(&self, job_id: &Id) {
        self.queue.force_respond(job_id);
    }

    // ── Worker loop ──────────────────────────────────────────────────────

    /// Drive one job to completion: registers its cancel token, transitions
    /// `pending -> running`, runs the turn, and persists the outcome.
    pub async fn run_job(&self, job_id: Id) {
        let Some(job) = self.queue.get_job(&job_id) else { return };
        let cancel = self.cancel_map.register(&job_id);
        if let Err(e) = self.queue.set_status(&job_id, JobStatus::Running, None, None) {
            tracing::warn!(job_id = %job_id, error = %e, "failed to mark job running");
            self.cancel_map.remove(&job_id);
            return;
        }

        let input = TurnInput {
            job_id: job_id.clone(),
            conversation_id: job.conversation_id.clone(),
            user_message: job.message.clone(),
            skip_history: job.skip_history,
            headless: job.headless,
            ask_user_default: job.ask_user_default.clone(),
        };

        let outcome: TurnOutcome = turn::run_turn(&self.turn_deps(), input, &cancel).await;
        self.persist_outcome(&job_id, outcome);
        self.cancel_map.remove(&job_id);
    }

    fn persist_outcome(&self, job_id: &Id, outcome: TurnOutcome) {
        use turn::TurnStatus;
        let status = match outcome.status {
            TurnStatus::Success => JobStatus::Completed,
            TurnStatus::WaitingForInput => JobStatus::WaitingForInput,
            TurnStatus::Cancelled => JobStatus::Cancelled,
            TurnStatus::Timeout | TurnStatus::Error => JobStatus::Failed,
        };
        let (result, error) = match outcome.status {
            TurnStatus::Success | TurnStatus::WaitingForInput => (outcome.summary, None),
            _ => (None, outcome.summary),
        };
        if status == JobStatus::WaitingForInput {
            if let Some(q) = &error.clone().or_else(|| result.clone()) {
                let _ = self.queue.set_question(job_id, q.clone(), None);
            }
            return;
        }
        let _ = self.queue.set_status(job_id, status, result, error);
    }

    /// Pull jobs off the queue forever, running one at a time per call site
    /// (callers spawn as many of these as their worker-pool size requires).
    /// Grounded on the teacher's `main.rs` periodic `tokio::spawn` loops.
    pub async fn run_worker_loop(self: &Arc<Self>) {
        loop {
            if let Some(job_id) = self.queue.dequeue(Duration::from_secs(1)).await {
                self.run_job(job_id).await;
            }
        }
    }

    /// Tick the scheduler on a fixed interval forever.
    pub async fn run_scheduler_loop(self: &Arc<Self>) {
        self.scheduler.register_all_on_startup().ok();
        let mut interval = tokio::time::interval(self.scheduler_tick_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.scheduler.tick() {
                tracing::warn!(error = %e, "scheduler tick failed");
            }
        }
    }

    // ── Conversation CRUD (spec §6) ──────────────────────────────────────

    pub fn get_conversation(&self, id: &Id) -> Option<Conversation> {
        self.store.get_conversation(id)
    }

    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.store.list_conversations()
    }

    pub fn rename_conversation(&self, id: &Id, preview: String) -> Result<bool> {
        self.store.rename_conversation(id, preview)
    }

    pub fn archive_conversation(&self, id: &Id) -> Result<bool> {
        self.store.set_archived(id, true)
    }

    pub fn restore_conversation(&self, id: &Id) -> Result<bool> {
        self.store.set_archived(id, false)
    }

    pub fn mark_read(&self, id: &Id) -> Result<bool> {
        self.store.mark_read(id)
    }

    pub fn mark_unread(&self, id: &Id) -> Result<bool> {
        self.store.mark_unread(id)
    }

    pub fn fork_conversation(&self, source_id: &Id, up_to_message_id: i64) -> Result<Conversation> {
        self.store.fork_conversation(source_id, up_to_message_id)
    }

    pub fn delete_conversation(&self, id: &Id) -> Result<()> {
        self.store.delete_conversation(id)
    }

    // ── Scheduled-job CRUD (spec §6) ─────────────────────────────────────

    pub fn list_scheduled_jobs(&self) -> Vec<ScheduledJob> {
        self.store.list_scheduled_jobs()
    }

    pub fn create_scheduled_job(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        self.scheduler.add_scheduled_job(job)
    }

    pub fn update_scheduled_job<F>(&self, id: &Id, f: F) -> Result<bool>
    where
        F: FnOnce(&mut ScheduledJob),
    {
        let changed = self.store.update_scheduled_job(id, f)?;
        if changed {
            self.scheduler.reschedule(id)?;
        }
        Ok(changed)
    }

    pub fn set_scheduled_job_enabled(&self, id: &Id, enabled: bool) -> Result<bool> {
        self.store.update_scheduled_job(id, |job| job.is_enabled = enabled)
    }

    pub fn delete_scheduled_job(&self, id: &Id) -> Result<()> {
        self.scheduler.delete_scheduled_job(id)
    }

    pub fn trigger_scheduled_job_now(&self, id: &Id) -> Result<()> {
        self.scheduler.trigger_now(id)
    }

    pub fn list_scheduled_runs(&self, scheduled_job_id: &Id) -> Vec<ScheduledJobRun> {
        self.store.list_scheduled_runs(scheduled_job_id)
    }

    // ── Settings (spec §6) ───────────────────────────────────────────────

    pub fn read_settings(&self) -> SettingsView {
        let registry = self.router.registry();
        SettingsView {
            configured: !registry.is_empty(),
            providers: registry.list_providers(),
            roles: registry.list_roles(),
        }
    }

    /// Persist a provider API key to a `.env` file outside the durable
    /// store, preserving any unrelated lines already there. Ported from
    /// the original deployment's `/setup` handler.
    pub fn write_api_key(&self, env_path: &Path, env_var: &str, key: &str) -> std::io::Result<()> {
        let mut lines: Vec<String> = if env_path.exists() {
            std::fs::read_to_string(env_path)?
                .lines()
                .filter(|line| !line.trim_start().starts_with(&format!("{env_var}=")))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        lines.push(format!("{env_var}={key}"));
        if let Some(parent) = env_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(env_path, lines.join("\n") + "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_domain::config::{AuthConfig, LlmConfig, ProviderConfig, ProviderKind};

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            workspace: warden_domain::config::WorkspaceConfig { path: dir.join("workspace") },
            store: warden_domain::config::StoreConfig { path: dir.join("state") },
            skills: warden_domain::config::SkillsConfig { path: dir.join("skills") },
            llm: LlmConfig::default(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn create_job_creates_conversation_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::new(test_config(dir.path())).unwrap();
        let job = warden.create_job(None, "hello", true, Some(String::new())).await.unwrap();
        assert!(warden.get_conversation(&job.conversation_id).is_some());
    }

    #[tokio::test]
    async fn poll_job_reports_pending_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::new(test_config(dir.path())).unwrap();
        let job = warden.create_job(None, "hello", true, None).await.unwrap();
        let status = warden.poll_job(&job.id, 0).unwrap();
        assert_eq!(status.status, JobStatus::Pending);
    }

    #[test]
    fn mark_read_then_unread_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::new(test_config(dir.path())).unwrap();
        let conv = warden.store.create_conversation(None).unwrap();
        warden.mark_read(&conv.id).unwrap();
        assert!(warden.get_conversation(&conv.id).unwrap().read_at.is_some());
        warden.mark_unread(&conv.id).unwrap();
        assert!(warden.get_conversation(&conv.id).unwrap().read_at.is_none());
    }

    #[test]
    fn write_api_key_preserves_unrelated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::new(test_config(dir.path())).unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "SOME_OTHER_VAR=keep\nOPENAI_API_KEY=old\n").unwrap();
        warden.write_api_key(&env_path, "OPENAI_API_KEY", "sk-new").unwrap();
        let content = std::fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("SOME_OTHER_VAR=keep"));
        assert!(content.contains("OPENAI_API_KEY=sk-new"));
        assert!(!content.contains("OPENAI_API_KEY=old"));
    }

    #[test]
    fn scheduled_job_crud_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let warden = Warden::new(test_config(dir.path())).unwrap();
        let now = chrono::Utc::now();
        let job = ScheduledJob {
            id: "sched-1".into(),
            conversation_id: String::new(),
            name: "daily digest".into(),
            prompt: "summarize today".into(),
            cron_expression: "0 9 * * *".into(),
            schedule_description: "every day at 9am".into(),
            timezone: "Europe/Warsaw".into(),
            is_enabled: true,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            context_json: None,
            files_dir: None,
        };
        let created = warden.create_scheduled_job(job).unwrap();
        assert!(created.next_run_at.is_some());
        warden.set_scheduled_job_enabled(&created.id, false).unwrap();
        assert!(!warden.store.get_scheduled_job(&created.id).unwrap().is_enabled);
        warden.delete_scheduled_job(&created.id).unwrap();
        assert!(warden.store.get_scheduled_job(&created.id).is_none());
    }

    #[allow(unused)]
    fn _unused_imports_anchor(_p: ProviderConfig, _k: ProviderKind, _a: AuthConfig) {}
}
