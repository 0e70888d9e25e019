//! The Store (spec §4.A): durable mapping from entity ids to records, plus
//! the two non-trivial helpers (`get_conversation_history` compression,
//! `fork_conversation`) and the simple ones (`delete_messages_from` and
//! friends) that the rest of the data model needs.
//!
//! Grounded on the teacher's `sessions/store.rs` (HashMap + JSON-flush for
//! low-cardinality tables) and `gateway/runtime/runs.rs` (bounded ring +
//! JSONL append for high-cardinality, append-only tables). A single
//! `parking_lot::Mutex` serializes writers across tables — each table's own
//! `RwLock` makes a single-table mutation atomic, but multi-table sequences
//! (cascading delete) need the coarser lock too.

use std::path::Path;

use parking_lot::Mutex;

use warden_domain::error::{Error, Result};
use warden_domain::model::{
    AgentContext, Conversation, Job, JobActivity, JobStatus, Message, ScheduledJob,
    ScheduledJobRun, UsageLog,
};
use warden_domain::tool;

use crate::append_log::AppendLog;
use crate::history;
use crate::json_table::JsonTable;
use crate::messages::MessageTable;
use crate::shell_runs::ShellRun;

const MAX_ACTIVITIES_IN_MEMORY: usize = 5000;
const MAX_USAGE_IN_MEMORY: usize = 5000;
const MAX_SCHEDULED_RUNS_IN_MEMORY: usize = 2000;
const MAX_SHELL_RUNS_IN_MEMORY: usize = 2000;

/// Options accepted by `create_job` (spec §4.B).
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub headless: bool,
    pub ask_user_default: Option<String>,
    pub skip_history: bool,
}

pub struct Store {
    write_lock: Mutex<()>,
    conversations: JsonTable<Conversation>,
    messages: MessageTable,
    jobs: JsonTable<Job>,
    activities: AppendLog<JobActivity>,
    scheduled_jobs: JsonTable<ScheduledJob>,
    scheduled_runs: AppendLog<ScheduledJobRun>,
    agent_context: JsonTable<AgentContext>,
    usage: AppendLog<UsageLog>,
    shell_runs: AppendLog<ShellRun>,
}

impl Store {
    pub fn open(state_path: &Path) -> Result<Self> {
        Ok(Self {
            write_lock: Mutex::new(()),
            conversations: JsonTable::load(state_path, "conversations.json")?,
            messages: MessageTable::load(state_path)?,
            jobs: JsonTable::load(state_path, "jobs.json")?,
            activities: AppendLog::load(state_path, "activities.jsonl", MAX_ACTIVITIES_IN_MEMORY)?,
            scheduled_jobs: JsonTable::load(state_path, "scheduled_jobs.json")?,
            scheduled_runs: AppendLog::load(
                state_path,
                "scheduled_runs.jsonl",
                MAX_SCHEDULED_RUNS_IN_MEMORY,
            )?,
            agent_context: JsonTable::load(state_path, "agent_context.json")?,
            usage: AppendLog::load(state_path, "usage.jsonl", MAX_USAGE_IN_MEMORY)?,
            shell_runs: AppendLog::load(state_path, "runs.jsonl", MAX_SHELL_RUNS_IN_MEMORY)?,
        })
    }

    // ── Conversations ───────────────────────────────────────────────

    pub fn create_conversation(&self, preview: Option<String>) -> Result<Conversation> {
        let _g = self.write_lock.lock();
        let conv = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now(),
            preview,
            forked_from: None,
            branch_number: None,
            is_archived: false,
            scheduler_id: None,
            is_scheduler_run: false,
            read_at: None,
            summary: None,
            summary_up_to_message_id: None,
        };
        self.conversations.put(conv.id.clone(), conv.clone())?;
        Ok(conv)
    }

    /// Create the synthetic conversation a Scheduler fire needs (spec §4.K).
    pub fn create_scheduler_conversation(&self, scheduled_job_id: &str) -> Result<Conversation> {
        let _g = self.write_lock.lock();
        let conv = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now(),
            preview: None,
            forked_from: None,
            branch_number: None,
            is_archived: false,
            scheduler_id: Some(scheduled_job_id.to_string()),
            is_scheduler_run: true,
            read_at: None,
            summary: None,
            summary_up_to_message_id: None,
        };
        self.conversations.put(conv.id.clone(), conv.clone())?;
        Ok(conv)
    }

    pub fn get_conversation(&self, id: &str) -> Option<Conversation> {
        self.conversations.get(id)
    }

    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.conversations.list()
    }

    pub fn rename_conversation(&self, id: &str, preview: String) -> Result<bool> {
        let _g = self.write_lock.lock();
        self.conversations.update(id, |c| c.preview = Some(preview))
    }

    pub fn set_archived(&self, id: &str, archived: bool) -> Result<bool> {
        let _g = self.write_lock.lock();
        self.conversations.update(id, |c| c.is_archived = archived)
    }

    pub fn mark_read(&self, id: &str) -> Result<bool> {
        let _g = self.write_lock.lock();
        let now = chrono::Utc::now();
        self.conversations.update(id, |c| c.read_at = Some(now))
    }

    pub fn mark_unread(&self, id: &str) -> Result<bool> {
        let _g = self.write_lock.lock();
        self.conversations.update(id, |c| c.read_at = None)
    }

    /// Idempotent: repeated calls with the same `up_to_message_id` are a
    /// no-op after the first (spec §8 round-trip law).
    pub fn save_conversation_summary(
        &self,
        id: &str,
        summary: String,
        up_to_message_id: i64,
    ) -> Result<bool> {
        let _g = self.write_lock.lock();
        self.conversations.update(id, |c| {
            c.summary = Some(summary);
            c.summary_up_to_message_id = Some(up_to_message_id);
        })
    }

    /// Deletion cascades to messages, activities, jobs, scheduled jobs,
    /// agent context (spec §3).
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock();
        self.messages.delete_conversation(id)?;
        self.agent_context.remove(id)?;

        for job in self.jobs.list().into_iter().filter(|j| j.conversation_id == id) {
            self.jobs.remove(&job.id)?;
        }
        for sched in self
            .scheduled_jobs
            .list()
            .into_iter()
            .filter(|s| s.conversation_id == id)
        {
            self.scheduled_jobs.remove(&sched.id)?;
        }
        self.conversations.remove(id)?;
        Ok(())
    }

    /// Atomically creates a new conversation whose `forked_from` chain
    /// depth determines `branch_number`, copies messages with
    /// `id <= up_to_message_id`, and copies the agent-context row.
    pub fn fork_conversation(&self, source_id: &str, up_to_message_id: i64) -> Result<Conversation> {
        let _g = self.write_lock.lock();
        let source = self
            .conversations
            .get(source_id)
            .ok_or_else(|| Error::Store(format!("conversation not found: {source_id}")))?;

        let mut depth = 1u32;
        let mut cursor = source.forked_from.clone();
        while let Some(parent_id) = cursor {
            depth += 1;
            cursor = self.conversations.get(&parent_id).and_then(|p| p.forked_from);
        }

        let fork = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now(),
            preview: source.preview.clone(),
            forked_from: Some(source_id.to_string()),
            branch_number: Some(depth),
            is_archived: false,
            scheduler_id: None,
            is_scheduler_run: false,
            read_at: None,
            summary: source.summary.clone(),
            summary_up_to_message_id: source.summary_up_to_message_id,
        };
        self.conversations.put(fork.id.clone(), fork.clone())?;
        self.messages.copy_up_to(source_id, &fork.id, up_to_message_id)?;

        if let Some(ctx) = self.agent_context.get(source_id) {
            let mut copy = ctx;
            copy.conversation_id = fork.id.clone();
            self.agent_context.put(fork.id.clone(), copy)?;
        }

        Ok(fork)
    }

    // ── Messages ────────────────────────────────────────────────────

    pub fn append_message(&self, conversation_id: &str, message: Message) -> Result<Message> {
        let _g = self.write_lock.lock();
        self.messages.append(conversation_id, message)
    }

    pub fn message_count(&self, conversation_id: &str) -> usize {
        self.messages.count(conversation_id)
    }

    pub fn list_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.messages.list(conversation_id)
    }

    /// Deletes the target message and all later messages in the same
    /// conversation (by `created_at`).
    pub fn delete_messages_from(&self, conversation_id: &str, message_id: i64) -> Result<usize> {
        let _g = self.write_lock.lock();
        self.messages.delete_from(conversation_id, message_id)
    }

    /// Spec §4.A's non-trivial compression helper.
    pub fn get_conversation_history(
        &self,
        conversation_id: &str,
        compress_old: bool,
        recent_exchanges: usize,
    ) -> Vec<tool::Message> {
        let rows = self.messages.list(conversation_id);
        history::get_conversation_history(&rows, compress_old, recent_exchanges)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        job_id: String,
        conversation_id: String,
        message: String,
        opts: JobOptions,
    ) -> Result<Job> {
        let _g = self.write_lock.lock();
        let job = Job {
            id: job_id,
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
            skip_history: opts.skip_history,
            headless: opts.headless,
            ask_user_default: opts.ask_user_default,
        };
        self.jobs.put(job.id.clone(), job.clone())?;
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id)
    }

    pub fn list_jobs_for_conversation(&self, conversation_id: &str) -> Vec<Job> {
        self.jobs
            .list()
            .into_iter()
            .filter(|j| j.conversation_id == conversation_id)
            .collect()
    }

    pub fn get_active_job_for_conversation(&self, conversation_id: &str) -> Option<Job> {
        self.jobs
            .list()
            .into_iter()
            .filter(|j| j.conversation_id == conversation_id)
            .find(|j| {
                matches!(
                    j.status,
                    JobStatus::Pending | JobStatus::Running | JobStatus::WaitingForInput
                )
            })
    }

    /// Durably persist a job row, e.g. on a status transition (spec §4.B:
    /// JobQueue caches in-memory and only calls through to the Store on
    /// transition to a terminal status or to `running`).
    pub fn save_job(&self, job: Job) -> Result<()> {
        let _g = self.write_lock.lock();
        self.jobs.put(job.id.clone(), job)
    }

    pub fn update_job<F>(&self, job_id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Job),
    {
        let _g = self.write_lock.lock();
        self.jobs.update(job_id, f)
    }

    // ── Job activities (append-only) ───────────────────────────────

    pub fn append_activity(&self, mut activity: JobActivity) -> Result<i64> {
        activity.timestamp = chrono::Utc::now();
        self.activities.append(activity)
    }

    pub fn list_activities_since(&self, job_id: &str, since_id: i64) -> Vec<JobActivity> {
        self.activities
            .since(since_id)
            .into_iter()
            .filter(|a| a.job_id == job_id)
            .collect()
    }

    pub fn list_activities(&self, job_id: &str) -> Vec<JobActivity> {
        self.activities
            .filter(|a| a.job_id == job_id)
    }

    // ── Scheduled jobs ───────────────────────────────────────────────

    pub fn upsert_scheduled_job(&self, job: ScheduledJob) -> Result<()> {
        let _g = self.write_lock.lock();
        self.scheduled_jobs.put(job.id.clone(), job)
    }

    pub fn get_scheduled_job(&self, id: &str) -> Option<ScheduledJob> {
        self.scheduled_jobs.get(id)
    }

    pub fn list_scheduled_jobs(&self) -> Vec<ScheduledJob> {
        self.scheduled_jobs.list()
    }

    pub fn list_enabled_scheduled_jobs(&self) -> Vec<ScheduledJob> {
        self.scheduled_jobs.list().into_iter().filter(|s| s.is_enabled).collect()
    }

    pub fn update_scheduled_job<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut ScheduledJob),
    {
        let _g = self.write_lock.lock();
        self.scheduled_jobs.update(id, f)
    }

    /// Removes the trigger-bearing row and clears `scheduler_id` on any
    /// conversation that points at it. Removing the on-disk `files_dir` is
    /// the scheduler's job, not the store's — it knows the path already.
    pub fn delete_scheduled_job(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock();
        for conv in self.conversations.list() {
            if conv.scheduler_id.as_deref() == Some(id) {
                self.conversations.update(&conv.id, |c| c.scheduler_id = None)?;
            }
        }
        self.scheduled_jobs.remove(id)?;
        Ok(())
    }

    pub fn append_scheduled_run(&self, run: ScheduledJobRun) -> Result<i64> {
        self.scheduled_runs.append(run)
    }

    pub fn list_scheduled_runs(&self, scheduled_job_id: &str) -> Vec<ScheduledJobRun> {
        self.scheduled_runs
            .filter(|r| r.scheduled_job_id == scheduled_job_id)
    }

    // ── Agent context ─────────────────────────────────────────────────

    pub fn get_agent_context(&self, conversation_id: &str) -> AgentContext {
        self.agent_context.get(conversation_id).unwrap_or_else(|| AgentContext {
            conversation_id: conversation_id.to_string(),
            skills: Default::default(),
        })
    }

    pub fn upsert_agent_context(&self, ctx: AgentContext) -> Result<()> {
        let _g = self.write_lock.lock();
        self.agent_context.put(ctx.conversation_id.clone(), ctx)
    }

    // ── Usage log (append-only) ────────────────────────────────────────

    pub fn append_usage(&self, mut usage: UsageLog) -> Result<i64> {
        usage.created_at = chrono::Utc::now();
        self.usage.append(usage)
    }

    pub fn get_conversation_cost(&self, conversation_id: &str) -> f64 {
        self.usage
            .filter(|u| u.conversation_id.as_deref() == Some(conversation_id))
            .iter()
            .map(|u| u.cost_usd)
            .sum()
    }

    // ── Shell run audit trail (supplemental, tools-layer owned) ──────

    pub fn record_shell_run(&self, run: ShellRun) -> Result<i64> {
        self.shell_runs.append(run)
    }

    pub fn list_shell_runs(&self, job_id: &str) -> Vec<ShellRun> {
        self.shell_runs
            .filter(|r| r.job_id.as_deref() == Some(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_domain::model::Role;

    fn user_msg(content: &str) -> Message {
        Message {
            id: 0,
            conversation_id: String::new(),
            role: Role::User,
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
    fn create_and_get_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let conv = store.create_conversation(Some("hi".into())).unwrap();
        let fetched = store.get_conversation(&conv.id).unwrap();
        assert_eq!(fetched.preview.as_deref(), Some("hi"));
    }

    #[test]
    fn mark_read_then_unread_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let conv = store.create_conversation(None).unwrap();
        assert!(store.get_conversation(&conv.id).unwrap().read_at.is_none());
        store.mark_read(&conv.id).unwrap();
        assert!(store.get_conversation(&conv.id).unwrap().read_at.is_some());
        store.mark_unread(&conv.id).unwrap();
        assert!(store.get_conversation(&conv.id).unwrap().read_at.is_none());
    }

    #[test]
    fn fork_then_delete_leaves_source_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let conv = store.create_conversation(None).unwrap();
        let m1 = store.append_message(&conv.id, user_msg("a")).unwrap();
        store.append_message(&conv.id, user_msg("b")).unwrap();

        let fork = store.fork_conversation(&conv.id, m1.id).unwrap();
        assert_eq!(fork.branch_number, Some(1));
        store.delete_conversation(&fork.id).unwrap();

        let source_messages = store.list_messages(&conv.id);
        assert_eq!(source_messages.len(), 2);
        assert!(store.get_conversation(&conv.id).is_some());
    }

    #[test]
    fn save_summary_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let conv = store.create_conversation(None).unwrap();
        store.save_conversation_summary(&conv.id, "s1".into(), 5).unwrap();
        store.save_conversation_summary(&conv.id, "s1".into(), 5).unwrap();
        let fetched = store.get_conversation(&conv.id).unwrap();
        assert_eq!(fetched.summary.as_deref(), Some("s1"));
        assert_eq!(fetched.summary_up_to_message_id, Some(5));
    }

    #[test]
    fn delete_conversation_cascades_to_jobs_and_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let conv = store.create_conversation(None).unwrap();
        store.append_message(&conv.id, user_msg("a")).unwrap();
        store
            .create_job(
                "job1".into(),
                conv.id.clone(),
                "do it".into(),
                JobOptions::default(),
            )
            .unwrap();

        store.delete_conversation(&conv.id).unwrap();

        assert!(store.get_conversation(&conv.id).is_none());
        assert!(store.list_messages(&conv.id).is_empty());
        assert!(store.get_job("job1").is_none());
    }

    #[test]
    fn job_lifecycle_terminal_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let conv = store.create_conversation(None).unwrap();
        store
            .create_job("job1".into(), conv.id.clone(), "msg".into(), JobOptions::default())
            .unwrap();

        store
            .update_job("job1", |j| {
                j.status = JobStatus::Running;
                j.started_at = Some(chrono::Utc::now());
            })
            .unwrap();
        store
            .update_job("job1", |j| {
                j.status = JobStatus::Completed;
                j.completed_at = Some(chrono::Utc::now());
            })
            .unwrap();

        let job = store.get_job("job1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());
    }

    #[test]
    fn activities_ordered_and_queryable_since() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for i in 0..3 {
            store
                .append_activity(JobActivity {
                    id: 0,
                    job_id: "job1".into(),
                    timestamp: chrono::Utc::now(),
                    kind: warden_domain::model::ActivityType::new("step"),
                    message: format!("step {i}"),
                    detail: None,
                    tool_name: None,
                    is_error: false,
                })
                .unwrap();
        }
        let all = store.list_activities("job1");
        assert_eq!(all.len(), 3);
        let since = store.list_activities_since("job1", all[0].id);
        assert_eq!(since.len(), 2);
    }

    #[test]
    fn usage_cost_sums_per_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for cost in [0.1, 0.2, 0.3] {
            store
                .append_usage(UsageLog {
                    id: 0,
                    job_id: None,
                    conversation_id: Some("c1".into()),
                    model: "gpt".into(),
                    provider: "openai".into(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    cost_usd: cost,
                    component: "default".into(),
                    created_at: chrono::Utc::now(),
                })
                .unwrap();
        }
        let total = store.get_conversation_cost("c1");
        assert!((total - 0.6).abs() < 1e-9);
    }

    #[test]
    fn scheduled_job_delete_clears_conversation_link() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let source = store.create_conversation(None).unwrap();
        store
            .upsert_scheduled_job(ScheduledJob {
                id: "sched1".into(),
                conversation_id: source.id.clone(),
                name: "daily".into(),
                prompt: "hi".into(),
                cron_expression: "* * * * *".into(),
                schedule_description: "every minute".into(),
                timezone: "Europe/Warsaw".into(),
                is_enabled: true,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                last_run_at: None,
                next_run_at: None,
                run_count: 0,
                context_json: None,
                files_dir: None,
            })
            .unwrap();
        let fired = store.create_scheduler_conversation("sched1").unwrap();
        store.delete_scheduled_job("sched1").unwrap();

        let refetched = store.get_conversation(&fired.id).unwrap();
        assert!(refetched.scheduler_id.is_none());
    }
}
