//! CRON-driven Scheduler (spec §4.K): fires enabled scheduled jobs into a
//! fresh, history-suppressed conversation on their own schedule.
//!
//! Grounded on the teacher's `gateway/runtime/schedules.rs` (the hand-rolled
//! 5-field cron evaluator: field matching, validation, and a minute-by-minute
//! `cron_next_tz` forward scan with DST gap/ambiguity handling) and
//! `schedule_runner.rs`'s missed-window accounting, collapsed to the single
//! policy spec.md §5 calls for ("missed fires are not replayed" — at most one
//! run per tick, `next_run_at` always recomputed from `now`, never replayed
//! from the old due time). The fire sequence itself (appendix construction,
//! `files_dir`, `ScheduledJobRun` bookkeeping) follows
//! `original_source/user_container/scheduler/scheduler.py`.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};

use warden_domain::model::{ScheduledJob, ScheduledJobRun, ScheduledRunStatus};
use warden_domain::{Error, Result};
use warden_store::{JobOptions, Store};

use crate::queue::JobQueue;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Validate a 5-field cron expression.
pub fn validate_cron(cron: &str) -> std::result::Result<(), String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "expected 5 fields (minute hour dom month dow), got {}",
            fields.len()
        ));
    }
    let names = ["minute", "hour", "day-of-month", "month", "day-of-week"];
    let ranges: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];
    for (i, field) in fields.iter().enumerate() {
        validate_cron_field(field, names[i], ranges[i].0, ranges[i].1)?;
    }
    Ok(())
}

fn validate_cron_field(field: &str, name: &str, min: u32, max: u32) -> std::result::Result<(), String> {
    if field == "*" {
        return Ok(());
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| format!("{name}: invalid step '*/{step}' — expected a number"))?;
        if n == 0 || n > max {
            return Err(format!("{name}: step {n} out of range 1..={max}"));
        }
        return Ok(());
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            let start: u32 = start_s
                .parse()
                .map_err(|_| format!("{name}: invalid range start '{start_s}'"))?;
            let end: u32 = end_s
                .parse()
                .map_err(|_| format!("{name}: invalid range end '{end_s}'"))?;
            if start < min || start > max || end < min || end > max {
                return Err(format!("{name}: range {start}-{end} out of bounds {min}..={max}"));
            }
            if start > end {
                return Err(format!("{name}: range start {start} > end {end}"));
            }
        } else {
            let n: u32 = part.parse().map_err(|_| format!("{name}: invalid value '{part}'"))?;
            if n < min || n > max {
                return Err(format!("{name}: value {n} out of range {min}..={max}"));
            }
        }
    }
    Ok(())
}

fn cron_matches_naive(cron: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Compute the next occurrence after `after` for a 5-field cron expression,
/// evaluated in `timezone`. Spring-forward gaps are skipped; fall-back
/// ambiguity resolves to the earliest mapping.
pub fn next_run_after(cron: &str, after: &DateTime<Utc>, timezone: &str) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;
    let tz = parse_tz(timezone);

    let local_after = after.with_timezone(&tz).naive_local();
    let next_min_secs = 60 - (local_after.second() as i64);
    let mut candidate = local_after + chrono::Duration::seconds(next_min_secs);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60;
    for _ in 0..max_checks {
        if cron_matches_naive(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
                chrono::LocalResult::None => {}
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Scheduler {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Validate, compute `next_run_at`, and persist a new scheduled job.
    /// Spec §4.K "on add_scheduled_job".
    pub fn add_scheduled_job(&self, mut job: ScheduledJob) -> Result<ScheduledJob> {
        validate_cron(&job.cron_expression).map_err(Error::Config)?;
        let now = Utc::now();
        job.next_run_at = next_run_after(&job.cron_expression, &now, &job.timezone);
        job.created_at = now;
        job.updated_at = now;
        self.store.upsert_scheduled_job(job.clone())?;
        Ok(job)
    }

    /// Recompute `next_run_at` after the cron expression or timezone changes.
    pub fn reschedule(&self, scheduled_job_id: &str) -> Result<bool> {
        self.store.update_scheduled_job(scheduled_job_id, |job| {
            job.next_run_at = next_run_after(&job.cron_expression, &Utc::now(), &job.timezone);
            job.updated_at = Utc::now();
        })
    }

    pub fn delete_scheduled_job(&self, scheduled_job_id: &str) -> Result<()> {
        self.store.delete_scheduled_job(scheduled_job_id)
    }

    /// Called on a periodic tick. Fires every enabled job whose
    /// `next_run_at` has passed; at most one run per job per tick —
    /// any windows missed while the scheduler was down are not replayed.
    pub fn tick(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut fired = Vec::new();
        for job in self.store.list_enabled_scheduled_jobs() {
            let due = job.next_run_at.map(|t| t <= now).unwrap_or(false);
            if !due {
                continue;
            }
            self.fire(&job, &now)?;
            fired.push(job.id.clone());
        }
        Ok(fired)
    }

    /// Fire one scheduled job immediately, bypassing its `next_run_at`
    /// check (spec §6's "trigger-now" control-plane operation).
    pub fn trigger_now(&self, scheduled_job_id: &str) -> Result<()> {
        let job = self
            .store
            .get_scheduled_job(scheduled_job_id)
            .ok_or_else(|| Error::Store(format!("unknown scheduled job {scheduled_job_id}")))?;
        self.fire(&job, &Utc::now())
    }

    /// Load-time registration: startup simply defers to `tick`, since the
    /// store's `next_run_at` already reflects the last computed occurrence.
    /// Jobs that were never scheduled (freshly created rows with no
    /// `next_run_at`) get one computed here so the first tick can see them.
    pub fn register_all_on_startup(&self) -> Result<()> {
        for job in self.store.list_enabled_scheduled_jobs() {
            if job.next_run_at.is_none() {
                self.store.update_scheduled_job(&job.id, |j| {
                    j.next_run_at = next_run_after(&j.cron_expression, &Utc::now(), &j.timezone);
                })?;
            }
        }
        Ok(())
    }

    fn fire(&self, job: &ScheduledJob, now: &DateTime<Utc>) -> Result<()> {
        // Re-check: the job may have been disabled since `tick` listed it.
        let Some(current) = self.store.get_scheduled_job(&job.id) else {
            return Ok(());
        };
        if !current.is_enabled {
            return Ok(());
        }

        let conversation = self.store.create_scheduler_conversation(&job.id)?;
        let prompt = build_fire_prompt(&current);

        let message = warden_domain::model::Message {
            id: 0,
            conversation_id: conversation.id.clone(),
            role: warden_domain::model::Role::User,
            content: Some(prompt.clone()),
            tool_calls: None,
            tool_call_id: None,
            thinking: None,
            thinking_signature: None,
            metadata: None,
            internal: false,
            created_at: *now,
        };
        self.store.append_message(&conversation.id, message)?;

        let opts = JobOptions {
            headless: true,
            ask_user_default: Some(String::new()),
            skip_history: true,
        };
        let created = self.queue.create_job(&conversation.id, prompt, opts)?;
        self.queue.enqueue(&created.id);

        let next_run_at = next_run_after(&current.cron_expression, now, &current.timezone);
        self.store.update_scheduled_job(&job.id, |j| {
            j.last_run_at = Some(*now);
            j.next_run_at = next_run_at;
            j.run_count += 1;
        })?;

        self.store.append_scheduled_run(ScheduledJobRun {
            id: 0,
            scheduled_job_id: job.id.clone(),
            job_id: created.id,
            started_at: *now,
            completed_at: None,
            status: ScheduledRunStatus::Pending,
            result_preview: None,
        })?;

        Ok(())
    }
}

/// Build the effective prompt: the stored prompt plus, when present, an
/// appendix enumerating the job's context (variables/steps captured at
/// creation time) and its files directory (spec §4.K step 3).
fn build_fire_prompt(job: &ScheduledJob) -> String {
    let mut out = job.prompt.clone();
    let mut appendix = String::new();
    if let Some(ctx) = &job.context_json {
        appendix.push_str(&format!("\n\nContext:\n{ctx}"));
    }
    if let Some(dir) = &job.files_dir {
        appendix.push_str(&format!("\n\nFiles directory: {dir}"));
    }
    if !appendix.is_empty() {
        out.push_str(&appendix);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let queue = Arc::new(JobQueue::new(store.clone()));
        (Scheduler::new(store, queue), dir)
    }

    fn new_job(cron: &str) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: String::new(),
            name: "digest".into(),
            prompt: "summarize today".into(),
            cron_expression: cron.into(),
            schedule_description: "every minute".into(),
            timezone: "UTC".into(),
            is_enabled: true,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            context_json: None,
            files_dir: None,
        }
    }

    #[test]
    fn validate_cron_rejects_wrong_field_count() {
        assert!(validate_cron("* * *").is_err());
    }

    #[test]
    fn validate_cron_accepts_standard_fields() {
        assert!(validate_cron("*/5 9-17 * * 1-5").is_ok());
    }

    #[test]
    fn validate_cron_rejects_out_of_range() {
        assert!(validate_cron("60 * * * *").is_err());
    }

    #[test]
    fn next_run_after_rolls_forward_to_next_minute_boundary() {
        use chrono::TimeZone;
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 30).unwrap();
        let next = next_run_after("0 * * * *", &after, "UTC").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn add_scheduled_job_rejects_invalid_cron() {
        let (sched, _dir) = scheduler();
        let mut job = new_job("bad cron");
        job.cron_expression = "not a cron".into();
        assert!(sched.add_scheduled_job(job).is_err());
    }

    #[test]
    fn add_scheduled_job_computes_next_run_at() {
        let (sched, _dir) = scheduler();
        let job = sched.add_scheduled_job(new_job("* * * * *")).unwrap();
        assert!(job.next_run_at.is_some());
    }

    #[test]
    fn tick_fires_due_job_and_advances_next_run_at() {
        let (sched, _dir) = scheduler();
        let mut job = new_job("* * * * *");
        job.next_run_at = Some(Utc::now() - chrono::Duration::minutes(5));
        sched.store.upsert_scheduled_job(job.clone()).unwrap();

        let fired = sched.tick().unwrap();
        assert_eq!(fired, vec![job.id.clone()]);

        let updated = sched.store.get_scheduled_job(&job.id).unwrap();
        assert_eq!(updated.run_count, 1);
        assert!(updated.last_run_at.is_some());
        assert!(updated.next_run_at.unwrap() > Utc::now());
    }

    #[test]
    fn tick_skips_disabled_job() {
        let (sched, _dir) = scheduler();
        let mut job = new_job("* * * * *");
        job.is_enabled = false;
        job.next_run_at = Some(Utc::now() - chrono::Duration::minutes(5));
        sched.store.upsert_scheduled_job(job.clone()).unwrap();

        let fired = sched.tick().unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn fire_creates_skip_history_job() {
        let (sched, _dir) = scheduler();
        let mut job = new_job("* * * * *");
        job.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        sched.store.upsert_scheduled_job(job.clone()).unwrap();
        sched.tick().unwrap();

        let conversations = sched.store.list_conversations();
        let conv = conversations.iter().find(|c| c.scheduler_id.as_deref() == Some(job.id.as_str())).unwrap();
        assert!(conv.is_scheduler_run);
    }
}
