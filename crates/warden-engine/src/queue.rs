//! In-process job queue (spec §4.B): FIFO of pending job ids, a job-state
//! cache, and the ask-user rendezvous. Grounded on the teacher's
//! `session_lock.rs` (per-key primitive registered lazily, guarded by a
//! `parking_lot::Mutex`) and `approval.rs` (oneshot-channel rendezvous keyed
//! by id, with a caller-supplied timeout).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use warden_domain::model::{Id, Job, JobStatus};
use warden_domain::{Error, Result};
use warden_store::{JobOptions, Store};

/// Process-lifetime cache of job state plus the pending FIFO and the
/// ask-user rendezvous. One instance is shared across all workers.
pub struct JobQueue {
    store: Arc<Store>,
    cache: RwLock<HashMap<Id, Job>>,
    pending_tx: mpsc::UnboundedSender<Id>,
    pending_rx: AsyncMutex<mpsc::UnboundedReceiver<Id>>,
    /// Senders fire when `set_response` delivers a user reply.
    waiters: parking_lot::Mutex<HashMap<Id, oneshot::Sender<String>>>,
    /// Receivers are taken out (moved) the first time something waits.
    receivers: parking_lot::Mutex<HashMap<Id, oneshot::Receiver<String>>>,
    suggestions: RwLock<HashMap<Id, Vec<String>>>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            pending_tx,
            pending_rx: AsyncMutex::new(pending_rx),
            waiters: parking_lot::Mutex::new(HashMap::new()),
            receivers: parking_lot::Mutex::new(HashMap::new()),
            suggestions: RwLock::new(HashMap::new()),
        }
    }

    /// Persist the initial row and cache it. Does not enqueue — call
    /// [`JobQueue::enqueue`] separately once the caller is ready.
    pub fn create_job(
        &self,
        conversation_id: &str,
        message: impl Into<String>,
        opts: JobOptions,
    ) -> Result<Job> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let job = self
            .store
            .create_job(job_id, conversation_id.to_owned(), message.into(), opts)?;
        self.cache.write().insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub fn enqueue(&self, job_id: &Id) {
        let _ = self.pending_tx.send(job_id.clone());
    }

    /// Block until a job is available or `timeout` elapses.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Id> {
        let mut rx = self.pending_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub fn get_job(&self, job_id: &Id) -> Option<Job> {
        if let Some(job) = self.cache.read().get(job_id).cloned() {
            return Some(job);
        }
        self.store.get_job(job_id)
    }

    pub fn get_job_field<T>(&self, job_id: &Id, f: impl FnOnce(&Job) -> T) -> Option<T> {
        self.get_job(job_id).as_ref().map(f)
    }

    pub fn get_active_job_for_conversation(&self, conversation_id: &str) -> Option<Job> {
        self.cache
            .read()
            .values()
            .filter(|j| j.conversation_id == conversation_id)
            .find(|j| {
                matches!(
                    j.status,
                    JobStatus::Pending | JobStatus::Running | JobStatus::WaitingForInput
                )
            })
            .cloned()
    }

    /// Update cached status (and any of the optional terminal fields);
    /// durably persists on transition to `running` or any terminal status.
    pub fn set_status(
        &self,
        job_id: &Id,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        let is_durable_point = matches!(
            status,
            JobStatus::Running | JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        );

        let updated = {
            let mut cache = self.cache.write();
            let job = cache
                .get_mut(job_id)
                .ok_or_else(|| Error::Store(format!("unknown job {job_id}")))?;
            job.status = status;
            let now = chrono::Utc::now();
            match status {
                JobStatus::Running if job.started_at.is_none() => job.started_at = Some(now),
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                    job.completed_at = Some(now)
                }
                _ => {}
            }
            if result.is_some() {
                job.result = result;
            }
            if error.is_some() {
                job.error = error;
            }
            job.clone()
        };

        if is_durable_point {
            self.store.save_job(updated)?;
        }
        Ok(())
    }

    /// Transition `running -> waiting_for_input`, stash the question, and
    /// install a fresh rendezvous channel for the reply.
    pub fn set_question(
        &self,
        job_id: &Id,
        question: impl Into<String>,
        options: Option<Vec<String>>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(job_id.clone(), tx);
        self.receivers.lock().insert(job_id.clone(), rx);

        let updated = {
            let mut cache = self.cache.write();
            let job = cache
                .get_mut(job_id)
                .ok_or_else(|| Error::Store(format!("unknown job {job_id}")))?;
            job.status = JobStatus::WaitingForInput;
            job.question = Some(question.into());
            job.question_options = options;
            job.clone()
        };
        self.store.save_job(updated)
    }

    /// Block the caller until the rendezvous is signalled or `timeout`
    /// elapses. Returns `None` on timeout (the job remains waiting).
    pub async fn wait_for_response_sync(&self, job_id: &Id, timeout: Duration) -> Option<String> {
        let rx = self.receivers.lock().remove(job_id)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            _ => None,
        }
    }

    /// Record the user's reply, flip the job back to `running`, and signal
    /// whichever worker is blocked in [`JobQueue::wait_for_response_sync`].
    pub fn set_response(&self, job_id: &Id, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        let updated = {
            let mut cache = self.cache.write();
            let job = cache
                .get_mut(job_id)
                .ok_or_else(|| Error::Store(format!("unknown job {job_id}")))?;
            job.user_response = Some(text.clone());
            job.status = JobStatus::Running;
            job.clone()
        };
        self.store.save_job(updated)?;
        if let Some(tx) = self.waiters.lock().remove(job_id) {
            let _ = tx.send(text);
        }
        Ok(())
    }

    pub fn cancel(&self, job_id: &Id) {
        if let Some(job) = self.cache.write().get_mut(job_id) {
            job.is_cancelled = true;
        }
    }

    pub fn force_respond(&self, job_id: &Id) {
        if let Some(job) = self.cache.write().get_mut(job_id) {
            job.is_force_respond = true;
        }
    }

    pub fn set_suggestions(&self, job_id: &Id, suggestions: Vec<String>) {
        self.suggestions.write().insert(job_id.clone(), suggestions);
    }

    pub fn get_suggestions(&self, job_id: &Id) -> Vec<String> {
        self.suggestions.read().get(job_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn queue() -> (JobQueue, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        (JobQueue::new(store), dir)
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_fifo() {
        let (q, _dir) = queue();
        let conv = q.store.create_conversation(None).unwrap();
        let job_a = q.create_job(&conv.id, "a", JobOptions::default()).unwrap();
        let job_b = q.create_job(&conv.id, "b", JobOptions::default()).unwrap();
        q.enqueue(&job_a.id);
        q.enqueue(&job_b.id);

        let first = q.dequeue(Duration::from_millis(50)).await.unwrap();
        let second = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first, job_a.id);
        assert_eq!(second, job_b.id);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let (q, _dir) = queue();
        assert!(q.dequeue(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn ask_user_rendezvous_round_trips() {
        let (q, _dir) = queue();
        let conv = q.store.create_conversation(None).unwrap();
        let job = q.create_job(&conv.id, "hi", JobOptions::default()).unwrap();
        q.set_status(&job.id, JobStatus::Running, None, None).unwrap();
        q.set_question(&job.id, "which format?", Some(vec!["PDF".into()]))
            .unwrap();

        let q = Arc::new(q);
        let q2 = q.clone();
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move { q2.wait_for_response_sync(&job_id, Duration::from_secs(1)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        q.set_response(&job.id, "PDF").unwrap();

        let response = handle.await.unwrap();
        assert_eq!(response, Some("PDF".to_string()));
        assert_eq!(q.get_job(&job.id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn cancel_and_force_respond_are_cooperative_flags() {
        let (q, _dir) = queue();
        let conv = q.store.create_conversation(None).unwrap();
        let job = q.create_job(&conv.id, "hi", JobOptions::default()).unwrap();
        q.cancel(&job.id);
        q.force_respond(&job.id);
        let cached = q.get_job(&job.id).unwrap();
        assert!(cached.is_cancelled);
        assert!(cached.is_force_respond);
    }

    #[test]
    fn active_job_lookup_filters_terminal_states() {
        let (q, _dir) = queue();
        let conv = q.store.create_conversation(None).unwrap();
        let job = q.create_job(&conv.id, "hi", JobOptions::default()).unwrap();
        assert!(q.get_active_job_for_conversation(&conv.id).is_some());
        q.set_status(&job.id, JobStatus::Completed, Some("done".into()), None)
            .unwrap();
        assert!(q.get_active_job_for_conversation(&conv.id).is_none());
    }
}
