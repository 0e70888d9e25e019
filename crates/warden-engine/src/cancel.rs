//! Cooperative cancellation (spec §4.J.7, §5): a boolean flag per job plus
//! parent→child group cascading so a cancelled delegate/explore sub-agent
//! stops when its parent job is cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A single cancellable flag, cheap to clone and check from any task.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Registry of per-job cancel tokens plus parent→child cascade groups.
///
/// A job registers its token on start. Sub-agent executors spawned for
/// that job are added to its group; cancelling the parent cancels every
/// child token registered under it.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh token for `job_id`, replacing any previous one.
    pub fn register(&self, job_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(job_id.to_owned(), token.clone());
        token
    }

    pub fn get(&self, job_id: &str) -> Option<CancelToken> {
        self.tokens.lock().get(job_id).cloned()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.tokens
            .lock()
            .get(job_id)
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    /// Cancel `job_id`'s own token and cascade to every job registered in
    /// its group.
    pub fn cancel(&self, job_id: &str) {
        if let Some(token) = self.tokens.lock().get(job_id) {
            token.cancel();
        }
        let children: Vec<String> = self
            .groups
            .lock()
            .get(job_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for child in children {
            self.cancel(&child);
        }
    }

    /// Drop the token for `job_id` and clear any group it owns.
    pub fn remove(&self, job_id: &str) {
        self.tokens.lock().remove(job_id);
        self.groups.lock().remove(job_id);
    }

    pub fn add_to_group(&self, parent_job_id: &str, child_job_id: &str) {
        self.groups
            .lock()
            .entry(parent_job_id.to_owned())
            .or_default()
            .insert(child_job_id.to_owned());
    }

    pub fn remove_from_group(&self, parent_job_id: &str, child_job_id: &str) {
        if let Some(set) = self.groups.lock().get_mut(parent_job_id) {
            set.remove(child_job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_flips_the_flag() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn register_then_cancel() {
        let map = CancelMap::new();
        map.register("job-1");
        assert!(map.is_running("job-1"));
        map.cancel("job-1");
        assert!(!map.is_running("job-1"));
    }

    #[test]
    fn cancel_unknown_job_is_a_no_op() {
        let map = CancelMap::new();
        map.cancel("ghost");
    }

    #[test]
    fn register_replaces_previous_token() {
        let map = CancelMap::new();
        let first = map.register("job-1");
        first.cancel();
        let second = map.register("job-1");
        assert!(!second.is_cancelled());
        assert!(map.is_running("job-1"));
    }

    #[test]
    fn cascades_to_group_children() {
        let map = CancelMap::new();
        map.register("parent");
        map.register("child-1");
        map.register("child-2");
        map.add_to_group("parent", "child-1");
        map.add_to_group("parent", "child-2");

        map.cancel("parent");

        assert!(!map.is_running("parent"));
        assert!(!map.is_running("child-1"));
        assert!(!map.is_running("child-2"));
    }

    #[test]
    fn cascade_is_transitive() {
        let map = CancelMap::new();
        map.register("grandparent");
        map.register("parent");
        map.register("child");
        map.add_to_group("grandparent", "parent");
        map.add_to_group("parent", "child");

        map.cancel("grandparent");

        assert!(!map.is_running("child"));
    }

    #[test]
    fn remove_from_group_stops_future_cascade() {
        let map = CancelMap::new();
        map.register("parent");
        map.register("child");
        map.add_to_group("parent", "child");
        map.remove_from_group("parent", "child");

        map.cancel("parent");

        assert!(map.is_running("child"));
    }

    #[test]
    fn remove_clears_owned_group() {
        let map = CancelMap::new();
        map.register("parent");
        map.register("child");
        map.add_to_group("parent", "child");

        map.remove("parent");
        map.register("parent");
        map.cancel("parent");

        // "child" was only reachable through the group that got cleared.
        assert!(map.is_running("child"));
    }

    #[test]
    fn remove_is_idempotent() {
        let map = CancelMap::new();
        map.register("job-1");
        map.remove("job-1");
        map.remove("job-1");
        assert!(!map.is_running("job-1"));
    }

    #[test]
    fn sibling_groups_are_independent() {
        let map = CancelMap::new();
        map.register("parent-a");
        map.register("parent-b");
        map.register("child-a");
        map.register("child-b");
        map.add_to_group("parent-a", "child-a");
        map.add_to_group("parent-b", "child-b");

        map.cancel("parent-a");

        assert!(!map.is_running("child-a"));
        assert!(map.is_running("child-b"));
        assert!(map.is_running("parent-b"));
    }

    #[test]
    fn unregistered_job_reports_not_running() {
        let map = CancelMap::new();
        assert!(!map.is_running("never-registered"));
    }
}
