//! The supplemental `runs` table: a flat, append-only audit log of shell
//! commands executed through the tools layer. Not interpreted by the
//! engine — purely an observability trail, grounded on
//! `original_source/user_container/db/db.py` + `usage/tracker.py`'s
//! append-only run-record pattern.

use serde::{Deserialize, Serialize};

use crate::append_log::HasId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRun {
    pub id: i64,
    pub job_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl HasId for ShellRun {
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}
