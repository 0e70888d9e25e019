//! `HasId` impls for the append-only domain rows. Kept separate from
//! `warden-domain` since `HasId` is this crate's storage-layer concern, not
//! part of the shared data model.

use warden_domain::model::{JobActivity, ScheduledJobRun, UsageLog};

use crate::append_log::HasId;

impl HasId for JobActivity {
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl HasId for ScheduledJobRun {
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl HasId for UsageLog {
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}
