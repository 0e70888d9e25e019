//! Durable state for warden (spec §3/§4.A): conversations, messages, jobs,
//! activities, scheduled jobs, agent context, usage, and the shell-run audit
//! trail, behind a single `Store` facade.

pub mod append_log;
pub mod history;
pub mod ids;
pub mod json_table;
pub mod messages;
pub mod shell_runs;
pub mod store;

pub use shell_runs::ShellRun;
pub use store::{JobOptions, Store};
