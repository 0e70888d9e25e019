pub mod cancel;
pub mod context;
pub mod queue;
pub mod routing;
pub mod scheduler;
pub mod skill_router;
pub mod subagent;
pub mod summarizer;
pub mod tools;
pub mod turn;
pub mod warden;
