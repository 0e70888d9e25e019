//! Skill discovery (spec §4.G): filesystem enumeration of
//! `skill.toml`/`SKILL.md` directories, manifest parsing and readiness
//! checks. The per-conversation TTL router that decides which of these
//! skills are active for a given turn lives in `warden-engine::skill_router`,
//! which consumes `SkillEntry` values from this crate.

pub mod loader;
pub mod manifest;
pub mod registry;
pub mod types;

pub use registry::{ReadinessSummary, SkillsRegistry};
pub use types::{RiskTier, SkillEntry};
