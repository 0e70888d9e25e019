use serde::{Deserialize, Serialize};
use std::fmt;

use crate::manifest::{SkillManifest, SkillReadiness};

/// Risk tier for a skill — controls permission prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Pure,
    Io,
    Net,
    Admin,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Pure => write!(f, "PURE"),
            RiskTier::Io => write!(f, "IO"),
            RiskTier::Net => write!(f, "NET"),
            RiskTier::Admin => write!(f, "ADMIN"),
        }
    }
}

/// A skill definition loaded from `skill.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    pub location: String,
    pub risk: RiskTier,
    #[serde(default)]
    pub inputs: Option<String>,
    #[serde(default)]
    pub outputs: Option<String>,
    #[serde(default)]
    pub permission_scope: Option<String>,
    /// Populated from SKILL.md frontmatter, if present; `skill.toml` itself
    /// carries none of this.
    #[serde(skip)]
    pub manifest: Option<SkillManifest>,
    #[serde(skip)]
    pub readiness: Option<SkillReadiness>,
}

impl SkillEntry {
    /// A skill with no frontmatter-derived readiness check is assumed ready.
    pub fn is_ready(&self) -> bool {
        self.readiness
            .as_ref()
            .map(|r| r.status == crate::manifest::ReadinessStatus::Ready)
            .unwrap_or(true)
    }

    pub fn render_index_line(&self) -> String {
        let mut line = format!("- {}: {}", self.name, self.description);
        line.push_str(&format!(" location={}", self.location));
        line.push_str(&format!(" risk={}", self.risk));
        if let Some(ref inputs) = self.inputs {
            line.push_str(&format!(" inputs={inputs}"));
        }
        if let Some(ref outputs) = self.outputs {
            line.push_str(&format!(" outputs={outputs}"));
        }
        line
    }
}
