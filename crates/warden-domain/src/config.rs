use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace / store / skills paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "d_ws_path")]
    pub path: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { path: d_ws_path() }
    }
}

/// Where the Store persists its JSON/JSONL files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: d_state_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "d_skills_path")]
    pub path: PathBuf,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self { path: d_skills_path() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider system
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_20000u")]
    pub default_timeout_ms: u64,
    /// Max retry attempts on rate-limit (spec §4.C: cap 5 attempts).
    #[serde(default = "d_5")]
    pub max_retries: u32,
    /// Model roles: "default", "cheap", "routing" (spec §4.C three factories).
    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 20_000,
            max_retries: 5,
            roles: HashMap::new(),
            providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Format: "provider_id/model_name"
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Env var containing the API key.
    #[serde(default)]
    pub env: Option<String>,
    /// Direct key (for config-only setups; prefer env).
    #[serde(default)]
    pub key: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context manager (spec §4.E)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// usage_percent threshold above which `should_compress` fires.
    #[serde(default = "d_70")]
    pub compress_threshold_percent: f64,
    /// Conservative context-window ceiling used for `usage_percent`.
    #[serde(default = "d_200000")]
    pub max_context_tokens: usize,
    /// `recent_exchanges` default for `get_conversation_history`.
    #[serde(default = "d_6")]
    pub recent_exchanges: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            compress_threshold_percent: 70.0,
            max_context_tokens: 200_000,
            recent_exchanges: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "d_15")]
    pub initial_threshold: usize,
    #[serde(default = "d_10")]
    pub update_interval: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            initial_threshold: 15,
            update_interval: 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler (spec §4.K)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default IANA timezone for schedules that don't set their own.
    #[serde(default = "d_timezone")]
    pub default_timezone: String,
    /// How often the scheduler tick runs.
    #[serde(default = "d_30")]
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timezone: d_timezone(),
            tick_interval_secs: 30,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job (spec §4.B, §4.J, §5)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "d_100")]
    pub max_steps: usize,
    #[serde(default = "d_1800")]
    pub max_job_runtime_secs: u64,
    #[serde(default = "d_300")]
    pub ask_user_timeout_secs: u64,
    #[serde(default = "d_5")]
    pub reflection_interval: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_job_runtime_secs: 1800,
            ask_user_timeout_secs: 300,
            reflection_interval: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agents (spec §4.I)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "d_10")]
    pub delegate_max_steps: usize,
    #[serde(default = "d_15")]
    pub explore_max_steps: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            delegate_max_steps: 10,
            explore_max_steps: 15,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default value helpers (serde)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_ws_path() -> PathBuf {
    PathBuf::from("./workspace")
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_skills_path() -> PathBuf {
    PathBuf::from("./skills")
}
fn d_20000u() -> u64 {
    20_000
}
fn d_5() -> u32 {
    5
}
fn d_70() -> f64 {
    70.0
}
fn d_200000() -> usize {
    200_000
}
fn d_6() -> usize {
    6
}
fn d_15() -> usize {
    15
}
fn d_10() -> usize {
    10
}
fn d_timezone() -> String {
    "Europe/Warsaw".into()
}
fn d_30() -> u64 {
    30
}
fn d_100() -> usize {
    100
}
fn d_1800() -> u64 {
    1800
}
fn d_300() -> u64 {
    300
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration. Empty result means no issues.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.llm.providers.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "llm.providers".into(),
                message: "no LLM providers configured".into(),
            });
        }

        let mut seen_ids = std::collections::HashSet::new();
        for (i, provider) in self.llm.providers.iter().enumerate() {
            if provider.id.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].id"),
                    message: "provider id must not be empty".into(),
                });
            }
            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
            {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].base_url"),
                    message: format!(
                        "base_url must start with http:// or https:// (got \"{}\")",
                        provider.base_url
                    ),
                });
            }
            if !provider.id.is_empty() && !seen_ids.insert(provider.id.clone()) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: format!("llm.providers[{i}].id"),
                    message: format!("duplicate provider id \"{}\"", provider.id),
                });
            }
            let has_env = provider.auth.env.as_ref().is_some_and(|v| !v.is_empty());
            let has_key = provider.auth.key.as_ref().is_some_and(|v| !v.is_empty());
            if !has_env && !has_key {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].auth"),
                    message: format!(
                        "provider \"{}\" has neither auth.env nor auth.key set",
                        provider.id
                    ),
                });
            }
        }

        if self.scheduler.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "scheduler.default_timezone".into(),
                message: format!("unknown timezone \"{}\"", self.scheduler.default_timezone),
            });
        }

        if self.context.compress_threshold_percent <= 0.0
            || self.context.compress_threshold_percent > 100.0
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "context.compress_threshold_percent".into(),
                message: "must be in (0, 100]".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            llm: LlmConfig {
                providers: vec![ProviderConfig {
                    id: "openai".into(),
                    kind: ProviderKind::OpenaiCompat,
                    base_url: "https://api.openai.com/v1".into(),
                    auth: AuthConfig {
                        env: Some("OPENAI_API_KEY".into()),
                        key: None,
                    },
                    default_model: None,
                }],
                ..LlmConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        let issues = valid_config().validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn no_providers_is_warning() {
        let mut cfg = valid_config();
        cfg.llm.providers.clear();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "llm.providers" && e.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn missing_credentials_is_error() {
        let mut cfg = valid_config();
        cfg.llm.providers[0].auth = AuthConfig::default();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "llm.providers[0].auth" && e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn invalid_timezone_is_error() {
        let mut cfg = valid_config();
        cfg.scheduler.default_timezone = "Not/AZone".into();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "scheduler.default_timezone"));
    }

    #[test]
    fn duplicate_provider_ids_is_warning() {
        let mut cfg = valid_config();
        let dup = cfg.llm.providers[0].clone();
        cfg.llm.providers.push(dup);
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|e| e.message.contains("duplicate provider id")));
    }

    #[test]
    fn default_config_roundtrips_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string(&cfg).expect("serialize");
        let back: Config = toml::from_str(&s).expect("deserialize");
        assert_eq!(back.job.max_steps, cfg.job.max_steps);
    }
}
