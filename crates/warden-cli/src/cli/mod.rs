pub mod config;
pub mod doctor;
pub mod run;

use clap::{Parser, Subcommand};

/// warden — a single-user, locally hosted AI agent runtime.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the worker and scheduler loops (default when no subcommand is given).
    Serve,
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Send a single message to the agent and print the response.
    Run {
        /// The message to send.
        message: String,
        /// Conversation id to continue (creates a new conversation if omitted).
        #[arg(long)]
        conversation: Option<String>,
        /// Output the full job result as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load configuration from the path named by `WARDEN_CONFIG` (or
/// `config.toml` by default), then apply a small set of environment
/// overrides read at startup (paths, tuning knobs) on top of it.
///
/// Shared by `serve`, `doctor`, `run`, and `config` so the logic lives in
/// one place.
pub fn load_config() -> anyhow::Result<(warden_domain::config::Config, String)> {
    let config_path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let mut config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        warden_domain::config::Config::default()
    };

    apply_env_overrides(&mut config);
    Ok((config, config_path))
}

/// Environment variable overrides for the settings an operator is most
/// likely to want to flip without editing `config.toml`: storage
/// locations and the main loop's tuning knobs.
fn apply_env_overrides(config: &mut warden_domain::config::Config) {
    if let Ok(v) = std::env::var("WARDEN_WORKSPACE_PATH") {
        config.workspace.path = v.into();
    }
    if let Ok(v) = std::env::var("WARDEN_STORE_PATH") {
        config.store.path = v.into();
    }
    if let Ok(v) = std::env::var("WARDEN_SKILLS_PATH") {
        config.skills.path = v.into();
    }
    if let Ok(v) = std::env::var("WARDEN_MAX_STEPS").and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
    {
        config.job.max_steps = v;
    }
    if let Ok(v) = std::env::var("WARDEN_MAX_JOB_RUNTIME_SECS")
        .and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
    {
        config.job.max_job_runtime_secs = v;
    }
    if let Ok(v) = std::env::var("WARDEN_REFLECTION_INTERVAL")
        .and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
    {
        config.job.reflection_interval = v;
    }
    if let Ok(v) = std::env::var("WARDEN_CONTEXT_COMPRESS_THRESHOLD_PERCENT")
        .and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
    {
        config.context.compress_threshold_percent = v;
    }
    if let Ok(v) = std::env::var("WARDEN_DEFAULT_TIMEZONE") {
        config.scheduler.default_timezone = v;
    }
}
