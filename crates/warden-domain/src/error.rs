/// Shared error type used across all warden crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("rate limited by {provider} after {attempts} attempts")]
    RateLimited { provider: String, attempts: u32 },

    /// Distinguished cancellation result. Call sites that can observe it
    /// should match on it explicitly rather than let it bubble as a
    /// generic failure (spec §9 design note).
    #[error("job cancelled")]
    Cancelled,

    #[error("store: {0}")]
    Store(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
