//! Build engine error taxonomy.
//!
//! Every component returns [`BuildError`]; the scheduler's job handler decides
//! from [`BuildError::is_retryable`] whether an attempt is retried.

use std::time::Duration;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Unsupported project type or a missing required command.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Repository unreachable, branch or commit not found.
    #[error("clone failed: {0}")]
    Clone(String),

    /// The build script exited non-zero.
    #[error("build exited with code {exit_code}: {message}")]
    Execution { exit_code: i64, message: String },

    /// A bounded stage ran past its limit.
    #[error("{stage} timed out after {}s", limit.as_secs())]
    Timeout { stage: String, limit: Duration },

    #[error("packaging failed: {0}")]
    Packaging(String),

    /// Dependency cache failures. Never fails a build.
    #[error("cache error: {0}")]
    Cache(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("build not found: {0}")]
    NotFound(String),

    #[error("build {0} is already terminal")]
    AlreadyTerminal(String),

    /// The attempt was already started (or overtaken) elsewhere.
    #[error("attempt {attempt} of build {build_id} is stale")]
    StaleAttempt { build_id: String, attempt: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl BuildError {
    /// Whether the scheduler should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Clone(_)
            | Self::Execution { .. }
            | Self::Timeout { .. }
            | Self::Packaging(_)
            | Self::Runtime(_)
            | Self::Io(_) => true,
            Self::Configuration(_)
            | Self::Cache(_)
            | Self::Cancelled
            | Self::Store(_)
            | Self::NotFound(_)
            | Self::AlreadyTerminal(_)
            | Self::StaleAttempt { .. }
            | Self::Serialization(_) => false,
        }
    }

    /// Stable reason string recorded on the build and used as a metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Clone(_) => "clone",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Packaging(_) => "packaging",
            Self::Cache(_) => "cache",
            Self::Cancelled => "cancelled",
            Self::Runtime(_) => "runtime",
            Self::Store(_) => "store",
            Self::NotFound(_) => "not_found",
            Self::AlreadyTerminal(_) => "already_terminal",
            Self::StaleAttempt { .. } => "stale_attempt",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Exit code of the build script, when the failure came from one.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            Self::Execution { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }
}
