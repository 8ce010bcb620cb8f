//! Error types for coursepipe.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration loading or validation error. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport failure talking to the source API. Retryable.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// The source API asked us to slow down. Retryable.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The resource was deleted or permission was revoked since listing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The source API cannot be used at all (bad token, unreachable course).
    /// Aborts the current stage.
    #[error("source error: {0}")]
    Source(String),

    /// A converter could not produce Markdown. Advances the fallback chain.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Persisted run state is unreadable or inconsistent.
    #[error("run state corrupt: {0}")]
    RunStateCorrupt(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Payload or response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The run was cancelled between units of work.
    #[error("run cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a unit that failed with this error may be attempted again
    /// within the same retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::RateLimited { .. })
    }

    /// Short machine-readable tag, used in error logs and the manifest.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Fetch(_) => "fetch",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Source(_) => "source",
            Self::Conversion(_) => "conversion",
            Self::RunStateCorrupt(_) => "run_state_corrupt",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Parse { .. } => "parse",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PipelineError::config("overlap_tokens must be smaller than max_chunk_tokens");
        assert_eq!(
            err.to_string(),
            "config error: overlap_tokens must be smaller than max_chunk_tokens"
        );

        let err = PipelineError::NotFound("page-42".into());
        assert!(err.to_string().contains("page-42"));
    }

    #[test]
    fn retryable_classification() {
        assert!(PipelineError::Fetch("connection reset".into()).is_retryable());
        assert!(PipelineError::RateLimited { retry_after: None }.is_retryable());
        assert!(!PipelineError::NotFound("x".into()).is_retryable());
        assert!(!PipelineError::Source("401".into()).is_retryable());
        assert!(!PipelineError::Conversion("blank".into()).is_retryable());
    }
}
