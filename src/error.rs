// src/error.rs

//! Unified error handling for the advisory engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Coarse error classification used by the retry manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient transport failure, retryable.
    Network,
    /// Source layout changed; waiting will not fix it.
    Parse,
    /// Parsed record failed schema checks; dropped.
    Validation,
    /// Call was delayed by the rate limiter. Never a failure.
    RateLimitDeferred,
    /// Source breaker is open; the job is deferred.
    CircuitOpen,
    /// Transient storage fault, retryable.
    Persistence,
    /// Engine shut down mid-run; neither a success nor a failure.
    Interrupted,
    /// Anything else (configuration, bad input, programming errors).
    Internal,
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Transport-level failure talking to a source
    #[error("Network error for {source_id}: {message}")]
    Network { source_id: String, message: String },

    /// Source content did not have the expected structure
    #[error("Parse error for {source_id}: {message}")]
    Parse {
        source_id: String,
        message: String,
        /// Short excerpt of the offending raw content
        excerpt: String,
    },

    /// Parsed record failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Call was delayed by the per-source rate limiter
    #[error("Rate limited for {source_id}, deferred {wait:?}")]
    RateLimitDeferred { source_id: String, wait: Duration },

    /// Circuit breaker rejected the call without contacting the source
    #[error("Circuit open for {source_id}, retry after {retry_after:?}")]
    CircuitOpen {
        source_id: String,
        retry_after: Duration,
    },

    /// Run abandoned because the engine is shutting down
    #[error("Interrupted by shutdown while working on {source_id}")]
    Interrupted { source_id: String },

    /// Storage backend failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Illegal job status change
    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Lookup of a job, source or entry failed
    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Create a network error for a source.
    pub fn network(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Network {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Create a parse error carrying an excerpt of the raw content.
    pub fn parse(
        source_id: impl Into<String>,
        message: impl fmt::Display,
        raw: &str,
    ) -> Self {
        Self::Parse {
            source_id: source_id.into(),
            message: message.to_string(),
            excerpt: crate::services::normalizer::excerpt(raw, EXCERPT_GRAPHEMES),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a persistence error.
    pub fn persistence(message: impl fmt::Display) -> Self {
        Self::Persistence(message.to_string())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a shutdown interruption.
    pub fn interrupted(source_id: impl Into<String>) -> Self {
        Self::Interrupted {
            source_id: source_id.into(),
        }
    }

    /// Map a reqwest failure onto the network taxonomy.
    pub fn from_http(source_id: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network(source_id, format!("request timed out: {err}"))
        } else {
            Self::network(source_id, err)
        }
    }

    /// Classify this error for retry handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Parse { .. } | Self::Selector { .. } => ErrorKind::Parse,
            Self::Validation(_) => ErrorKind::Validation,
            Self::RateLimitDeferred { .. } => ErrorKind::RateLimitDeferred,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Persistence(_) | Self::Io(_) => ErrorKind::Persistence,
            Self::Interrupted { .. } => ErrorKind::Interrupted,
            Self::Json(_)
            | Self::Toml(_)
            | Self::Url(_)
            | Self::Config(_)
            | Self::InvalidTransition { .. }
            | Self::NotFound(_) => ErrorKind::Internal,
        }
    }

    /// Whether waiting and trying again can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Persistence)
    }
}

/// Maximum graphemes of raw content kept on parse errors.
pub const EXCERPT_GRAPHEMES: usize = 200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(AppError::network("us_state_dept", "reset").is_retryable());
        assert!(AppError::persistence("disk full").is_retryable());
        assert!(AppError::Io(std::io::Error::other("boom")).is_retryable());
    }

    #[test]
    fn layout_errors_are_not_retryable() {
        let err = AppError::parse("uk_fcdo", "missing title", "<html></html>");
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(!err.is_retryable());
        assert!(!AppError::validation("empty title").is_retryable());
    }

    #[test]
    fn parse_error_keeps_short_excerpt() {
        let raw = "x".repeat(5_000);
        match AppError::parse("src", "bad", &raw) {
            AppError::Parse { excerpt, .. } => {
                assert!(excerpt.chars().count() <= EXCERPT_GRAPHEMES + 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn circuit_open_is_its_own_kind() {
        let err = AppError::CircuitOpen {
            source_id: "smartraveller".into(),
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(!err.is_retryable());
    }

    #[test]
    fn shutdown_interruption_is_not_retried() {
        let err = AppError::interrupted("uk_fcdo");
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert!(!err.is_retryable());
    }
}
