//! Error types shared across ComplyFlow crates.

use serde::{Deserialize, Serialize};

/// Result alias used by every ComplyFlow library crate.
pub type Result<T> = std::result::Result<T, ComplyError>;

/// Coarse error classification that drives retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed input or state. Never retried.
    Validation,
    /// I/O timeouts, checkpoint conflicts, integration hiccups. Retried with backoff.
    Transient,
    /// Retry budget exhausted or unrecoverable rejection.
    Terminal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Terminal => write!(f, "terminal"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComplyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Terminal error: {0}")]
    Terminal(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Version conflict for case '{case_id}': expected v{expected}, found v{actual}")]
    Conflict {
        case_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComplyError {
    /// Map this error onto the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ComplyError::Validation(_) | ComplyError::Config(_) | ComplyError::Json(_) => {
                ErrorClass::Validation
            }
            ComplyError::Transient(_)
            | ComplyError::Timeout(_)
            | ComplyError::Conflict { .. }
            | ComplyError::Store(_)
            | ComplyError::Io(_) => ErrorClass::Transient,
            ComplyError::Terminal(_)
            | ComplyError::Graph(_)
            | ComplyError::NotFound(_)
            | ComplyError::Cancelled(_) => ErrorClass::Terminal,
        }
    }

    /// Whether the retry policy may try this operation again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ComplyError::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        ComplyError::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        ComplyError::Terminal(msg.into())
    }
}
