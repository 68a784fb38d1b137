//! Error types for the drift monitor.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by an analysis backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Non-success HTTP status from a hosted API.
    #[error("{backend} API error ({status}): {message}")]
    Http {
        backend: String,
        status: u16,
        message: String,
    },

    /// Connection-level failure (DNS, TLS, reset).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The call did not finish within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The CLI bridge process failed to start or exited non-zero.
    #[error("bridge process error: {0}")]
    Process(String),

    /// The backend answered but produced no usable text.
    #[error("no text in response from {0}")]
    EmptyResponse(String),
}

impl BackendError {
    /// Rate-limit and unavailable responses are the only retryable failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Http { status, .. } => matches!(status, 429 | 503 | 529),
            _ => false,
        }
    }
}

/// Crate-level error taxonomy.
#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("calibration failed: {0}")]
    Calibration(String),

    /// Every scoring chunk failed, so the cycle was skipped.
    #[error("scoring failed: {0}")]
    Scoring(String),

    #[error("no calibrated dimensions for {0}")]
    NotCalibrated(String),

    #[error("no character profile available")]
    NoProfile,

    /// The chat switched while an async step was in flight.
    #[error("chat {0} is no longer active")]
    StaleChat(String),

    #[error("message {0} is not a scorable assistant turn")]
    NotScorable(usize),
}

pub type Result<T> = std::result::Result<T, AnchorError>;
