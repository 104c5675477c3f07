//! Domain-specific error types for the stamping pipeline.
//!
//! Fallible setup and I/O operations return `Result<T, StampError>`.
//! Decoding a strip never errors: it yields `None` and the caller
//! tries again on the next frame.

use thiserror::Error;

/// The canonical error type for stamp-core.
#[derive(Debug, Error)]
pub enum StampError {
    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration struct failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O Errors ───────────────────────────────────────────────
    /// The filesystem layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding an image failed.
    #[error("image error: {0}")]
    Image(String),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// No Tokio runtime was available to host background work.
    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    // ── Session Errors ───────────────────────────────────────────
    /// A connect or close attempt failed. Transient: the supervisor
    /// schedules another attempt.
    #[error("session error: {0}")]
    Session(String),

    /// Reconnection gave up after exhausting its retry budget.
    ///
    /// This is the only terminal variant; see [`StampError::is_terminal`].
    #[error("failed starting session after {attempts} attempts: {reason}")]
    FailedStartingSession { attempts: u32, reason: String },

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StampError {
    /// `true` for errors that end the publishing session and must be
    /// surfaced to the user instead of retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StampError::FailedStartingSession { .. })
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StampError {
    fn from(s: String) -> Self {
        StampError::Other(s)
    }
}

impl From<&str> for StampError {
    fn from(s: &str) -> Self {
        StampError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StampError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StampError::ChannelClosed
    }
}

impl From<image::ImageError> for StampError {
    fn from(e: image::ImageError) -> Self {
        StampError::Image(e.to_string())
    }
}
