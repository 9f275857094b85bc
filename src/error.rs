//! Error types for YoctoClaw
//!
//! This module defines all error types used throughout the YoctoClaw agent
//! core. Uses `thiserror` for ergonomic error handling with automatic
//! `Display` and `Error` trait implementations.

use thiserror::Error;

/// The primary error type for YoctoClaw operations.
#[derive(Error, Debug)]
pub enum YoctoError {
    /// Configuration-related errors (missing API base/key, invalid config).
    /// Surfaced immediately, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider errors (API failures, rate limits, exhausted retries).
    #[error("Provider error: {0}")]
    Provider(String),

    /// Tool execution errors (invalid parameters, execution failures).
    #[error("Tool error: {0}")]
    Tool(String),

    /// Session management errors (invalid state, persistence failures).
    #[error("Session error: {0}")]
    Session(String),

    /// Channel errors (message routing issues, full buffers).
    #[error("Channel error: {0}")]
    Channel(String),

    /// Message bus closed.
    #[error("Bus error: channel closed")]
    BusClosed,

    /// The request context was cancelled. Never retried; the payload names
    /// the phase in which cancellation was observed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Subagent task id does not exist.
    #[error("Subagent task not found: {0}")]
    TaskNotFound(String),

    /// Subagent task exists but is not in a cancellable state.
    #[error("Subagent task not running: {0}")]
    TaskNotRunning(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A specialized `Result` type for YoctoClaw operations.
pub type Result<T> = std::result::Result<T, YoctoError>;

impl YoctoError {
    /// Returns `true` if this error was caused by context cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, YoctoError::Cancelled(_))
    }
}
