//! Error types for Wacast.

use thiserror::Error;

/// Result type alias used across all Wacast crates.
pub type Result<T> = std::result::Result<T, WacastError>;

/// Top-level error enum.
#[derive(Debug, Error)]
pub enum WacastError {
    /// Document lock contention or a compromised lock. Always retryable;
    /// the gateway surfaces this as 503, the worker waits for the next tick.
    #[error("store busy: {0}")]
    StoreBusy(String),

    /// Configuration loading/parsing errors.
    #[error("config error: {0}")]
    Config(String),

    /// Messaging channel (WhatsApp bridge) errors.
    #[error("channel error: {0}")]
    Channel(String),

    /// Malformed job input or stored job data.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// JSON (de)serialization errors.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Filesystem errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WacastError {
    /// Whether this error is lock contention (retryable without change).
    pub fn is_store_busy(&self) -> bool {
        matches!(self, WacastError::StoreBusy(_))
    }
}
