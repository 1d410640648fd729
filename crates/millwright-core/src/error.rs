//! Error taxonomy shared by every Millwright component.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MillwrightError {
    /// Durable storage failed; the operation was aborted.
    #[error("Store error: {0}")]
    Store(String),

    /// Malformed schedule or task fields, rejected before persistence.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    /// Network or broker-side failure while sending or syncing.
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The scheduler loop is no longer accepting commands.
    #[error("Scheduler stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MillwrightError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Whether the error is a caller mistake rather than an infrastructure fault.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, MillwrightError>;
