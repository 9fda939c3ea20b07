//! Error types for txnrep
//!
//! This module defines the common error types used by the state manager,
//! its state providers and the logging replicator seams.

use thiserror::Error;

/// Common result type for txnrep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for txnrep
#[derive(Debug, Error)]
pub enum Error {
    // Naming errors
    #[error("state provider name already exists: {0}")]
    NameAlreadyExists(String),

    #[error("state provider name does not exist: {0}")]
    NameDoesNotExist(String),

    #[error("invalid state provider name: {0}")]
    InvalidName(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // Access errors
    #[error("replica is not primary")]
    NotPrimary,

    #[error("replica is not readable")]
    NotReadable,

    // Replication errors
    #[error("replication queue is full")]
    ReplicationQueueFull,

    #[error("service is too busy")]
    ServiceTooBusy,

    #[error("no write quorum")]
    NoWriteQuorum,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    // Lifecycle errors
    #[error("object closed")]
    ObjectClosed,

    #[error("object disposed")]
    ObjectDisposed,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Persistence errors
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // State provider errors
    #[error("state provider error: {0}")]
    Provider(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a state provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a checkpoint corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CheckpointCorrupt(msg.into())
    }

    /// Check if the replicator reported transient contention that should be retried
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReplicationQueueFull | Self::ServiceTooBusy | Self::NoWriteQuorum
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NameDoesNotExist(_) | Self::NotFound(_))
    }

    /// Check if this is a name collision
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::NameAlreadyExists(_))
    }

    /// Check if the error was caused by the caller rather than the replica
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidName(_) | Self::InvalidParameter(_))
    }
}
