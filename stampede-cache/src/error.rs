//! Error types for the cache data layer

use thiserror::Error;

/// Result type alias for cache data layer operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Result type alias for raw store round-trips
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure reported by the underlying store connection
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport or protocol error from the Redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Script runtime failure (including NOSCRIPT)
    #[error("Script error: {0}")]
    Script(String),

    /// Reply did not have the expected shape
    #[error("Unexpected reply: {0}")]
    Protocol(String),

    /// Store refused or could not serve the command
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Why an operation was abandoned before the store answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired
    Token,
    /// The caller's deadline elapsed
    Deadline,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token => f.write_str("cancelled by caller"),
            Self::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

/// Cache data layer error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// Store round-trip failed
    #[error("{operation}: store error: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// Loading one of the fixed scripts failed at startup
    #[error("failed to register {script} script: {source}")]
    ScriptRegistration {
        script: &'static str,
        #[source]
        source: StoreError,
    },

    /// Key not found (single-key read path only)
    #[error("Key not found: {0}")]
    NotFound(String),

    /// One element of a batch call failed; the whole batch is rejected
    #[error("{operation}: batch element {key} failed: {reason}")]
    BatchPartialFailure {
        operation: &'static str,
        key: String,
        reason: String,
    },

    /// Bulk delete stopped after some chunks were already applied
    #[error("bulk delete of {pattern} stopped after {deleted}/{matched} keys: {reason}")]
    PartialInvalidation {
        pattern: String,
        matched: u64,
        deleted: u64,
        reason: String,
    },

    /// Caller deadline or cancellation
    #[error("{operation}: {reason}")]
    Cancelled {
        operation: &'static str,
        reason: CancelReason,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    pub(crate) fn store(operation: &'static str, source: StoreError) -> Self {
        Self::Store { operation, source }
    }

    /// True for errors where some, but not all, of the requested work was applied.
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            Self::BatchPartialFailure { .. } | Self::PartialInvalidation { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
