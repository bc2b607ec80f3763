//! Error types for kickoff-core

use thiserror::Error;

/// Result type alias using kickoff-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kickoff-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local storage failure that cleanup could not recover from
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local storage budget exhausted
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// Remote tier unreachable or transport failure
    #[error("Network error: {message}")]
    Network {
        /// Human-readable cause
        message: String,
        /// True when the device is known to be offline
        offline: bool,
    },

    /// The remote store refused a request; repeating it will not help
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),

    /// A concurrent writer advanced the entity past the expected version
    #[error(
        "Optimistic lock failed for {entity_id}: expected version {expected_version}, found {actual_version}"
    )]
    OptimisticLock {
        /// Entity whose version moved
        entity_id: String,
        /// Version the writer based its change on
        expected_version: i64,
        /// Version currently stored
        actual_version: i64,
    },

    /// Operation cancelled by a timeout
    #[error("Operation aborted: {0}")]
    Aborted(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lock could not be acquired
    #[error("Lock error: {0}")]
    Lock(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for the offline network error
    pub fn offline() -> Self {
        Self::Network {
            message: "device is offline".to_string(),
            offline: true,
        }
    }

    /// Returns true when the error is caused by missing connectivity
    pub const fn is_offline(&self) -> bool {
        matches!(self, Self::Network { offline: true, .. })
    }

    /// Network and timeout failures degrade to the local tier instead of failing
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Aborted(_))
    }

    /// Cancellations are expected and never reported as failures
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Whether a failed remote send may succeed if repeated later
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Aborted(_) | Self::LibSql(_) | Self::Io(_) | Self::Lock(_)
        )
    }

    pub const fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }
}
