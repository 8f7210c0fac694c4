//! Error types for tiercache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache
///
/// A cache miss is never an error; lookups return `None`.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Disk Tier Errors
    // =========================================================================
    /// I/O failure reading or writing the disk tier or its version stamp
    #[error("Storage error during {operation}: {reason}")]
    Storage {
        operation: &'static str,
        reason: String,
    },

    /// The disk tier failed safe during initialization and serves nothing
    #[error("Disk tier unavailable: {0}")]
    DiskUnavailable(String),

    // =========================================================================
    // Migration Errors
    // =========================================================================
    /// A migration hook reported failure or panicked
    #[error("Migration from disk version {from_version} failed: {reason}")]
    MigrationFailure {
        from_version: String,
        reason: String,
    },

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stamp (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O failure from the storage backend
    pub fn storage(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Error::Storage {
            operation,
            reason: err.to_string(),
        }
    }

    /// True for failures of the disk tier itself
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::DiskUnavailable(_))
    }
}
