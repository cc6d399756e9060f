//! Storage backend errors
//!
//! Typed errors produced by storage areas. The adapter never hands these to
//! the engine; it turns them into error-listener events.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a storage area
#[derive(Error, Debug)]
pub enum BackendError {
    /// A single item is larger than the per-item quota
    #[error("QUOTA_BYTES_PER_ITEM quota exceeded: item '{key}' is {size} bytes, limit is {limit}")]
    QuotaBytesPerItem { key: String, size: u64, limit: u64 },

    /// The area's total usage would exceed its quota
    #[error("QUOTA_BYTES quota exceeded: {needed} bytes needed, limit is {limit}")]
    QuotaBytes { needed: u64, limit: u64 },

    /// Disk is full or quota exceeded at the filesystem level
    #[error("Disk full or quota exceeded while writing to '{path}'")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read or write a backing file
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stored data could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other failure reported by the backend
    #[error("{0}")]
    Backend(String),
}

impl BackendError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies disk-full conditions separately from other failures.
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        if is_disk_full_error(&error) {
            BackendError::DiskFull {
                path,
                source: error,
            }
        } else {
            BackendError::Io {
                path,
                source: error,
            }
        }
    }

    /// Check if this error was caused by a storage limit
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            BackendError::QuotaBytesPerItem { .. }
                | BackendError::QuotaBytes { .. }
                | BackendError::DiskFull { .. }
        )
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type BackendResult<T> = Result<T, BackendError>;
