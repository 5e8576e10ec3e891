//! Error types for OrdStore operations
//!
//! Every fallible engine call returns `StoreError`. Variants carry enough
//! context (file path, byte offset, checksums) to diagnose a failed open or
//! write without re-running it.
//!
//! Missing keys are not errors, and neither is iterator exhaustion. Use of a
//! closed engine is a programming fault and panics instead of producing a
//! variant here.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// OrdStore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", in_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Log or checkpoint content is structurally invalid
    #[error("Corruption in {} at offset {offset}: {reason}", .path.display())]
    Corruption {
        /// File containing the bad bytes
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error(
        "Checksum mismatch in {} at offset {offset}: expected {expected:#010x}, got {actual:#010x}",
        .path.display()
    )]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Checksum stored on disk
        expected: u32,
        /// Checksum computed over the bytes read
        actual: u32,
        /// Byte offset of the corrupted record
        offset: u64,
    },

    /// The store was created with a different comparator
    #[error("Comparator mismatch: store was created with '{stored}', opened with '{supplied}'")]
    ComparatorMismatch {
        /// Comparator name recorded in the store identity file
        stored: String,
        /// Comparator name supplied to open
        supplied: String,
    },

    /// Comparator name is empty, non-ASCII or too long
    #[error("Invalid comparator name {0:?}")]
    InvalidComparatorName(String),

    /// `error_if_exists` was set and a store is already present
    #[error("Store already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Another handle holds the store lock
    #[error("Store at {} is locked by another handle", .0.display())]
    Locked(PathBuf),

    /// Too many read views are open at once
    #[error("Snapshot limit exceeded: {open} views open, limit {limit}")]
    SnapshotLimitExceeded {
        /// Views open at the time of the request
        open: usize,
        /// Configured limit
        limit: usize,
    },

    /// Key or value does not fit the on-disk length field
    #[error("Entry {component} too large: {size} bytes exceeds limit of {max} bytes")]
    EntryTooLarge {
        /// `"key"` or `"value"`
        component: &'static str,
        /// Size of the oversized component
        size: u64,
        /// Largest size the log format can frame
        max: u64,
    },

    /// An earlier write failed and the partial record could not be removed
    #[error("Write-ahead log is unusable after an earlier failure: {0}")]
    LogPoisoned(String),

    /// Options failed validation
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

fn in_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl StoreError {
    /// Build an `Io` variant tagged with the file it concerns.
    pub(crate) fn io_at(path: &Path, err: &std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for failures caused by on-disk content rather than the OS.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corruption { .. } | StoreError::ChecksumMismatch { .. }
        )
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for OrdStore operations
pub type StoreResult<T> = Result<T, StoreError>;
