//! SPDB error types
//!
//! Every fallible engine operation returns [`SpdbResult`]. Nothing panics
//! across the engine boundary.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the chunk database
#[derive(Error, Debug)]
pub enum SpdbError {
    /// I/O operation failed (open, read, write, fsync, rename)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Exclusive day-file lock could not be taken before the timeout
    #[error("Timed out after {waited:?} waiting for lock on {path:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Index file has bad magic, bad size or an unsupported revision
    #[error("Corrupt or unsupported header in {path:?}: {reason}")]
    CorruptOrUnsupportedHeader { path: PathBuf, reason: String },

    /// A `Once` put found a chunk already stored at this time and type
    #[error("Chunk already stored at valid_time={valid_time} (data_type={data_type}, data_type2={data_type2})")]
    DuplicatePut {
        valid_time: i64,
        data_type: i32,
        data_type2: i32,
    },

    /// Database was created for a different product
    #[error("Product mismatch in {path:?}: stored {stored_id} '{stored_label}', requested {requested_id} '{requested_label}'")]
    ProductIdMismatch {
        path: PathBuf,
        stored_id: i32,
        stored_label: String,
        requested_id: i32,
        requested_label: String,
    },

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Caller passed an argument the engine cannot act on
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SpdbError {
    /// Whether the caller may reasonably retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpdbError::LockTimeout { .. })
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SpdbError::CorruptOrUnsupportedHeader {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for SPDB operations
pub type SpdbResult<T> = Result<T, SpdbError>;
