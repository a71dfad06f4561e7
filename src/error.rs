//! Error types for rpm database reading

use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not an rpm database: {0}")]
    NotAnRpmDatabase(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported database feature: {0}")]
    Unsupported(String),

    #[error("page {page}: log sequence number {actual:#018x} does not match metadata page {expected:#018x}")]
    StaleLsn { page: u32, expected: u64, actual: u64 },

    #[error("blob checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("scan shared with a concurrent caller failed: {0}")]
    Shared(Arc<Error>),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether iteration may continue past this error.
    ///
    /// Per-entry corruption (a malformed header, a bad blob checksum, an
    /// entry variant this reader does not decode) only invalidates the
    /// current record. Everything else invalidates the backend.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedHeader(_) | Error::ChecksumMismatch { .. } | Error::Unsupported(_)
        )
    }
}
