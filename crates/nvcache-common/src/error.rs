//! Error types for NVCache
//!
//! This module defines the common error type shared by the engine, the
//! persistent log and the command line tooling.

use crate::types::Fd;
use thiserror::Error;

/// Common result type for NVCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for NVCache
#[derive(Debug, Error)]
pub enum Error {
    // Backing store errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("short read on {path}: page at offset {offset} could not be loaded")]
    PageLoad { path: String, offset: u64 },

    // Persistent log errors
    #[error("log exhausted: all {capacity} entries are pending and no flush thread is running")]
    LogExhausted { capacity: u64 },

    #[error("persistent region is corrupt: {0}")]
    RegionCorrupt(String),

    #[error(
        "persistent region geometry mismatch: region holds {found} entries, configuration asks for {expected}"
    )]
    RegionMismatch { expected: u64, found: u64 },

    // Descriptor errors
    #[error("bad file descriptor: {0}")]
    BadDescriptor(Fd),

    #[error("too many open files: all {max} descriptor slots are in use")]
    TooManyFiles { max: usize },

    #[error("path too long ({len} bytes, max {max}): {path}")]
    PathTooLong { path: String, len: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if a higher layer may reasonably retry the failed call
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DiskIo(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            Self::PageLoad { .. } => true,
            _ => false,
        }
    }

    /// Check if the engine can no longer make progress after this error
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LogExhausted { .. } | Self::RegionCorrupt(_) | Self::Internal(_)
        )
    }

    /// Map the error onto the closest `errno` value, for callers that sit
    /// behind a C file API.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::DiskIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::BadDescriptor(_) => libc::EBADF,
            Self::TooManyFiles { .. } => libc::EMFILE,
            Self::PathTooLong { .. } => libc::ENAMETOOLONG,
            Self::InvalidArgument(_) | Self::Configuration(_) => libc::EINVAL,
            Self::LogExhausted { .. } => libc::ENOSPC,
            Self::Storage(_)
            | Self::PageLoad { .. }
            | Self::RegionCorrupt(_)
            | Self::RegionMismatch { .. }
            | Self::Internal(_) => libc::EIO,
        }
    }
}
