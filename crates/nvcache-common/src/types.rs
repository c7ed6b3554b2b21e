//! Core type definitions for NVCache
//!
//! Descriptor handles, access modes and the page arithmetic shared by the
//! RAM cache, the radix index and the persistent log.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Size of a RAM cache page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Maximum payload carried by a single log entry
pub const LOG_ENTRY_SIZE: usize = 4096;

/// Number of descriptor slots in the persistent file table
pub const MAX_FILES: usize = 1024;

/// Maximum length of a path stored in the persistent file table
pub const MAX_PATH_LEN: usize = 256;

/// Cache line granularity used for persistence flushes
pub const CACHE_LINE: usize = 64;

/// Descriptor handed out by the engine.
///
/// Descriptors index the persistent file table, so they are always smaller
/// than [`MAX_FILES`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct Fd(u32);

impl Fd {
    /// Wrap a raw descriptor number
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw descriptor number
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Slot index in descriptor-indexed tables
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a file was opened, derived from its `O_ACCMODE` bits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    /// Classify open flags
    #[must_use]
    pub const fn from_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => Self::WriteOnly,
            libc::O_RDWR => Self::ReadWrite,
            _ => Self::ReadOnly,
        }
    }

    /// Writes to the file go through the persistent log
    #[must_use]
    pub const fn is_managed(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }

    /// Pages of the file live in the RAM cache
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Self::ReadWrite)
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(self, Self::WriteOnly)
    }
}

/// Start of the page containing `offset`
#[must_use]
pub const fn page_base(offset: u64) -> u64 {
    offset - offset % PAGE_SIZE as u64
}

/// Bytes between the start of the page and `offset`
#[must_use]
pub const fn page_busy(offset: u64) -> usize {
    (offset % PAGE_SIZE as u64) as usize
}

/// Bytes between `offset` and the end of its page
#[must_use]
pub const fn page_free(offset: u64) -> usize {
    PAGE_SIZE - page_busy(offset)
}

/// One page-sized piece of a byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSpan {
    /// Page-aligned offset of the page
    pub base: u64,
    /// Offset of the piece inside the page
    pub in_page: usize,
    /// Offset of the piece inside the caller's buffer
    pub buf_offset: usize,
    /// Length of the piece
    pub len: usize,
}

/// Iterator splitting `[offset, offset + len)` into per-page pieces
#[derive(Clone, Debug)]
pub struct PageSpans {
    offset: u64,
    done: usize,
    len: usize,
}

impl Iterator for PageSpans {
    type Item = PageSpan;

    fn next(&mut self) -> Option<PageSpan> {
        if self.done >= self.len {
            return None;
        }
        let at = self.offset + self.done as u64;
        let piece = page_free(at).min(self.len - self.done);
        let span = PageSpan {
            base: page_base(at),
            in_page: page_busy(at),
            buf_offset: self.done,
            len: piece,
        };
        self.done += piece;
        Some(span)
    }
}

/// Split a byte range into the pages it covers
#[must_use]
pub const fn page_spans(offset: u64, len: usize) -> PageSpans {
    PageSpans {
        offset,
        done: 0,
        len,
    }
}
