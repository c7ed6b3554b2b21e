//! Crash recovery
//!
//! After an unclean shutdown the region still holds every entry that was
//! not yet freed, starting at the persisted tail. Recovery reopens the files
//! recorded in the persistent file table and writes back, oldest first,
//! every entry whose logical write was fully committed and that had not
//! already reached its file. Partially committed writes are discarded as a
//! whole.

use crate::region::{FileRecord, NO_FD, PersistentRegion};
use nvcache_common::{Fd, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Flags that must not be reapplied when a file is reopened
pub const REOPEN_STRIPPED_FLAGS: i32 = libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL | libc::O_APPEND;

/// Outcome of a recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Files from the persistent file table that could be reopened
    pub files_reopened: usize,
    /// Files from the persistent file table that could not be reopened
    pub files_missing: usize,
    /// Entries written back to their files
    pub replayed: usize,
    /// Entries belonging to writes that never committed
    pub discarded: usize,
    /// Committed entries whose file could not be reopened
    pub orphaned: usize,
}

/// Pending entry found in a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub index: u64,
    pub fd: u32,
    pub offset: u64,
    pub size: u32,
    /// Already written to its file before the crash
    pub written: bool,
    /// The whole logical write was committed
    pub settled: bool,
}

/// List every occupied entry, oldest first, starting at `tail`
#[must_use]
pub fn scan(region: &PersistentRegion, tail: u64) -> Vec<PendingEntry> {
    let capacity = region.capacity();
    let start = tail % capacity;
    (0..capacity)
        .map(|n| (start + n) % capacity)
        .filter_map(|index| {
            let meta = region.entry(index);
            let fd = meta.fd.load(Ordering::Acquire);
            if fd == NO_FD {
                return None;
            }
            let committed = meta.committed.load(Ordering::Acquire) == 1;
            let first = meta.waiting.load(Ordering::Acquire);
            let settled = committed
                && first < capacity
                && region.entry(first).committed.load(Ordering::Acquire) == 1;
            Some(PendingEntry {
                index,
                fd,
                offset: meta.offset.load(Ordering::Relaxed),
                size: meta.size.load(Ordering::Relaxed),
                written: meta.written.load(Ordering::Acquire) == 1,
                settled,
            })
        })
        .collect()
}

fn reopen(record: &FileRecord) -> std::io::Result<File> {
    let flags = record.flags & !REOPEN_STRIPPED_FLAGS;
    let mut options = OpenOptions::new();
    // Replay needs write access whatever the descriptor was opened with.
    options.read(true).write(true).custom_flags(flags & !libc::O_ACCMODE);
    options.open(&record.path)
}

/// Replay the committed, unwritten entries of an unclean region, then
/// durably mark the region clean.
///
/// Entries are left in place for the caller to reset. The region is clean
/// before that reset starts, so a crash halfway through it cannot replay the
/// surviving older entries over newer data on the next start.
pub fn recover(region: &PersistentRegion, tail: u64) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    info!(
        "Recovering persistent log {:?} from tail {}",
        region.path(),
        tail
    );

    let mut files: HashMap<Fd, File> = HashMap::new();
    for (fd, record) in region.opened_files() {
        match reopen(&record) {
            Ok(file) => {
                debug!("Reopened {:?} as fd {} for recovery", record.path, fd);
                files.insert(fd, file);
                report.files_reopened += 1;
            }
            Err(e) => {
                warn!(
                    "Cannot reopen {:?} (fd {}) for recovery: {}",
                    record.path, fd, e
                );
                report.files_missing += 1;
            }
        }
    }

    let mut touched = HashSet::new();
    for entry in scan(region, tail) {
        if entry.written {
            continue;
        }
        if !entry.settled {
            report.discarded += 1;
            continue;
        }
        let fd = Fd::new(entry.fd);
        let Some(file) = files.get(&fd) else {
            report.orphaned += 1;
            continue;
        };
        // SAFETY: nothing else uses the region while it is being recovered.
        #[allow(unsafe_code)]
        let payload = unsafe { region.payload(entry.index, entry.size as usize) };
        file.write_all_at(payload, entry.offset)?;
        touched.insert(fd);
        report.replayed += 1;
    }

    for fd in &touched {
        if let Some(file) = files.get(fd) {
            file.sync_all()?;
        }
    }
    region.set_tail(region.clean_marker());
    region.sync()?;

    if report.orphaned > 0 {
        warn!(
            "{} committed log entries belong to files that could not be reopened",
            report.orphaned
        );
    }
    info!(
        "Recovery complete: {} entries replayed, {} discarded, {} files reopened",
        report.replayed, report.discarded, report.files_reopened
    );
    Ok(report)
}
