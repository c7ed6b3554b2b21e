//! Persistent write log
//!
//! A fixed-capacity ring of entries in the persistent region. Writers
//! reserve slots with two atomics (available blocks, head) and never take a
//! lock; the flush side walks the ring from the persisted tail under one
//! global flush mutex and only ever frees entries in reservation order.
//!
//! A logical write larger than [`LOG_ENTRY_SIZE`] becomes a group of
//! consecutive fragments. Every fragment records the slot of the first
//! fragment in `waiting`. Later fragments are committed as soon as they are
//! persisted, the first one last, so a group is visible to the flush side
//! only when every fragment is durable.

#![allow(unsafe_code)]

use crate::files::{BackingFile, FileTable};
use crate::persist::persist_fence;
use crate::radix::RangeLock;
use crate::recovery::{self, RecoveryReport};
use crate::region::{NO_FD, PersistentRegion, RegionState};
use nvcache_common::{Error, Fd, LOG_ENTRY_SIZE, PAGE_SIZE, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::Thread;
use tracing::{debug, error, info, warn};

/// Consecutive unproductive flush attempts between two stall warnings
const STALL_WARN_EVERY: u64 = 10_000_000;

/// Unproductive drain rounds tolerated by [`NvLog::final_flush`]
const FINAL_FLUSH_PATIENCE: u64 = 1_000_000;

/// Page-level bookkeeping the log drives while entries come and go.
///
/// Implemented by the RAM cache; [`Untracked`] is used when no cache is
/// attached.
pub trait PageTracker: Send + Sync {
    /// A fragment covering `[offset, offset + len)` entered the log
    fn mark_dirty(&self, fd: Fd, generation: u32, offset: u64, len: usize);

    /// A fragment covering `[offset, offset + len)` reached the backing file
    fn mark_clean(&self, fd: Fd, generation: u32, offset: u64, len: usize);

    /// Take every page lock of the range or none of them
    fn try_lock_range(&self, fd: Fd, generation: u32, offset: u64, len: usize) -> Option<RangeLock>;
}

/// Tracker for logs with no page cache in front of them
#[derive(Debug, Default, Clone, Copy)]
pub struct Untracked;

impl PageTracker for Untracked {
    fn mark_dirty(&self, _: Fd, _: u32, _: u64, _: usize) {}

    fn mark_clean(&self, _: Fd, _: u32, _: u64, _: usize) {}

    fn try_lock_range(&self, _: Fd, _: u32, _: u64, _: usize) -> Option<RangeLock> {
        Some(RangeLock::default())
    }
}

/// State owned by whoever holds the flush mutex
#[derive(Debug, Default)]
pub struct FlushState {
    unproductive: u64,
}

/// Proof that the flush mutex is held
pub type FlushGuard<'a> = MutexGuard<'a, FlushState>;

/// Log statistics for monitoring
#[derive(Debug, Default)]
pub struct LogStats {
    /// Fragments appended
    pub added: AtomicU64,
    /// Entries freed after reaching their backing file
    pub flushed: AtomicU64,
    /// Productive batches
    pub batches: AtomicU64,
    /// fsync calls issued by the flush paths
    pub fsyncs: AtomicU64,
    /// Times a writer found the log full
    pub full_waits: AtomicU64,
}

/// Point-in-time copy of [`LogStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStatsSnapshot {
    pub capacity: u64,
    pub pending: u64,
    pub added: u64,
    pub flushed: u64,
    pub batches: u64,
    pub fsyncs: u64,
    pub full_waits: u64,
}

/// A logical write whose fragments are persisted but not yet committed
#[derive(Debug)]
#[must_use = "a staged write is invisible until committed"]
pub(crate) struct StagedWrite {
    first: u64,
    fragments: u64,
}

/// One entry taken by a flush batch
struct BatchItem {
    index: u64,
    fd: Fd,
    generation: u32,
    offset: u64,
    size: usize,
}

/// The persistent log
pub struct NvLog {
    region: PersistentRegion,
    capacity: u64,
    /// Reservation counter; the next slot is `head % capacity`
    head: AtomicU64,
    available: AtomicU64,
    flush: Mutex<FlushState>,
    files: Arc<FileTable>,
    /// Thread that frees space, woken by writers facing a full log
    drainer: Mutex<Option<Thread>>,
    starved: AtomicBool,
    stats: LogStats,
}

impl NvLog {
    /// Map the region at `path` (anonymous memory when `None`), replay it if
    /// the previous user died and `recover` is set, then start from an empty
    /// log.
    pub fn open(
        path: Option<&Path>,
        capacity: u64,
        recover: bool,
        files: Arc<FileTable>,
    ) -> Result<(Self, Option<RecoveryReport>)> {
        let (region, state) = PersistentRegion::open(path, capacity)?;

        let report = match state {
            RegionState::Unclean { tail } if recover => {
                Some(recovery::recover(&region, tail)?)
            }
            RegionState::Unclean { tail } => {
                warn!(
                    "Persistent log was not shut down cleanly (tail={}) and recovery is disabled: pending entries are dropped",
                    tail
                );
                region.set_tail(region.clean_marker());
                region.sync()?;
                None
            }
            RegionState::Fresh | RegionState::Clean => None,
        };

        region.reset_entries();
        region.clear_file_table();
        region.set_tail(0);

        info!("Persistent log ready: {} entries of {} bytes", capacity, LOG_ENTRY_SIZE);
        Ok((Self::from_region(region, files), report))
    }

    fn from_region(region: PersistentRegion, files: Arc<FileTable>) -> Self {
        let capacity = region.capacity();
        Self {
            region,
            capacity,
            head: AtomicU64::new(0),
            available: AtomicU64::new(capacity),
            flush: Mutex::new(FlushState::default()),
            files,
            drainer: Mutex::new(None),
            starved: AtomicBool::new(false),
            stats: LogStats::default(),
        }
    }

    #[must_use]
    pub const fn region(&self) -> &PersistentRegion {
        &self.region
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Entries reserved and not yet freed
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.capacity - self.available.load(Ordering::Acquire)
    }

    /// A writer is waiting for free slots
    #[must_use]
    pub fn is_starved(&self) -> bool {
        self.starved.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn stats(&self) -> &LogStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> LogStatsSnapshot {
        LogStatsSnapshot {
            capacity: self.capacity,
            pending: self.pending(),
            added: self.stats.added.load(Ordering::Relaxed),
            flushed: self.stats.flushed.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            fsyncs: self.stats.fsyncs.load(Ordering::Relaxed),
            full_waits: self.stats.full_waits.load(Ordering::Relaxed),
        }
    }

    /// Register the thread that drains the log. Without one, a full log is
    /// an error instead of a wait.
    pub fn attach_drainer(&self, thread: Option<Thread>) {
        *self.drainer.lock() = thread;
    }

    /// Take the flush mutex
    pub fn flush_lock(&self) -> FlushGuard<'_> {
        self.flush.lock()
    }

    const fn next(&self, index: u64) -> u64 {
        (index + 1) % self.capacity
    }

    fn tail_index(&self) -> u64 {
        self.region.tail().load(Ordering::Acquire) % self.capacity
    }

    fn head_index(&self) -> u64 {
        self.head.load(Ordering::Acquire) % self.capacity
    }

    /// Reserve one slot, keeping at least one block free
    pub fn reserve_block(&self) -> Option<u64> {
        self.reserve_blocks(1)
    }

    /// Reserve `count` consecutive slots, returning the first one
    fn reserve_blocks(&self, count: u64) -> Option<u64> {
        let mut available = self.available.load(Ordering::Acquire);
        loop {
            if available <= count {
                return None;
            }
            match self.available.compare_exchange_weak(
                available,
                available - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => available = current,
            }
        }
        Some(self.head.fetch_add(count, Ordering::AcqRel) % self.capacity)
    }

    fn reserve_or_wait(&self, count: u64) -> Result<u64> {
        if count >= self.capacity {
            return Err(Error::invalid_argument(format!(
                "write of {count} fragments cannot fit in a log of {} entries",
                self.capacity
            )));
        }
        let mut waited = false;
        loop {
            if let Some(first) = self.reserve_blocks(count) {
                if waited {
                    self.starved.store(false, Ordering::Release);
                }
                return Ok(first);
            }
            let drainer = self.drainer.lock().clone();
            let Some(drainer) = drainer else {
                error!(
                    "Persistent log is full ({} entries) and no flush thread is running",
                    self.capacity
                );
                return Err(Error::LogExhausted {
                    capacity: self.capacity,
                });
            };
            if !waited {
                waited = true;
                self.stats.full_waits.fetch_add(1, Ordering::Relaxed);
            }
            self.starved.store(true, Ordering::Release);
            drainer.unpark();
            std::thread::yield_now();
        }
    }

    /// Durably append a write of `data` at `offset` to `fd`.
    ///
    /// Once this returns, the write survives a crash and is visible to
    /// [`Self::play_log_on_page`].
    pub fn add_entry(
        &self,
        pages: &dyn PageTracker,
        fd: Fd,
        generation: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let staged = self.stage(pages, fd, generation, offset, data)?;
        self.commit(staged);
        Ok(())
    }

    /// Persist every fragment of a write and commit all but the first
    pub(crate) fn stage(
        &self,
        pages: &dyn PageTracker,
        fd: Fd,
        generation: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<StagedWrite> {
        if data.is_empty() {
            return Err(Error::invalid_argument("empty log entry"));
        }
        let fragments = data.len().div_ceil(LOG_ENTRY_SIZE) as u64;
        let first = self.reserve_or_wait(fragments)?;

        let mut index = first;
        for (n, chunk) in data.chunks(LOG_ENTRY_SIZE).enumerate() {
            let chunk_offset = offset + (n * LOG_ENTRY_SIZE) as u64;
            // SAFETY: the slot was reserved above and is not committed, so
            // this thread is its only user.
            unsafe { self.region.store_payload(index, chunk) };

            let meta = self.region.entry(index);
            meta.fd.store(fd.as_raw(), Ordering::Relaxed);
            meta.generation.store(generation, Ordering::Relaxed);
            meta.offset.store(chunk_offset, Ordering::Relaxed);
            meta.size.store(chunk.len() as u32, Ordering::Relaxed);
            meta.group_len.store(fragments as u32, Ordering::Relaxed);
            meta.written.store(0, Ordering::Relaxed);
            meta.waiting.store(first, Ordering::Relaxed);
            self.region.persist_entry_meta(index);
            persist_fence();

            if index != first {
                meta.committed.store(1, Ordering::Release);
                self.region.persist_entry_meta(index);
            }
            pages.mark_dirty(fd, generation, chunk_offset, chunk.len());
            index = self.next(index);
        }

        Ok(StagedWrite { first, fragments })
    }

    /// Commit the first fragment, publishing the whole write
    pub(crate) fn commit(&self, staged: StagedWrite) {
        persist_fence();
        self.region
            .entry(staged.first)
            .committed
            .store(1, Ordering::Release);
        self.region.persist_entry_meta(staged.first);
        persist_fence();
        self.stats.added.fetch_add(staged.fragments, Ordering::Relaxed);
    }

    /// Entry is committed and so is the first fragment of its write
    fn is_settled(&self, index: u64) -> bool {
        let meta = self.region.entry(index);
        if meta.committed.load(Ordering::Acquire) == 0 {
            return false;
        }
        let first = meta.waiting.load(Ordering::Relaxed);
        first < self.capacity && self.region.entry(first).committed.load(Ordering::Acquire) == 1
    }

    /// Copy every pending write for `fd` that touches the page at `base`
    /// into `page`, growing `valid` to cover what was copied. Entries are
    /// applied oldest first. Returns the number of entries applied.
    pub fn play_log_on_page(
        &self,
        _flush: &FlushGuard<'_>,
        fd: Fd,
        generation: u32,
        base: u64,
        page: &mut [u8],
        valid: &mut usize,
    ) -> usize {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let head = self.head_index();
        let mut index = self.tail_index();
        let mut played = 0;

        while index != head {
            let meta = self.region.entry(index);
            if self.is_settled(index)
                && meta.written.load(Ordering::Acquire) == 0
                && meta.fd.load(Ordering::Relaxed) == fd.as_raw()
                && meta.generation.load(Ordering::Relaxed) == generation
            {
                let offset = meta.offset.load(Ordering::Relaxed);
                let size = meta.size.load(Ordering::Relaxed) as usize;
                if let Some((from, to, len)) = page_overlap(offset, size, base) {
                    // SAFETY: committed entries are not freed while the flush
                    // mutex is held.
                    let payload = unsafe { self.region.payload(index, size) };
                    page[to..to + len].copy_from_slice(&payload[from..from + len]);
                    *valid = (*valid).max(to + len);
                    played += 1;
                }
            }
            index = self.next(index);
        }
        played
    }

    fn write_entry(&self, file: &BackingFile, index: u64) -> Result<()> {
        let meta = self.region.entry(index);
        let offset = meta.offset.load(Ordering::Relaxed);
        let size = meta.size.load(Ordering::Relaxed) as usize;
        // SAFETY: the caller holds the flush mutex and the entry is committed.
        let payload = unsafe { self.region.payload(index, size) };
        file.write_all_at(payload, offset).map_err(|e| {
            error!(
                "Failed to flush log entry {} to {:?} at offset {}: {}",
                index,
                file.path(),
                offset,
                e
            );
            Error::from(e)
        })
    }

    fn mark_written(&self, index: u64) {
        self.region.entry(index).written.store(1, Ordering::Release);
        self.region.persist_entry_meta(index);
    }

    /// Write every pending entry of `fd` to its backing file and sync it
    /// once. The entries stay in the log, marked written, until the drain
    /// frees them. Returns the number of entries written.
    pub fn flush_file(&self, fd: Fd, generation: u32) -> Result<usize> {
        let _flush = self.flush.lock();
        let Some(file) = self.files.lookup(fd, generation) else {
            return Ok(0);
        };

        let head = self.head_index();
        let mut index = self.tail_index();
        let mut written = Vec::new();
        while index != head {
            let meta = self.region.entry(index);
            if meta.fd.load(Ordering::Relaxed) == fd.as_raw()
                && meta.generation.load(Ordering::Relaxed) == generation
                && meta.written.load(Ordering::Acquire) == 0
                && self.is_settled(index)
            {
                self.write_entry(&file, index)?;
                written.push(index);
            }
            index = self.next(index);
        }

        if !written.is_empty() {
            file.sync_data()?;
            self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
            for index in &written {
                self.mark_written(*index);
            }
            persist_fence();
            debug!("Flushed {} log entries of fd {}", written.len(), fd);
        }
        Ok(written.len())
    }

    /// Drain up to `max` committed entries from the tail.
    ///
    /// Stops early at an uncommitted entry or at an entry whose pages are
    /// locked by a reader or writer. The batch never ends inside a
    /// multi-fragment write; `max` is only checked between writes. Returns
    /// the number of entries freed.
    pub fn flush_batch(&self, pages: &dyn PageTracker, max: usize) -> Result<usize> {
        let mut state = self.flush.lock();
        let head = self.head_index();
        let mut index = self.tail_index();

        let mut items: Vec<BatchItem> = Vec::new();
        let mut locks: Vec<RangeLock> = Vec::new();
        let mut touched: HashMap<Fd, Arc<BackingFile>> = HashMap::new();
        let mut complete = 0;
        let mut group_left = 0u64;
        let mut failure = None;

        while index != head {
            if group_left == 0 {
                complete = items.len();
                if items.len() >= max {
                    break;
                }
            }
            let meta = self.region.entry(index);
            // Fragments are consecutive and committed before their first
            // one, so reaching a committed first fragment in FIFO order
            // means the whole group is durable.
            if meta.committed.load(Ordering::Acquire) == 0 {
                break;
            }
            if group_left == 0 {
                group_left = u64::from(meta.group_len.load(Ordering::Relaxed).max(1));
            }

            let item = BatchItem {
                index,
                fd: Fd::new(meta.fd.load(Ordering::Relaxed)),
                generation: meta.generation.load(Ordering::Relaxed),
                offset: meta.offset.load(Ordering::Relaxed),
                size: meta.size.load(Ordering::Relaxed) as usize,
            };

            if meta.written.load(Ordering::Acquire) == 0 {
                match self.files.lookup(item.fd, item.generation) {
                    Some(file) => {
                        let Some(lock) =
                            pages.try_lock_range(item.fd, item.generation, item.offset, item.size)
                        else {
                            break;
                        };
                        locks.push(lock);
                        if let Err(e) = self.write_entry(&file, index) {
                            failure = Some(e);
                            break;
                        }
                        touched.entry(item.fd).or_insert(file);
                    }
                    None => {
                        error!(
                            "Dropping log entry {} for closed fd {} (generation {})",
                            index, item.fd, item.generation
                        );
                    }
                }
            }

            items.push(item);
            group_left -= 1;
            index = self.next(index);
        }
        if group_left == 0 {
            complete = items.len();
        }

        let synced = touched.values().try_for_each(|file| {
            self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
            file.sync_data()
        });
        if let Err(e) = synced {
            error!("Failed to sync backing files during log flush: {}", e);
            release(locks);
            return Err(e.into());
        }

        let batch = &items[..complete];
        for item in batch {
            self.mark_written(item.index);
            pages.mark_clean(item.fd, item.generation, item.offset, item.size);
            let meta = self.region.entry(item.index);
            meta.waiting.store(self.capacity, Ordering::Relaxed);
            meta.fd.store(NO_FD, Ordering::Relaxed);
            meta.committed.store(0, Ordering::Release);
            self.region.persist_entry_meta(item.index);
        }
        if let Some(last) = batch.last() {
            persist_fence();
            self.region.set_tail(self.next(last.index));
            self.available.fetch_add(batch.len() as u64, Ordering::AcqRel);
            self.stats.flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.stats.batches.fetch_add(1, Ordering::Relaxed);
            state.unproductive = 0;
        } else {
            state.unproductive += 1;
            if state.unproductive % STALL_WARN_EVERY == 0 {
                warn!(
                    "Log flush made no progress in {} consecutive attempts ({} entries pending)",
                    state.unproductive,
                    self.pending()
                );
            }
        }
        release(locks);

        match failure {
            Some(e) if batch.is_empty() => Err(e),
            _ => Ok(batch.len()),
        }
    }

    /// Drain the whole log and mark the region cleanly shut down.
    ///
    /// The flush thread must be stopped first.
    pub fn final_flush(&self, pages: &dyn PageTracker, max: usize) -> Result<()> {
        let mut idle_rounds = 0;
        while self.pending() > 0 {
            if self.flush_batch(pages, max)? == 0 {
                idle_rounds += 1;
                if idle_rounds >= FINAL_FLUSH_PATIENCE {
                    return Err(Error::storage(format!(
                        "log could not be drained: {} entries still pending",
                        self.pending()
                    )));
                }
                std::thread::yield_now();
            } else {
                idle_rounds = 0;
            }
        }

        nix::unistd::sync();
        self.region.sync()?;
        self.region.set_tail(self.region.clean_marker());
        self.region.sync()?;
        info!(
            "Persistent log drained: {} entries flushed in {} batches",
            self.stats.flushed.load(Ordering::Relaxed),
            self.stats.batches.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

fn release(mut locks: Vec<RangeLock>) {
    while let Some(lock) = locks.pop() {
        drop(lock);
    }
}

/// Overlap of an entry `[offset, offset + size)` with the page at `base`,
/// as (offset in payload, offset in page, length)
fn page_overlap(offset: u64, size: usize, base: u64) -> Option<(usize, usize, usize)> {
    let start = offset.max(base);
    let end = (offset + size as u64).min(base + PAGE_SIZE as u64);
    if start >= end {
        return None;
    }
    Some((
        (start - offset) as usize,
        (start - base) as usize,
        (end - start) as usize,
    ))
}
