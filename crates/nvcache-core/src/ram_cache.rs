//! RAM page cache
//!
//! A fixed pool of page frames linked into one LRU list. Each open file that
//! is cached gets a [`RadixIndex`] mapping its page offsets to frames. Frames
//! are never freed: a miss recycles the least recently used frame, giving
//! frames touched since the last pass a second chance first.
//!
//! The persistent log stays the source of truth. A write only updates a
//! frame that is already cached; a miss loads the page from the backing file
//! and replays whatever the log still holds for it.

use crate::files::{BackingFile, FileTable};
use crate::nvlog::{NvLog, PageTracker};
use crate::radix::{LeafId, PageId, RadixIndex, RangeLock};
use nvcache_common::{Error, Fd, MAX_FILES, PAGE_SIZE, PageSpan, Result, page_spans};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

const NIL: u32 = u32::MAX;

/// Attempts on a locked LRU tail before it is treated as in use
const RECYCLE_SPIN: u32 = 64;

/// State of a cached page
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PageState {
    /// Matches the backing file plus the log at load time
    Clean,
    /// Written through the cache since it was loaded
    Dirty,
    /// Reserved, never entered
    LastChance,
}

/// The file page a frame currently holds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageBinding {
    pub fd: Fd,
    pub generation: u32,
    pub offset: u64,
    /// Leaf holding the frame, for O(1) eviction
    pub leaf: LeafId,
}

/// Content of one frame, guarded by the frame lock
pub struct PageFrame {
    binding: Option<PageBinding>,
    len: usize,
    state: PageState,
    data: Box<[u8]>,
}

impl PageFrame {
    fn new() -> Self {
        Self {
            binding: None,
            len: 0,
            state: PageState::Clean,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    fn is_bound_to(&self, radix: &RadixIndex, base: u64) -> bool {
        self.binding.is_some_and(|b| {
            b.fd == radix.fd() && b.generation == radix.generation() && b.offset == base
        })
    }

    #[must_use]
    pub const fn binding(&self) -> Option<PageBinding> {
        self.binding
    }

    /// Valid bytes from the start of the page
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn state(&self) -> PageState {
        self.state
    }
}

struct Page {
    frame: Mutex<PageFrame>,
    /// Accessed since the last eviction pass
    touched: AtomicBool,
}

/// Doubly linked list over frame indexes, most recently used first
struct LruList {
    prev: Vec<u32>,
    next: Vec<u32>,
    first: u32,
    last: u32,
}

impl LruList {
    fn new(len: u32) -> Self {
        Self {
            prev: (0..len).map(|i| if i == 0 { NIL } else { i - 1 }).collect(),
            next: (0..len).map(|i| if i + 1 == len { NIL } else { i + 1 }).collect(),
            first: 0,
            last: len - 1,
        }
    }

    fn move_to_front(&mut self, id: u32) {
        if self.first == id {
            return;
        }
        let (prev, next) = (self.prev[id as usize], self.next[id as usize]);
        self.next[prev as usize] = next;
        if next == NIL {
            self.last = prev;
        } else {
            self.prev[next as usize] = prev;
        }
        self.prev[id as usize] = NIL;
        self.next[id as usize] = self.first;
        self.prev[self.first as usize] = id;
        self.first = id;
    }

    #[cfg(test)]
    fn order(&self) -> Vec<u32> {
        let mut order = Vec::new();
        let mut id = self.first;
        while id != NIL {
            order.push(id);
            id = self.next[id as usize];
        }
        order
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of page lookups served from the pool
    pub hits: AtomicU64,
    /// Number of pages loaded from a backing file
    pub misses: AtomicU64,
    /// Misses that also replayed pending log entries
    pub dirty_misses: AtomicU64,
    /// Requests spanning more than one page
    pub overlaps: AtomicU64,
    /// Frames taken from another file page
    pub evictions: AtomicU64,
    /// Frames given a second chance
    pub promotions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub dirty_misses: u64,
    pub overlaps: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub hit_ratio: f64,
}

/// The RAM page cache
pub struct RamCache {
    pages: Box<[Page]>,
    lru: Mutex<LruList>,
    radix: RwLock<Vec<Option<Arc<RadixIndex>>>>,
    files: Arc<FileTable>,
    stats: CacheStats,
}

impl RamCache {
    /// Allocate a pool of `capacity` frames
    pub fn new(capacity: usize, files: Arc<FileTable>) -> Result<Self> {
        let len = u32::try_from(capacity)
            .ok()
            .filter(|n| *n > 0 && *n < NIL)
            .ok_or_else(|| Error::configuration(format!("invalid RAM cache size {capacity}")))?;
        let pages = (0..capacity)
            .map(|_| Page {
                frame: Mutex::new(PageFrame::new()),
                touched: AtomicBool::new(false),
            })
            .collect();
        info!(
            "RAM cache ready: {} pages ({} MB)",
            capacity,
            capacity * PAGE_SIZE / 1024 / 1024
        );
        Ok(Self {
            pages,
            lru: Mutex::new(LruList::new(len)),
            radix: RwLock::new(vec![None; MAX_FILES]),
            files,
            stats: CacheStats::default(),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            capacity: self.capacity(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            dirty_misses: self.stats.dirty_misses.load(Ordering::Relaxed),
            overlaps: self.stats.overlaps.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            promotions: self.stats.promotions.load(Ordering::Relaxed),
            hit_ratio: self.stats.hit_ratio(),
        }
    }

    /// Start caching `fd`
    pub fn new_radix(&self, fd: Fd, generation: u32) -> Result<()> {
        let mut table = self.radix.write();
        let slot = table.get_mut(fd.index()).ok_or(Error::BadDescriptor(fd))?;
        *slot = Some(Arc::new(RadixIndex::new(fd, generation)));
        Ok(())
    }

    /// Stop caching `fd`. Its frames are reclaimed lazily by the LRU.
    pub fn file_clean(&self, fd: Fd) {
        let removed = self
            .radix
            .write()
            .get_mut(fd.index())
            .and_then(Option::take);
        match removed {
            Some(radix) => debug!(
                "RAM cache: fd {} cleaned ({} leaves)",
                fd,
                radix.leaf_count()
            ),
            None => debug!("RAM cache clean: fd {} was not cached", fd),
        }
    }

    fn radix_for(&self, fd: Fd, generation: u32) -> Option<Arc<RadixIndex>> {
        self.radix
            .read()
            .get(fd.index())
            .and_then(Option::as_ref)
            .filter(|r| r.generation() == generation)
            .map(Arc::clone)
    }

    /// Read `buf.len()` bytes at `offset`, treating everything below the
    /// logical end of file `end` as readable. Returns the bytes read, short
    /// only at end of file.
    pub fn read(&self, log: &NvLog, fd: Fd, generation: u32, offset: u64, end: u64, buf: &mut [u8]) -> Result<usize> {
        let radix = self.radix_for(fd, generation).ok_or(Error::BadDescriptor(fd))?;
        let file = self.files.lookup(fd, generation).ok_or(Error::BadDescriptor(fd))?;
        if buf.len() > nvcache_common::page_free(offset) {
            self.stats.overlaps.fetch_add(1, Ordering::Relaxed);
        }

        let mut done = 0;
        for span in page_spans(offset, buf.len()) {
            let out = &mut buf[span.buf_offset..span.buf_offset + span.len];
            let n = self.page_read(log, &radix, &file, span, end, out)?;
            done += n;
            if n < span.len {
                break;
            }
        }
        Ok(done)
    }

    fn page_read(
        &self,
        log: &NvLog,
        radix: &RadixIndex,
        file: &BackingFile,
        span: PageSpan,
        end: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        // Bytes up to the logical end are readable even if nothing backs them yet.
        let logical = usize::try_from(end.saturating_sub(span.base))
            .unwrap_or(PAGE_SIZE)
            .min(PAGE_SIZE);
        loop {
            let id = self.get_page(log, radix, file, span.base)?;
            let frame = self.pages[id.index()].frame.lock();
            // The frame may have been recycled between lookup and lock.
            if !frame.is_bound_to(radix, span.base) {
                continue;
            }
            let visible = frame.len.max(logical);
            let n = visible.saturating_sub(span.in_page).min(span.len);
            out[..n].copy_from_slice(&frame.data[span.in_page..span.in_page + n]);
            return Ok(n);
        }
    }

    /// Frame holding the page at `base`, loading it on a miss
    fn get_page(&self, log: &NvLog, radix: &RadixIndex, file: &BackingFile, base: u64) -> Result<PageId> {
        if let Some(id) = radix.find(base).page {
            return Ok(self.hit(id));
        }
        let _slot = radix.lock(base)?;
        // Another thread may have loaded it while we waited for the slot.
        if let Some(id) = radix.find(base).page {
            return Ok(self.hit(id));
        }
        self.cache_miss(log, radix, file, base)
    }

    fn hit(&self, id: PageId) -> PageId {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        self.pages[id.index()].touched.store(true, Ordering::Release);
        id
    }

    /// Load the page at `base` into a recycled frame. The caller holds the
    /// slot lock of `base`.
    fn cache_miss(&self, log: &NvLog, radix: &RadixIndex, file: &BackingFile, base: u64) -> Result<PageId> {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let flush = log.flush_lock();
        let dirty = radix.find(base).dirty;
        let (id, mut frame) = self.rm_last_page();

        let read = match file.read_full_at(&mut frame.data, base) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    "Cache miss failed to read {:?} at offset {}: {}",
                    file.path(),
                    base,
                    e
                );
                return Err(Error::PageLoad {
                    path: file.path().display().to_string(),
                    offset: base,
                });
            }
        };
        frame.data[read..].fill(0);
        frame.len = read;
        frame.state = PageState::Clean;

        if dirty > 0 {
            self.stats.dirty_misses.fetch_add(1, Ordering::Relaxed);
            let PageFrame { data, len, .. } = &mut *frame;
            let played = log.play_log_on_page(&flush, radix.fd(), radix.generation(), base, data, len);
            debug!(
                "Dirty miss on fd {} offset {}: {} entries played, dirty level {}",
                radix.fd(),
                base,
                played,
                dirty
            );
        }

        let leaf = radix.insert(base, id)?;
        frame.binding = Some(PageBinding {
            fd: radix.fd(),
            generation: radix.generation(),
            offset: base,
            leaf,
        });
        self.pages[id.index()].touched.store(true, Ordering::Release);
        Ok(id)
    }

    /// Take the least recently used frame that was not touched since the
    /// last pass, unbind it and return it locked.
    fn rm_last_page(&self) -> (PageId, MutexGuard<'_, PageFrame>) {
        let mut lru = self.lru.lock();
        let mut spins = 0;
        loop {
            let id = lru.last;
            let page = &self.pages[id as usize];
            let Some(mut frame) = page.frame.try_lock() else {
                spins += 1;
                if spins >= RECYCLE_SPIN {
                    // Held by a reader or writer: it is in use, look further.
                    lru.move_to_front(id);
                    spins = 0;
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
                continue;
            };
            spins = 0;

            if page.touched.swap(false, Ordering::AcqRel) {
                lru.move_to_front(id);
                self.stats.promotions.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if let Some(binding) = frame.binding.take() {
                if let Some(radix) = self.radix_for(binding.fd, binding.generation) {
                    radix.evict(binding.offset, PageId::new(id), Some(binding.leaf));
                }
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            frame.len = 0;
            frame.state = PageState::Clean;
            lru.move_to_front(id);
            return (PageId::new(id), frame);
        }
    }

    /// Mirror a write that is already in the log. Pages that are not cached
    /// are skipped; the full length is always reported.
    pub fn write(&self, fd: Fd, generation: u32, offset: u64, buf: &[u8]) -> usize {
        let Some(radix) = self.radix_for(fd, generation) else {
            return buf.len();
        };
        if buf.len() > nvcache_common::page_free(offset) {
            self.stats.overlaps.fetch_add(1, Ordering::Relaxed);
        }
        for span in page_spans(offset, buf.len()) {
            self.page_write(&radix, span, &buf[span.buf_offset..span.buf_offset + span.len]);
        }
        buf.len()
    }

    fn page_write(&self, radix: &RadixIndex, span: PageSpan, data: &[u8]) {
        let Ok(_slot) = radix.lock(span.base) else {
            return;
        };
        let Some(id) = radix.find(span.base).page else {
            return;
        };
        let mut frame = self.pages[id.index()].frame.lock();
        if !frame.is_bound_to(radix, span.base) {
            return;
        }
        frame.state = PageState::Dirty;
        frame.data[span.in_page..span.in_page + data.len()].copy_from_slice(data);
        frame.len = frame.len.max(span.in_page + data.len());
        assert!(frame.len <= PAGE_SIZE, "page length {} exceeds page size", frame.len);
    }

    /// State and valid length of the cached page at `base`, if any
    #[must_use]
    pub fn page_info(&self, fd: Fd, generation: u32, base: u64) -> Option<(PageState, usize)> {
        let radix = self.radix_for(fd, generation)?;
        let id = radix.find(base).page?;
        let frame = self.pages[id.index()].frame.lock();
        frame
            .is_bound_to(&radix, base)
            .then_some((frame.state, frame.len))
    }

    /// Dirty level of the page at `base`, `-1` when never tracked
    #[must_use]
    pub fn dirty_level(&self, fd: Fd, generation: u32, base: u64) -> i32 {
        self.radix_for(fd, generation)
            .map_or(-1, |radix| radix.find(base).dirty)
    }
}

impl PageTracker for RamCache {
    fn mark_dirty(&self, fd: Fd, generation: u32, offset: u64, len: usize) {
        if let Some(radix) = self.radix_for(fd, generation) {
            for span in page_spans(offset, len) {
                radix.increase_dirty(span.base);
            }
        }
    }

    fn mark_clean(&self, fd: Fd, generation: u32, offset: u64, len: usize) {
        if let Some(radix) = self.radix_for(fd, generation) {
            for span in page_spans(offset, len) {
                radix.decrease_dirty(span.base);
            }
        }
    }

    fn try_lock_range(&self, fd: Fd, generation: u32, offset: u64, len: usize) -> Option<RangeLock> {
        let mut range = RangeLock::default();
        if let Some(radix) = self.radix_for(fd, generation) {
            for span in page_spans(offset, len) {
                // Dropping `range` releases what was taken so far.
                range.push(radix.try_lock(span.base)?);
            }
        }
        Some(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::Cursor;
    use rand::RngCore;
    use std::thread;
    use tempfile::{TempDir, tempdir};

    const PAGE: u64 = PAGE_SIZE as u64;

    struct Harness {
        _dir: TempDir,
        log: Arc<NvLog>,
        cache: Arc<RamCache>,
        file: Arc<BackingFile>,
    }

    impl Harness {
        fn new(log_entries: u64, pages: usize) -> Self {
            let dir = tempdir().unwrap();
            let files = Arc::new(FileTable::new(MAX_FILES));
            let (log, _) = NvLog::open(None, log_entries, false, Arc::clone(&files)).unwrap();
            let cache = RamCache::new(pages, Arc::clone(&files)).unwrap();

            let path = dir.path().join("data");
            let os_file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            let file = files.insert(os_file, path, libc::O_RDWR, Cursor::default()).unwrap();
            cache.new_radix(file.fd(), file.generation()).unwrap();
            Self {
                _dir: dir,
                log: Arc::new(log),
                cache: Arc::new(cache),
                file,
            }
        }

        fn write(&self, offset: u64, data: &[u8]) {
            let (fd, generation) = (self.file.fd(), self.file.generation());
            self.log
                .add_entry(self.cache.as_ref(), fd, generation, offset, data)
                .unwrap();
            assert_eq!(self.cache.write(fd, generation, offset, data), data.len());
        }

        fn read(&self, offset: u64, len: usize, end: u64) -> Vec<u8> {
            let mut buf = vec![0u8; len];
            let n = self
                .cache
                .read(&self.log, self.file.fd(), self.file.generation(), offset, end, &mut buf)
                .unwrap();
            buf.truncate(n);
            buf
        }
    }

    #[test]
    fn test_lru_move_to_front() {
        let mut lru = LruList::new(4);
        assert_eq!(lru.order(), vec![0, 1, 2, 3]);
        lru.move_to_front(3);
        assert_eq!(lru.order(), vec![3, 0, 1, 2]);
        assert_eq!(lru.last, 2);
        lru.move_to_front(1);
        assert_eq!(lru.order(), vec![1, 3, 0, 2]);
        lru.move_to_front(1);
        assert_eq!(lru.order(), vec![1, 3, 0, 2]);

        let mut single = LruList::new(1);
        single.move_to_front(0);
        assert_eq!(single.order(), vec![0]);
    }

    #[test]
    fn test_invalid_capacity() {
        let files = Arc::new(FileTable::new(1));
        assert!(RamCache::new(0, files).is_err());
    }

    #[test]
    fn test_second_chance() {
        let h = Harness::new(8, 2);
        h.cache.pages[1].touched.store(true, Ordering::Relaxed);

        let (id, frame) = h.cache.rm_last_page();
        drop(frame);
        // Frame 1 was the tail but touched, so frame 0 goes first.
        assert_eq!(id, PageId::new(0));
        assert_eq!(h.cache.stats_snapshot().promotions, 1);
        assert!(!h.cache.pages[1].touched.load(Ordering::Relaxed));
        assert_eq!(h.cache.lru.lock().order(), vec![0, 1]);
    }

    #[test]
    fn test_eviction_replays_pending_log() {
        let h = Harness::new(4, 2);
        let pages: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i + 1; PAGE_SIZE]).collect();

        for (i, data) in pages.iter().enumerate() {
            let offset = i as u64 * PAGE;
            h.write(offset, data);
            assert_eq!(&h.read(offset, PAGE_SIZE, 3 * PAGE), data);
        }
        let stats = h.cache.stats_snapshot();
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.dirty_misses, 3);
        assert_eq!(stats.evictions, 1);

        // Page 0 was the least recently touched and is gone.
        let (fd, generation) = (h.file.fd(), h.file.generation());
        assert!(h.cache.page_info(fd, generation, 0).is_none());
        assert_eq!(h.cache.page_info(fd, generation, 2 * PAGE), Some((PageState::Clean, PAGE_SIZE)));

        assert_eq!(&h.read(PAGE, PAGE_SIZE, 3 * PAGE), &pages[1]);
        assert_eq!(h.cache.stats_snapshot().hits, 1);

        // Nothing was flushed, so the reload comes from the log alone.
        assert_eq!(&h.read(0, PAGE_SIZE, 3 * PAGE), &pages[0]);
        let stats = h.cache.stats_snapshot();
        assert_eq!(stats.misses, 4);
        assert_eq!(stats.dirty_misses, 4);
        assert_eq!(std::fs::metadata(h.file.path()).unwrap().len(), 0);
    }

    #[test]
    fn test_write_through_cached_page() {
        let h = Harness::new(16, 4);
        h.file.write_all_at(&[7u8; 100], 0).unwrap();
        assert_eq!(h.read(0, 100, 100), vec![7u8; 100]);

        h.write(50, &[9u8; 100]);
        let (fd, generation) = (h.file.fd(), h.file.generation());
        assert_eq!(h.cache.page_info(fd, generation, 0), Some((PageState::Dirty, 150)));
        assert_eq!(h.cache.dirty_level(fd, generation, 0), 1);

        let data = h.read(0, 200, 150);
        assert_eq!(data.len(), 150);
        assert_eq!(&data[..50], &[7u8; 50]);
        assert_eq!(&data[50..], &[9u8; 100]);
        assert_eq!(h.cache.stats_snapshot().hits, 1);
    }

    #[test]
    fn test_write_to_absent_page_reports_full_size() {
        let h = Harness::new(16, 2);
        let (fd, generation) = (h.file.fd(), h.file.generation());
        assert_eq!(h.cache.write(fd, generation, 10 * PAGE, &[1u8; 5000]), 5000);
        assert!(h.cache.page_info(fd, generation, 10 * PAGE).is_none());
        assert_eq!(h.cache.write(Fd::new(99), 1, 0, &[1u8; 10]), 10);
    }

    #[test]
    fn test_sparse_read_zero_fills_holes() {
        let h = Harness::new(16, 4);
        h.write(0, b"head");
        h.write(2 * PAGE, b"tail");
        let end = 2 * PAGE + 4;

        let data = h.read(0, end as usize + 100, end);
        assert_eq!(data.len(), end as usize);
        assert_eq!(&data[..4], b"head");
        assert!(data[4..2 * PAGE_SIZE].iter().all(|b| *b == 0));
        assert_eq!(&data[2 * PAGE_SIZE..], b"tail");
        assert_eq!(h.cache.stats_snapshot().overlaps, 1);
    }

    #[test]
    fn test_flush_lowers_dirty_level() {
        let h = Harness::new(16, 4);
        let (fd, generation) = (h.file.fd(), h.file.generation());
        h.write(PAGE - 10, &[3u8; 20]);
        assert_eq!(h.cache.dirty_level(fd, generation, 0), 1);
        assert_eq!(h.cache.dirty_level(fd, generation, PAGE), 1);

        assert_eq!(h.log.flush_batch(h.cache.as_ref(), 16).unwrap(), 1);
        assert_eq!(h.cache.dirty_level(fd, generation, 0), 0);
        assert_eq!(h.cache.dirty_level(fd, generation, PAGE), 0);
        assert_eq!(h.read(PAGE - 10, 20, PAGE + 10), vec![3u8; 20]);
    }

    #[test]
    fn test_batch_yields_to_locked_page() {
        let h = Harness::new(16, 4);
        let (fd, generation) = (h.file.fd(), h.file.generation());
        h.write(0, b"locked");

        let radix = h.cache.radix_for(fd, generation).unwrap();
        let log = Arc::clone(&h.log);
        let cache = Arc::clone(&h.cache);
        let guard = radix.lock(0).unwrap();
        let flushed = thread::spawn(move || log.flush_batch(cache.as_ref(), 16).unwrap())
            .join()
            .unwrap();
        assert_eq!(flushed, 0);
        drop(guard);
        assert_eq!(h.log.flush_batch(h.cache.as_ref(), 16).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_read_after_write() {
        let h = Harness::new(16, 4);
        let stop = Arc::new(AtomicBool::new(false));

        let drainer = {
            let (log, cache, stop) = (Arc::clone(&h.log), Arc::clone(&h.cache), Arc::clone(&stop));
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    log.flush_batch(cache.as_ref(), 4).unwrap();
                    thread::yield_now();
                }
            })
        };
        h.log.attach_drainer(Some(drainer.thread().clone()));

        let (fd, generation) = (h.file.fd(), h.file.generation());
        let end = 32 * PAGE;
        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let (log, cache) = (Arc::clone(&h.log), Arc::clone(&h.cache));
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut data = vec![0u8; 1000];
                    for i in 0..50u64 {
                        let offset = (t * 8 + i % 8) * PAGE + (i * 37) % 3000;
                        rng.fill_bytes(&mut data);
                        log.add_entry(cache.as_ref(), fd, generation, offset, &data).unwrap();
                        cache.write(fd, generation, offset, &data);

                        let mut back = vec![0u8; data.len()];
                        let n = cache.read(&log, fd, generation, offset, end, &mut back).unwrap();
                        assert_eq!(n, data.len());
                        assert_eq!(back, data);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        stop.store(true, Ordering::Release);
        drainer.join().unwrap();
        h.log.attach_drainer(None);
        h.log.final_flush(h.cache.as_ref(), 16).unwrap();
        assert_eq!(h.log.pending(), 0);
        for page in 0..32 {
            assert_eq!(h.cache.dirty_level(fd, generation, page * PAGE), 0);
        }
    }
}
