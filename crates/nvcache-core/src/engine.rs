//! Descriptor-keyed engine
//!
//! [`NvCache`] ties the persistent log, the RAM cache and the flush thread
//! together behind file-API shaped operations. Descriptors opened read-only
//! are passed through; write-only descriptors are logged; read-write
//! descriptors are logged and cached.

#![allow(unsafe_code)]

use crate::files::{BackingFile, Cursor, FileTable};
use crate::flusher::{FlushSettings, Flusher};
use crate::nvlog::{LogStatsSnapshot, NvLog};
use crate::ram_cache::{CacheStatsSnapshot, RamCache};
use crate::recovery::RecoveryReport;
use nvcache_common::{AccessMode, Error, Fd, LOG_ENTRY_SIZE, MAX_FILES, NvCacheConfig, Result};
use serde::Serialize;
use std::fs::{Metadata, OpenOptions};
use std::io::SeekFrom;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Open flags handled by the engine rather than passed to the OS
const ENGINE_FLAGS: i32 = libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL | libc::O_APPEND;

/// File status as seen through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    /// Logical size, including writes still only in the log
    pub size: u64,
    pub blksize: u64,
    /// 512-byte blocks
    pub blocks: u64,
}

impl FileStat {
    fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
            mode: metadata.mode(),
            nlink: metadata.nlink(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size(),
            blksize: metadata.blksize(),
            blocks: metadata.blocks(),
        }
    }

    fn with_logical_size(mut self, size: u64) -> Self {
        self.size = size;
        self.blocks = (self.blksize + size) / 512;
        self
    }
}

/// `flock` operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockOp {
    Shared,
    Exclusive,
    Unlock,
}

impl FlockOp {
    const fn to_raw(self, nonblocking: bool) -> i32 {
        let op = match self {
            Self::Shared => libc::LOCK_SH,
            Self::Exclusive => libc::LOCK_EX,
            Self::Unlock => libc::LOCK_UN,
        };
        if nonblocking { op | libc::LOCK_NB } else { op }
    }
}

/// Statistics of a running engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineStats {
    pub open_files: usize,
    pub cache: CacheStatsSnapshot,
    pub log: LogStatsSnapshot,
}

/// The engine
pub struct NvCache {
    config: NvCacheConfig,
    files: Arc<FileTable>,
    log: Arc<NvLog>,
    cache: Arc<RamCache>,
    flusher: Option<Flusher>,
    recovery: Option<RecoveryReport>,
    closed: AtomicBool,
}

impl NvCache {
    /// Open the persistent log (recovering it if needed), allocate the RAM
    /// cache and start the flush thread.
    pub fn new(config: NvCacheConfig) -> Result<Self> {
        config.validate()?;
        let files = Arc::new(FileTable::new(MAX_FILES));
        let (log, recovery) = NvLog::open(
            config.log_path.as_deref(),
            config.log_entries,
            config.enable_recovery,
            Arc::clone(&files),
        )?;
        let log = Arc::new(log);
        let cache = Arc::new(RamCache::new(config.ram_cache_pages, Arc::clone(&files))?);

        let flusher = if config.flush_thread {
            Some(Flusher::spawn(
                Arc::clone(&log),
                Arc::clone(&cache) as Arc<dyn crate::nvlog::PageTracker>,
                FlushSettings::from(&config),
            )?)
        } else {
            None
        };

        info!(
            "NVCache started: {} cache pages, {} log entries, flush thread {}",
            config.ram_cache_pages,
            config.log_entries,
            if flusher.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            config,
            files,
            log,
            cache,
            flusher,
            recovery,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &NvCacheConfig {
        &self.config
    }

    /// What recovery did at startup, if it ran
    #[must_use]
    pub const fn recovery_report(&self) -> Option<RecoveryReport> {
        self.recovery
    }

    #[must_use]
    pub fn log(&self) -> &NvLog {
        &self.log
    }

    #[must_use]
    pub fn cache(&self) -> &RamCache {
        &self.cache
    }

    /// Open `path` with C `open` flags and creation `mode`
    pub fn open_file(&self, path: impl AsRef<Path>, flags: i32, mode: u32) -> Result<Fd> {
        let path = std::path::absolute(path.as_ref())?;
        let access = AccessMode::from_flags(flags);

        let mut options = OpenOptions::new();
        options
            .read(access.is_readable() || access.is_cached())
            .write(access.is_managed())
            .create(flags & libc::O_CREAT != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode)
            .custom_flags(flags & !ENGINE_FLAGS);
        if flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 {
            options.create_new(true);
        }
        let file = options.open(&path)?;

        let end = file.metadata()?.len();
        let pos = if flags & libc::O_APPEND != 0 { end } else { 0 };
        let backing = self.files.insert(file, path.clone(), flags, Cursor { pos, end })?;
        let fd = backing.fd();

        if access.is_managed() {
            if let Err(e) = self.log.region().set_file(fd, &path, flags, mode) {
                let _ = self.files.remove(fd);
                return Err(e);
            }
        }
        if access.is_cached() {
            self.cache.new_radix(fd, backing.generation())?;
        }
        debug!("Opened {:?} as fd {} ({:?}, size {})", path, fd, access, end);
        Ok(fd)
    }

    /// Flush the pending writes of `fd` and release it. On a flush failure
    /// the descriptor stays open.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let file = self.files.get(fd)?;
        if file.access().is_managed() {
            self.log.flush_file(fd, file.generation())?;
            self.cache.file_clean(fd);
            self.log.region().clear_file(fd)?;
        }
        *file.cursor() = Cursor::default();
        self.files.remove(fd)?;
        debug!("Closed fd {} ({:?})", fd, file.path());
        Ok(())
    }

    fn readable(&self, fd: Fd) -> Result<Arc<BackingFile>> {
        let file = self.files.get(fd)?;
        if !file.access().is_readable() {
            return Err(Error::invalid_argument(format!("fd {fd} is not open for reading")));
        }
        Ok(file)
    }

    fn writable(&self, fd: Fd) -> Result<Arc<BackingFile>> {
        let file = self.files.get(fd)?;
        if !file.access().is_managed() {
            return Err(Error::invalid_argument(format!("fd {fd} is not open for writing")));
        }
        Ok(file)
    }

    fn read_at(&self, file: &BackingFile, offset: u64, end: u64, buf: &mut [u8]) -> Result<usize> {
        if !file.access().is_cached() {
            return Ok(file.file().read_at(buf, offset)?);
        }
        if offset >= end {
            return Ok(0);
        }
        let len = usize::try_from(end - offset).map_or(buf.len(), |left| left.min(buf.len()));
        self.cache
            .read(&self.log, file.fd(), file.generation(), offset, end, &mut buf[..len])
    }

    /// Read at the cursor and advance it
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let file = self.readable(fd)?;
        let mut cursor = file.cursor();
        let n = self.read_at(&file, cursor.pos, cursor.end, buf)?;
        cursor.pos += n as u64;
        Ok(n)
    }

    /// Read at `offset` without moving the cursor
    pub fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.readable(fd)?;
        let end = file.cursor().end;
        self.read_at(&file, offset, end, buf)
    }

    /// Log `buf` at `offset`, then mirror it into the cache. Writes larger
    /// than the log are logged in several independent pieces; if a later
    /// piece fails, the pieces already logged are reported as a short write.
    fn write_at(&self, file: &BackingFile, offset: u64, buf: &[u8]) -> Result<usize> {
        let max_piece = (self.log.capacity() as usize - 1) * LOG_ENTRY_SIZE;
        let mut done = 0;
        for piece in buf.chunks(max_piece) {
            let at = offset + done as u64;
            if let Err(e) = self
                .log
                .add_entry(self.cache.as_ref(), file.fd(), file.generation(), at, piece)
            {
                if done == 0 {
                    return Err(e);
                }
                warn!(
                    "Short write on fd {}: {} of {} bytes logged: {}",
                    file.fd(),
                    done,
                    buf.len(),
                    e
                );
                return Ok(done);
            }
            if file.access().is_cached() {
                self.cache.write(file.fd(), file.generation(), at, piece);
            }
            done += piece.len();
        }
        Ok(done)
    }

    /// Write at the cursor (or at the end with `O_APPEND`) and advance it
    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let file = self.writable(fd)?;
        let mut cursor = file.cursor();
        let offset = if file.flags() & libc::O_APPEND != 0 {
            cursor.end
        } else {
            cursor.pos
        };
        let n = self.write_at(&file, offset, buf)?;
        cursor.pos = offset + n as u64;
        cursor.end = cursor.end.max(cursor.pos);
        Ok(n)
    }

    /// Write at `offset` without moving the cursor
    pub fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> Result<usize> {
        let file = self.writable(fd)?;
        let n = self.write_at(&file, offset, buf)?;
        let mut cursor = file.cursor();
        cursor.end = cursor.end.max(offset + n as u64);
        Ok(n)
    }

    /// Move the cursor, returning the new position
    pub fn lseek(&self, fd: Fd, pos: SeekFrom) -> Result<u64> {
        let file = self.files.get(fd)?;
        let mut cursor = file.cursor();
        let end = if file.access().is_managed() {
            cursor.end
        } else {
            file.file().metadata()?.len()
        };
        let (base, delta) = match pos {
            SeekFrom::Start(n) => (n, 0),
            SeekFrom::Current(d) => (cursor.pos, d),
            SeekFrom::End(d) => (end, d),
        };
        let target = base
            .checked_add_signed(delta)
            .ok_or_else(|| Error::invalid_argument(format!("seek to {base}{delta:+} on fd {fd}")))?;
        cursor.pos = target;
        Ok(target)
    }

    /// Status of an open descriptor, with the logical size for managed files
    pub fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let file = self.files.get(fd)?;
        let stat = FileStat::from_metadata(&file.file().metadata()?);
        if file.access().is_managed() {
            Ok(stat.with_logical_size(file.cursor().end))
        } else {
            Ok(stat)
        }
    }

    /// Status of `path`, through its open descriptor if there is one
    pub fn stat(&self, path: impl AsRef<Path>) -> Result<FileStat> {
        match self.find_fd_by_path(path.as_ref()) {
            Some(fd) => self.fstat(fd),
            None => Ok(FileStat::from_metadata(&std::fs::metadata(path.as_ref())?)),
        }
    }

    /// Log-managed descriptors are durable as soon as a write returns
    pub fn fsync(&self, fd: Fd) -> Result<()> {
        let file = self.files.get(fd)?;
        if !file.access().is_managed() {
            file.file().sync_all()?;
        }
        Ok(())
    }

    /// Flush the pending writes of `fd`, then apply the advisory lock
    pub fn flock(&self, fd: Fd, op: FlockOp, nonblocking: bool) -> Result<()> {
        let file = self.files.get(fd)?;
        if file.access().is_managed() {
            self.log.flush_file(fd, file.generation())?;
        }
        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        let ret = unsafe { libc::flock(file.file().as_raw_fd(), op.to_raw(nonblocking)) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Descriptor open on `path`, if any
    #[must_use]
    pub fn find_fd_by_path(&self, path: &Path) -> Option<Fd> {
        let path: PathBuf = std::path::absolute(path).ok()?;
        self.files.find_by_path(&path)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            open_files: self.files.open_count(),
            cache: self.cache.stats_snapshot(),
            log: self.log.stats_snapshot(),
        }
    }

    /// Stop the flush thread, drain the log and mark the region clean.
    /// Later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(flusher) = &self.flusher {
            flusher.stop();
        }
        self.log.final_flush(self.cache.as_ref(), self.config.max_batch)?;
        info!("NVCache shut down");
        Ok(())
    }

    /// Drop the engine without draining the log, as a crash would
    pub fn abandon(self) {
        self.closed.store(true, Ordering::Release);
        if let Some(flusher) = &self.flusher {
            flusher.stop();
        }
    }
}

impl Drop for NvCache {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("NVCache shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn config(dir: &TempDir) -> NvCacheConfig {
        NvCacheConfig {
            ram_cache_pages: 8,
            log_entries: 32,
            enable_recovery: true,
            flush_thread: true,
            max_batch: 8,
            min_batch: 2,
            log_path: Some(dir.path().join("nvlog")),
            flush_core: None,
            flush_idle: Duration::from_micros(50),
        }
    }

    const RW_CREATE: i32 = libc::O_RDWR | libc::O_CREAT;

    #[test]
    fn test_write_read_seek() {
        let dir = tempdir().unwrap();
        let engine = NvCache::new(config(&dir)).unwrap();
        let path = dir.path().join("file");
        let fd = engine.open_file(&path, RW_CREATE, 0o644).unwrap();

        assert_eq!(engine.write(fd, b"hello ").unwrap(), 6);
        assert_eq!(engine.write(fd, b"world").unwrap(), 5);
        assert_eq!(engine.fstat(fd).unwrap().size, 11);

        assert_eq!(engine.lseek(fd, SeekFrom::Start(0)).unwrap(), 0);
        let mut buf = [0u8; 64];
        assert_eq!(engine.read(fd, &mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");
        assert_eq!(engine.read(fd, &mut buf).unwrap(), 0);

        assert_eq!(engine.lseek(fd, SeekFrom::End(-5)).unwrap(), 6);
        assert_eq!(engine.lseek(fd, SeekFrom::Current(1)).unwrap(), 7);
        assert!(engine.lseek(fd, SeekFrom::Current(-100)).is_err());

        let mut word = [0u8; 5];
        assert_eq!(engine.pread(fd, &mut word, 6).unwrap(), 5);
        assert_eq!(&word, b"world");
        assert_eq!(engine.find_fd_by_path(&path), Some(fd));
        assert_eq!(engine.stat(&path).unwrap().size, 11);

        engine.close(fd).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert!(matches!(engine.read(fd, &mut buf), Err(Error::BadDescriptor(_))));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_append_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, b"one\n").unwrap();

        let engine = NvCache::new(config(&dir)).unwrap();
        let fd = engine
            .open_file(&path, libc::O_WRONLY | libc::O_APPEND, 0)
            .unwrap();
        engine.write(fd, b"two\n").unwrap();
        // Appends ignore the cursor.
        engine.lseek(fd, SeekFrom::Start(0)).unwrap();
        engine.write(fd, b"three\n").unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(engine.read(fd, &mut buf), Err(Error::InvalidArgument(_))));
        engine.close(fd).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one\ntwo\nthree\n");
    }

    #[test]
    fn test_read_only_passthrough() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro");
        std::fs::write(&path, b"static").unwrap();

        let engine = NvCache::new(config(&dir)).unwrap();
        let fd = engine.open_file(&path, libc::O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(engine.read(fd, &mut buf).unwrap(), 6);
        assert!(matches!(engine.write(fd, b"x"), Err(Error::InvalidArgument(_))));
        engine.fsync(fd).unwrap();
        engine.flock(fd, FlockOp::Shared, true).unwrap();
        engine.flock(fd, FlockOp::Unlock, false).unwrap();
        assert_eq!(engine.stats().cache.misses, 0);
        engine.close(fd).unwrap();
    }

    #[test]
    fn test_large_random_file_survives_eviction() {
        let dir = tempdir().unwrap();
        let engine = NvCache::new(config(&dir)).unwrap();
        let path = dir.path().join("big");
        let fd = engine.open_file(&path, RW_CREATE | libc::O_TRUNC, 0o600).unwrap();

        // Bigger than both the cache and the log.
        let mut payload = vec![0u8; 48 * LOG_ENTRY_SIZE + 123];
        rand::thread_rng().fill_bytes(&mut payload);
        for chunk in payload.chunks(10_000) {
            engine.write(fd, chunk).unwrap();
        }

        let mut back = vec![0u8; payload.len()];
        let mut done = 0;
        for (i, chunk) in back.chunks_mut(7_000).enumerate() {
            let n = engine.pread(fd, chunk, (i * 7_000) as u64).unwrap();
            assert_eq!(n, chunk.len());
            done += n;
        }
        assert_eq!(done, payload.len());
        assert_eq!(back, payload);

        let stats = engine.stats();
        assert!(stats.cache.evictions > 0);
        assert_eq!(stats.open_files, 1);

        engine.fsync(fd).unwrap();
        engine.flock(fd, FlockOp::Exclusive, false).unwrap();
        // flock flushed the file first.
        assert_eq!(std::fs::read(&path).unwrap(), payload);
        engine.close(fd).unwrap();
    }

    #[test]
    fn test_crash_then_recover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut cfg = config(&dir);
        cfg.flush_thread = false;

        let engine = NvCache::new(cfg.clone()).unwrap();
        let fd = engine.open_file(&path, RW_CREATE, 0o644).unwrap();
        engine.pwrite(fd, b"durable", 0).unwrap();
        engine.pwrite(fd, b"!", 7).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
        engine.abandon();

        let engine = NvCache::new(cfg).unwrap();
        let report = engine.recovery_report().unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.discarded, 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"durable!");
        engine.shutdown().unwrap();
        assert_eq!(engine.log().region().state(), crate::region::RegionState::Clean);
    }

    #[test]
    fn test_log_exhaustion_without_flush_thread() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.flush_thread = false;
        cfg.log_entries = 4;
        let engine = NvCache::new(cfg).unwrap();
        let fd = engine
            .open_file(dir.path().join("f"), RW_CREATE, 0o644)
            .unwrap();
        for i in 0..3u64 {
            engine.pwrite(fd, b"x", i).unwrap();
        }
        let err = engine.pwrite(fd, b"x", 3).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.errno(), libc::ENOSPC);

        // close flushes the file; the next shutdown frees the entries.
        engine.close(fd).unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_oversized_write_reports_logged_prefix() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.flush_thread = false;
        cfg.log_entries = 4;
        let engine = NvCache::new(cfg).unwrap();
        let path = dir.path().join("big");
        let fd = engine.open_file(&path, RW_CREATE, 0o644).unwrap();

        // Two pieces of three entries each; only the first fits.
        let piece = 3 * LOG_ENTRY_SIZE;
        let data = vec![0x5Au8; 2 * piece];
        assert_eq!(engine.write(fd, &data).unwrap(), piece);
        assert_eq!(engine.lseek(fd, SeekFrom::Current(0)).unwrap(), piece as u64);
        assert_eq!(engine.fstat(fd).unwrap().size, piece as u64);

        engine.close(fd).unwrap();
        engine.shutdown().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x5Au8; piece]);
    }

    #[test]
    fn test_descriptor_reuse_keeps_files_apart() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.flush_thread = false;
        let engine = NvCache::new(cfg).unwrap();

        let first = engine.open_file(dir.path().join("a"), RW_CREATE, 0o644).unwrap();
        engine.pwrite(first, &[1u8; 100], 0).unwrap();
        engine.close(first).unwrap();

        let second = engine.open_file(dir.path().join("b"), RW_CREATE, 0o644).unwrap();
        assert_eq!(second, first);
        engine.pwrite(second, &[2u8; 10], 0).unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(engine.pread(second, &mut buf, 0).unwrap(), 10);
        assert_eq!(&buf[..10], &[2u8; 10]);
        // Only the write through the new descriptor counts against its page.
        assert_eq!(engine.cache().dirty_level(second, 2, 0), 1);
        engine.shutdown().unwrap();

        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), vec![1u8; 100]);
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), vec![2u8; 10]);
    }
}
