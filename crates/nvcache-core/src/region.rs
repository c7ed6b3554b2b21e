//! Persistent region layout
//!
//! The log lives in one memory mapping, normally a DAX device or a file on
//! a persistent-memory filesystem:
//!
//! ```text
//! +-------------+------------------------+------+--------------------------------+
//! | Header      | File table             | Tail | Entries                        |
//! | 4 KB        | MAX_FILES x FileSlot   | 64 B | capacity x (64 B meta + 4 KB)  |
//! +-------------+------------------------+------+--------------------------------+
//! ```
//!
//! The tail holds the index of the oldest unflushed entry, or `capacity`
//! once the log was shut down cleanly.

#![allow(unsafe_code)]

use crate::persist::{persist_fence, write_back};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nvcache_common::{Error, Fd, LOG_ENTRY_SIZE, MAX_FILES, MAX_PATH_LEN, Result};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Region header magic number
const REGION_MAGIC: u64 = 0x4E56_4C4F_4743_4143; // "NVLOGCAC"

const REGION_VERSION: u32 = 1;

/// Header size (aligned to 4KB)
const HEADER_SIZE: usize = 4096;

/// Serialized header length (magic + version + entry size + capacity + slots + checksum)
const HEADER_BYTES: usize = 32;

/// Marks an entry slot that does not belong to any descriptor
pub const NO_FD: u32 = u32::MAX;

/// Metadata of one log entry, one cache line wide.
///
/// The payload follows immediately after it in the mapping.
#[repr(C, align(64))]
pub struct EntryMeta {
    pub fd: AtomicU32,
    pub generation: AtomicU32,
    pub offset: AtomicU64,
    pub size: AtomicU32,
    /// Number of fragments of the logical write this entry belongs to
    pub group_len: AtomicU32,
    /// Slot of the first fragment of the logical write
    pub waiting: AtomicU64,
    pub committed: AtomicU32,
    pub written: AtomicU32,
}

const ENTRY_STRIDE: usize = size_of::<EntryMeta>() + LOG_ENTRY_SIZE;

#[repr(C, align(64))]
struct FileSlot {
    path: [u8; MAX_PATH_LEN],
    path_len: u32,
    flags: i32,
    mode: u32,
    opened: u32,
}

#[repr(C, align(64))]
struct TailLine {
    tail: AtomicU64,
}

/// A file recorded in the persistent file table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub flags: i32,
    pub mode: u32,
}

/// State of the region found at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Newly formatted, nothing to recover
    Fresh,
    /// Previous user shut down cleanly
    Clean,
    /// Previous user died with entries possibly pending from `tail`
    Unclean { tail: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionHeader {
    magic: u64,
    version: u32,
    entry_size: u32,
    capacity: u64,
    file_slots: u32,
    checksum: u32,
}

impl RegionHeader {
    fn new(capacity: u64) -> Self {
        let mut header = Self {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            entry_size: LOG_ENTRY_SIZE as u32,
            capacity,
            file_slots: MAX_FILES as u32,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn to_bytes(self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        let mut cursor = &mut buf[..];
        // Writes into a correctly sized array cannot fail.
        let _ = cursor.write_all(&self.magic.to_le_bytes());
        let _ = cursor.write_all(&self.version.to_le_bytes());
        let _ = cursor.write_all(&self.entry_size.to_le_bytes());
        let _ = cursor.write_all(&self.capacity.to_le_bytes());
        let _ = cursor.write_all(&self.file_slots.to_le_bytes());
        let _ = cursor.write_all(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_BYTES {
            return Err(Error::RegionCorrupt("header too small".into()));
        }
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u64_at = |at: usize| (u64::from(u32_at(at + 4)) << 32) | u64::from(u32_at(at));

        let header = Self {
            magic: u64_at(0),
            version: u32_at(8),
            entry_size: u32_at(12),
            capacity: u64_at(16),
            file_slots: u32_at(24),
            checksum: u32_at(28),
        };
        if header.magic != REGION_MAGIC {
            return Err(Error::RegionCorrupt("invalid magic".into()));
        }
        if header.checksum != header.compute_checksum() {
            return Err(Error::RegionCorrupt("header checksum mismatch".into()));
        }
        if header.version != REGION_VERSION
            || header.entry_size as usize != LOG_ENTRY_SIZE
            || header.file_slots as usize != MAX_FILES
        {
            return Err(Error::RegionCorrupt(format!(
                "unsupported layout: version {}, entry size {}, {} file slots",
                header.version, header.entry_size, header.file_slots
            )));
        }
        Ok(header)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = Self { checksum: 0, ..*self }.to_bytes();
        crc32c::crc32c(&bytes[..HEADER_BYTES - 4])
    }
}

/// Byte length of a region holding `capacity` entries
#[must_use]
pub const fn region_len(capacity: u64) -> usize {
    HEADER_SIZE + MAX_FILES * size_of::<FileSlot>() + size_of::<TailLine>() + capacity as usize * ENTRY_STRIDE
}

/// Capacity recorded in the header of the region file at `path`, without
/// mapping or modifying it. `None` when the file is too small or blank.
pub fn stored_capacity(path: &Path) -> Result<Option<u64>> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::storage(format!("failed to open region {}: {}", path.display(), e)))?;
    let mut buf = [0u8; HEADER_BYTES];
    match file.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if buf.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    Ok(Some(RegionHeader::from_bytes(&buf)?.capacity))
}

const fn file_table_offset() -> usize {
    HEADER_SIZE
}

const fn tail_offset() -> usize {
    HEADER_SIZE + MAX_FILES * size_of::<FileSlot>()
}

const fn entries_offset() -> usize {
    tail_offset() + size_of::<TailLine>()
}

/// Memory behind a region
enum Mapping {
    /// Shared file mapping, or anonymous memory
    Shared(MmapMut),
    /// Copy-on-write view of a file; stores never reach it
    Private(MmapMut),
    /// `MAP_SYNC` mapping of a DAX file. Block allocation is durable at
    /// fault time, so cache-line write-back alone persists stores.
    Synchronous { ptr: NonNull<c_void>, len: usize },
}

impl Mapping {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Self::Shared(map) | Self::Private(map) => map.as_mut_ptr(),
            Self::Synchronous { ptr, .. } => ptr.as_ptr().cast(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Shared(map) | Self::Private(map) => &mut map[..],
            // SAFETY: the mapping is `len` bytes long and lives as long as self.
            Self::Synchronous { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<u8>(), *len)
            },
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Self::Shared(map) => map.flush(),
            Self::Private(_) => Ok(()),
            // SAFETY: ptr/len describe a live mapping owned by self.
            Self::Synchronous { ptr, len } => unsafe {
                nix::sys::mman::msync(*ptr, *len, nix::sys::mman::MsFlags::MS_SYNC)
                    .map_err(std::io::Error::from)
            },
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Self::Synchronous { ptr, len } = *self {
            // SAFETY: the mapping is owned by self and no longer referenced.
            if let Err(e) = unsafe { nix::sys::mman::munmap(ptr, len) } {
                warn!("Failed to unmap persistent region: {}", e);
            }
        }
    }
}

/// Map `file` with `MAP_SHARED_VALIDATE | MAP_SYNC`. Fails with
/// `EOPNOTSUPP` unless the file lives on a DAX filesystem.
#[cfg(target_os = "linux")]
fn map_synchronous(file: &File, len: usize) -> nix::Result<Mapping> {
    use nix::sys::mman::{MapFlags, ProtFlags, mmap};

    let length = std::num::NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
    // SAFETY: a fresh mapping at a kernel-chosen address aliases no Rust memory.
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::from_bits_retain(libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC),
            file,
            0,
        )?
    };
    Ok(Mapping::Synchronous { ptr, len })
}

#[cfg(not(target_os = "linux"))]
fn map_synchronous(_file: &File, _len: usize) -> nix::Result<Mapping> {
    Err(Errno::EOPNOTSUPP)
}

/// Allocate every block of the region file up front, so stores to the
/// mapping never depend on allocation metadata that is not yet durable.
fn preallocate(file: &File, len: usize) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use std::os::fd::AsRawFd;

        let size = libc::off_t::try_from(len)
            .map_err(|_| Error::configuration(format!("region of {len} bytes is too large")))?;
        match nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, size) {
            Ok(()) => return Ok(()),
            Err(Errno::ENOSPC) => return Err(std::io::Error::from(Errno::ENOSPC).into()),
            Err(errno) => warn!("Cannot preallocate persistent region: {}; leaving it sparse", errno),
        }
    }
    file.set_len(len as u64)?;
    Ok(())
}

/// The mapped persistent region
pub struct PersistentRegion {
    map: Mapping,
    base: NonNull<u8>,
    capacity: u64,
    path: Option<PathBuf>,
    /// Serializes file table updates
    files_lock: Mutex<()>,
}

// SAFETY: all shared mutation goes through atomics in the mapping, through
// `files_lock`, or through entry payloads owned by exactly one writer until
// the entry is committed.
unsafe impl Send for PersistentRegion {}
unsafe impl Sync for PersistentRegion {}

impl PersistentRegion {
    /// Map the region at `path`, or anonymous memory when `path` is `None`.
    ///
    /// A missing or empty file is formatted. An existing region with another
    /// capacity is reformatted when it was shut down cleanly and rejected
    /// otherwise, since its pending entries could not be addressed.
    pub fn open(path: Option<&Path>, capacity: u64) -> Result<(Self, RegionState)> {
        if capacity < 2 {
            return Err(Error::configuration("a log needs at least 2 entries"));
        }
        let len = region_len(capacity);

        let Some(path) = path else {
            let map = MmapOptions::new().len(len).map_anon()?;
            let mut region = Self::from_map(Mapping::Shared(map), capacity, None);
            region.format();
            warn!("Persistent log is anonymous memory: writes will not survive a crash");
            return Ok((region, RegionState::Fresh));
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::storage(format!("failed to open region {}: {}", path.display(), e)))?;
        let metadata = file.metadata()?;
        let regular = metadata.file_type().is_file();
        let existing = if regular { metadata.len() } else { len as u64 };

        let mut stored = None;
        if existing >= HEADER_SIZE as u64 {
            // SAFETY: the file stays open for the duration of the read-only peek.
            let peek = unsafe { MmapOptions::new().len(HEADER_BYTES).map(&file)? };
            if peek.iter().any(|b| *b != 0) {
                stored = Some(RegionHeader::from_bytes(&peek)?);
            }
        }

        if let Some(header) = stored
            && regular
            && existing < region_len(header.capacity) as u64
        {
            return Err(Error::RegionCorrupt(format!(
                "region file holds {existing} bytes, header describes {}",
                region_len(header.capacity)
            )));
        }

        if let Some(header) = stored
            && header.capacity != capacity
        {
            let old = Self::map_private(&file, header.capacity, path)?;
            if let RegionState::Unclean { .. } = old.state() {
                return Err(Error::RegionMismatch {
                    expected: capacity,
                    found: header.capacity,
                });
            }
            warn!(
                "Reformatting clean region {:?}: capacity {} -> {}",
                path, header.capacity, capacity
            );
            stored = None;
        }

        if regular {
            if existing > len as u64 {
                file.set_len(len as u64)?;
            }
            preallocate(&file, len)?;
        }
        let mut region = Self::map_file(&file, capacity, path)?;

        let state = if stored.is_some() {
            region.state()
        } else {
            region.format();
            RegionState::Fresh
        };
        info!(
            "Opened persistent region {:?}: capacity={}, size={}, state={:?}",
            path, capacity, len, state
        );
        Ok((region, state))
    }

    /// Map an existing region for inspection.
    ///
    /// The file is opened read-only and mapped copy-on-write: it is neither
    /// resized nor reformatted, and stores through the returned region stay
    /// in process memory.
    pub fn open_read_only(path: &Path) -> Result<(Self, RegionState)> {
        let capacity = stored_capacity(path)?.ok_or_else(|| {
            Error::RegionCorrupt(format!("{} holds no region header", path.display()))
        })?;
        let file = File::open(path)
            .map_err(|e| Error::storage(format!("failed to open region {}: {}", path.display(), e)))?;
        let metadata = file.metadata()?;
        if metadata.file_type().is_file() && metadata.len() < region_len(capacity) as u64 {
            return Err(Error::RegionCorrupt(format!(
                "region file holds {} bytes, header describes {}",
                metadata.len(),
                region_len(capacity)
            )));
        }
        let region = Self::map_private(&file, capacity, path)?;
        let state = region.state();
        Ok((region, state))
    }

    fn map_file(file: &File, capacity: u64, path: &Path) -> Result<Self> {
        let len = region_len(capacity);
        let map = match map_synchronous(file, len) {
            Ok(map) => {
                debug!("Mapped {:?} with MAP_SYNC", path);
                map
            }
            Err(errno) => {
                warn!(
                    "Cannot map {:?} with MAP_SYNC ({}): falling back to a shared mapping",
                    path, errno
                );
                // SAFETY: the region file is owned by this process for its
                // lifetime; concurrent modification by other processes is not
                // supported.
                Mapping::Shared(unsafe { MmapOptions::new().len(len).map_mut(file)? })
            }
        };
        Ok(Self::from_map(map, capacity, Some(path.to_path_buf())))
    }

    fn map_private(file: &File, capacity: u64, path: &Path) -> Result<Self> {
        // SAFETY: private pages are copied on write, so the file is never
        // modified through this mapping.
        let map = unsafe { MmapOptions::new().len(region_len(capacity)).map_copy(file)? };
        Ok(Self::from_map(Mapping::Private(map), capacity, Some(path.to_path_buf())))
    }

    fn from_map(mut map: Mapping, capacity: u64, path: Option<PathBuf>) -> Self {
        let base = NonNull::new(map.as_mut_ptr()).unwrap_or_else(NonNull::dangling);
        Self {
            map,
            base,
            capacity,
            path,
            files_lock: Mutex::new(()),
        }
    }

    fn format(&mut self) {
        let header = RegionHeader::new(self.capacity).to_bytes();
        let meta_end = entries_offset();
        let bytes = self.map.as_mut_slice();
        bytes[..meta_end].fill(0);
        bytes[..HEADER_BYTES].copy_from_slice(&header);
        self.tail().store(self.capacity, Ordering::Release);
        // SAFETY: the range is inside the mapping.
        unsafe { write_back(self.base.as_ptr(), meta_end) };
        persist_fence();
    }

    /// Clean/unclean state derived from the persisted tail
    #[must_use]
    pub fn state(&self) -> RegionState {
        let tail = self.tail().load(Ordering::Acquire);
        if tail >= self.capacity {
            RegionState::Clean
        } else {
            RegionState::Unclean { tail }
        }
    }

    /// Number of entry slots
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tail value recorded by a clean shutdown
    #[must_use]
    pub const fn clean_marker(&self) -> u64 {
        self.capacity
    }

    /// Backing path, `None` for anonymous regions
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persisted tail index
    #[must_use]
    pub fn tail(&self) -> &AtomicU64 {
        // SAFETY: the tail line is inside the mapping, suitably aligned, and
        // zero bytes are a valid AtomicU64.
        unsafe { &*self.base.as_ptr().add(tail_offset()).cast::<AtomicU64>() }
    }

    /// Store and persist a new tail value
    pub fn set_tail(&self, tail: u64) {
        let cell = self.tail();
        cell.store(tail, Ordering::Release);
        // SAFETY: the tail is inside the mapping.
        unsafe { write_back(std::ptr::from_ref(cell).cast::<u8>(), size_of::<AtomicU64>()) };
        persist_fence();
    }

    fn entry_ptr(&self, index: u64) -> *mut u8 {
        assert!(index < self.capacity, "log index {index} out of range");
        // SAFETY: index < capacity keeps the pointer inside the mapping.
        unsafe {
            self.base
                .as_ptr()
                .add(entries_offset() + index as usize * ENTRY_STRIDE)
        }
    }

    /// Metadata of entry `index`
    #[must_use]
    pub fn entry(&self, index: u64) -> &EntryMeta {
        // SAFETY: entry_ptr is in bounds and 64-byte aligned (the mapping is
        // page aligned and every section is a multiple of 64 bytes); zero
        // bytes are valid for every atomic field.
        unsafe { &*self.entry_ptr(index).cast::<EntryMeta>() }
    }

    /// Write back the metadata line of entry `index`
    pub fn persist_entry_meta(&self, index: u64) {
        // SAFETY: the metadata line is inside the mapping.
        unsafe { write_back(self.entry_ptr(index), size_of::<EntryMeta>()) };
    }

    /// Durably copy `data` into the payload of entry `index`.
    ///
    /// # Safety
    ///
    /// The caller must own the slot: it was reserved by the caller and is
    /// not committed, so no other thread reads the payload.
    pub unsafe fn store_payload(&self, index: u64, data: &[u8]) {
        assert!(data.len() <= LOG_ENTRY_SIZE);
        // SAFETY: the payload area follows the metadata line and holds
        // LOG_ENTRY_SIZE bytes; exclusivity is guaranteed by the caller.
        unsafe {
            let dst = self.entry_ptr(index).add(size_of::<EntryMeta>());
            crate::persist::durable_store(dst, data);
        }
    }

    /// Payload of entry `index`, `len` bytes long.
    ///
    /// # Safety
    ///
    /// The entry must be committed and must stay allocated (not freed and
    /// reused) while the returned slice is alive.
    #[must_use]
    pub unsafe fn payload(&self, index: u64, len: usize) -> &[u8] {
        let len = len.min(LOG_ENTRY_SIZE);
        // SAFETY: in bounds; committed payloads are immutable until freed.
        unsafe { std::slice::from_raw_parts(self.entry_ptr(index).add(size_of::<EntryMeta>()), len) }
    }

    /// Return every entry slot to the empty state
    pub fn reset_entries(&self) {
        for index in 0..self.capacity {
            let meta = self.entry(index);
            meta.fd.store(NO_FD, Ordering::Relaxed);
            meta.generation.store(0, Ordering::Relaxed);
            meta.offset.store(0, Ordering::Relaxed);
            meta.size.store(0, Ordering::Relaxed);
            meta.group_len.store(0, Ordering::Relaxed);
            meta.waiting.store(self.capacity, Ordering::Relaxed);
            meta.written.store(0, Ordering::Relaxed);
            meta.committed.store(0, Ordering::Release);
            self.persist_entry_meta(index);
        }
        persist_fence();
    }

    fn file_slot(&self, fd: Fd) -> Result<*mut FileSlot> {
        if fd.index() >= MAX_FILES {
            return Err(Error::BadDescriptor(fd));
        }
        // SAFETY: in bounds of the file table section.
        Ok(unsafe {
            self.base
                .as_ptr()
                .add(file_table_offset() + fd.index() * size_of::<FileSlot>())
                .cast::<FileSlot>()
        })
    }

    /// Record `fd` as open on `path`, persisted for recovery
    pub fn set_file(&self, fd: Fd, path: &Path, flags: i32, mode: u32) -> Result<()> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.len() > MAX_PATH_LEN {
            return Err(Error::PathTooLong {
                path: path.display().to_string(),
                len: bytes.len(),
                max: MAX_PATH_LEN,
            });
        }
        let slot = self.file_slot(fd)?;
        let _guard = self.files_lock.lock();
        // SAFETY: slot is in bounds and file table writes are serialized by files_lock.
        unsafe {
            let slot = &mut *slot;
            slot.path = [0; MAX_PATH_LEN];
            slot.path[..bytes.len()].copy_from_slice(bytes);
            slot.path_len = bytes.len() as u32;
            slot.flags = flags;
            slot.mode = mode;
            slot.opened = 1;
            write_back(std::ptr::from_ref(slot).cast::<u8>(), size_of::<FileSlot>());
        }
        persist_fence();
        Ok(())
    }

    /// Forget `fd` in the persistent file table
    pub fn clear_file(&self, fd: Fd) -> Result<()> {
        let slot = self.file_slot(fd)?;
        let _guard = self.files_lock.lock();
        // SAFETY: as in set_file.
        unsafe {
            (*slot).opened = 0;
            write_back(slot.cast::<u8>(), size_of::<FileSlot>());
        }
        persist_fence();
        Ok(())
    }

    /// Files marked opened in the persistent file table
    #[must_use]
    pub fn opened_files(&self) -> Vec<(Fd, FileRecord)> {
        let _guard = self.files_lock.lock();
        let mut files = Vec::new();
        for index in 0..MAX_FILES {
            let fd = Fd::new(index as u32);
            let Ok(slot) = self.file_slot(fd) else {
                continue;
            };
            // SAFETY: in bounds, reads serialized with writers by files_lock.
            let slot = unsafe { &*slot };
            if slot.opened == 0 {
                continue;
            }
            let len = (slot.path_len as usize).min(MAX_PATH_LEN);
            let path = PathBuf::from(std::ffi::OsStr::from_bytes(&slot.path[..len]));
            files.push((
                fd,
                FileRecord {
                    path,
                    flags: slot.flags,
                    mode: slot.mode,
                },
            ));
        }
        files
    }

    /// Clear every opened flag
    pub fn clear_file_table(&self) {
        for (fd, _) in self.opened_files() {
            let _ = self.clear_file(fd);
        }
    }

    /// Mapped with `MAP_SYNC`, so `sync` is not needed for durability
    #[must_use]
    pub const fn is_synchronous(&self) -> bool {
        matches!(self.map, Mapping::Synchronous { .. })
    }

    /// Flush the mapping to its backing file
    pub fn sync(&self) -> Result<()> {
        if self.path.is_some() {
            self.map.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_alignment() {
        assert_eq!(size_of::<EntryMeta>(), 64);
        assert_eq!(size_of::<FileSlot>() % 64, 0);
        assert_eq!(ENTRY_STRIDE % 64, 0);
        assert_eq!(entries_offset() % 64, 0);
    }

    #[test]
    fn test_fresh_region_is_clean_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvlog");

        let (region, state) = PersistentRegion::open(Some(&path), 8).unwrap();
        assert_eq!(state, RegionState::Fresh);
        assert_eq!(region.state(), RegionState::Clean);
        region.set_tail(3);
        region.sync().unwrap();
        drop(region);

        let (region, state) = PersistentRegion::open(Some(&path), 8).unwrap();
        assert_eq!(state, RegionState::Unclean { tail: 3 });
        region.set_tail(region.clean_marker());
        drop(region);

        let (_, state) = PersistentRegion::open(Some(&path), 8).unwrap();
        assert_eq!(state, RegionState::Clean);
    }

    #[test]
    fn test_capacity_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvlog");

        let (region, _) = PersistentRegion::open(Some(&path), 8).unwrap();
        region.set_tail(1);
        drop(region);

        // Pending entries cannot be addressed with a different geometry.
        let err = PersistentRegion::open(Some(&path), 16).err().unwrap();
        assert!(matches!(err, Error::RegionMismatch { expected: 16, found: 8 }));

        let (region, _) = PersistentRegion::open(Some(&path), 8).unwrap();
        region.set_tail(region.clean_marker());
        drop(region);

        let (region, state) = PersistentRegion::open(Some(&path), 16).unwrap();
        assert_eq!(state, RegionState::Fresh);
        assert_eq!(region.capacity(), 16);
        drop(region);
        assert_eq!(stored_capacity(&path).unwrap(), Some(16));
    }

    #[test]
    fn test_stored_capacity_of_blank_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvlog");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(stored_capacity(&path).unwrap(), None);
        std::fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();
        assert_eq!(stored_capacity(&path).unwrap(), None);
        assert!(stored_capacity(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_region_file_is_preallocated() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("nvlog");
        let (region, _) = PersistentRegion::open(Some(&path), 8).unwrap();
        drop(region);

        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.len(), region_len(8) as u64);
        // Every block is allocated, not just the formatted metadata.
        assert!(metadata.blocks() * 512 >= region_len(8) as u64);
    }

    #[test]
    fn test_open_read_only_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvlog");
        let (region, _) = PersistentRegion::open(Some(&path), 8).unwrap();
        region.set_tail(5);
        region.sync().unwrap();
        drop(region);

        // Trailing bytes would be truncated by a read-write open.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 100]).unwrap();
        drop(file);
        let before = std::fs::read(&path).unwrap();

        let (region, state) = PersistentRegion::open_read_only(&path).unwrap();
        assert_eq!(state, RegionState::Unclean { tail: 5 });
        assert_eq!(region.capacity(), 8);
        assert!(!region.is_synchronous());
        region.set_tail(region.clean_marker());
        assert_eq!(region.state(), RegionState::Clean);
        region.sync().unwrap();
        drop(region);

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_open_read_only_rejects_blank_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let err = PersistentRegion::open_read_only(&path).err().unwrap();
        assert!(matches!(err, Error::RegionCorrupt(_)));
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 8192]);
    }

    #[test]
    fn test_corrupt_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvlog");
        std::fs::write(&path, vec![0xAB; HEADER_SIZE]).unwrap();
        let err = PersistentRegion::open(Some(&path), 8).err().unwrap();
        assert!(matches!(err, Error::RegionCorrupt(_)));
    }

    #[test]
    fn test_file_table() {
        let (region, _) = PersistentRegion::open(None, 4).unwrap();
        region
            .set_file(Fd::new(3), Path::new("/data/a.db"), libc::O_RDWR, 0o644)
            .unwrap();
        region
            .set_file(Fd::new(7), Path::new("/data/b.db"), libc::O_WRONLY, 0o600)
            .unwrap();
        region.clear_file(Fd::new(3)).unwrap();

        let files = region.opened_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, Fd::new(7));
        assert_eq!(files[0].1.path, PathBuf::from("/data/b.db"));
        assert_eq!(files[0].1.mode, 0o600);

        let long = "x".repeat(MAX_PATH_LEN + 1);
        assert!(matches!(
            region.set_file(Fd::new(1), Path::new(&long), 0, 0),
            Err(Error::PathTooLong { .. })
        ));
        assert!(region.set_file(Fd::new(MAX_FILES as u32), Path::new("/a"), 0, 0).is_err());
    }

    #[test]
    fn test_payload_round_trip() {
        let (region, _) = PersistentRegion::open(None, 4).unwrap();
        region.reset_entries();
        let data = vec![7u8; 1000];
        unsafe { region.store_payload(2, &data) };
        persist_fence();
        assert_eq!(unsafe { region.payload(2, 1000) }, &data[..]);
        assert_eq!(region.entry(2).waiting.load(Ordering::Relaxed), 4);
    }
}
