//! Backing file table
//!
//! Every descriptor handed out by the engine maps to one open backing file
//! plus its cursor. Descriptors are the lowest free slot below `MAX_FILES`,
//! so they double as indexes into the persistent file table. A generation
//! number distinguishes successive files that reuse the same slot.

use nvcache_common::{AccessMode, Error, Fd, Result};
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Cursor state of a descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Position used by `read`/`write`
    pub pos: u64,
    /// Logical end of file, including writes still only in the log
    pub end: u64,
}

/// An open backing file
#[derive(Debug)]
pub struct BackingFile {
    fd: Fd,
    generation: u32,
    path: PathBuf,
    flags: i32,
    access: AccessMode,
    file: File,
    cursor: Mutex<Cursor>,
}

impl BackingFile {
    #[must_use]
    pub const fn fd(&self) -> Fd {
        self.fd
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn flags(&self) -> i32 {
        self.flags
    }

    #[must_use]
    pub const fn access(&self) -> AccessMode {
        self.access
    }

    /// The underlying OS file
    #[must_use]
    pub const fn file(&self) -> &File {
        &self.file
    }

    /// Per-descriptor metadata lock guarding the cursor
    pub fn cursor(&self) -> parking_lot::MutexGuard<'_, Cursor> {
        self.cursor.lock()
    }

    /// Read until `buf` is full or end of file, returning the byte count
    pub fn read_full_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    pub fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Descriptor-indexed table of open backing files
pub struct FileTable {
    slots: RwLock<Vec<Option<Arc<BackingFile>>>>,
    next_generation: AtomicU32,
}

impl FileTable {
    #[must_use]
    pub fn new(max_files: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; max_files]),
            next_generation: AtomicU32::new(1),
        }
    }

    /// Register an opened file under the lowest free descriptor
    pub fn insert(&self, file: File, path: PathBuf, flags: i32, cursor: Cursor) -> Result<Arc<BackingFile>> {
        let mut slots = self.slots.write();
        let max = slots.len();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyFiles { max })?;
        let backing = Arc::new(BackingFile {
            fd: Fd::new(index as u32),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            path,
            flags,
            access: AccessMode::from_flags(flags),
            file,
            cursor: Mutex::new(cursor),
        });
        slots[index] = Some(Arc::clone(&backing));
        Ok(backing)
    }

    /// The file open under `fd`
    pub fn get(&self, fd: Fd) -> Result<Arc<BackingFile>> {
        self.slots
            .read()
            .get(fd.index())
            .and_then(Clone::clone)
            .ok_or(Error::BadDescriptor(fd))
    }

    /// The file open under `fd`, only if it is still the same generation
    #[must_use]
    pub fn lookup(&self, fd: Fd, generation: u32) -> Option<Arc<BackingFile>> {
        self.get(fd).ok().filter(|f| f.generation == generation)
    }

    /// Release `fd`, returning the file that was open under it
    pub fn remove(&self, fd: Fd) -> Result<Arc<BackingFile>> {
        self.slots
            .write()
            .get_mut(fd.index())
            .and_then(Option::take)
            .ok_or(Error::BadDescriptor(fd))
    }

    /// Descriptor currently open on `path`
    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Option<Fd> {
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|f| f.path == path)
            .map(|f| f.fd)
    }

    /// Number of open descriptors
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }
}
