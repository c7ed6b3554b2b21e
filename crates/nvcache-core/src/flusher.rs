//! Background log drain
//!
//! One thread drains the persistent log in batches once enough entries are
//! pending, or right away when a writer is waiting for free slots. It is
//! pinned to a dedicated core and given a higher scheduling priority where
//! the platform allows.

use crate::nvlog::{NvLog, PageTracker};
use nvcache_common::{Error, NvCacheConfig, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Nice value requested for the flush thread
const FLUSH_NICE: i32 = -10;

/// Tuning of the drain loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    pub max_batch: usize,
    pub min_batch: usize,
    pub idle: Duration,
    pub core: Option<usize>,
}

impl From<&NvCacheConfig> for FlushSettings {
    fn from(config: &NvCacheConfig) -> Self {
        Self {
            max_batch: config.max_batch,
            min_batch: config.min_batch,
            idle: config.flush_idle,
            core: config.flush_core,
        }
    }
}

/// Handle of the running flush thread
pub struct Flusher {
    log: Arc<NvLog>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Flusher {
    /// Start draining `log`, reporting page state changes to `pages`
    pub fn spawn(log: Arc<NvLog>, pages: Arc<dyn PageTracker>, settings: FlushSettings) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let log = Arc::clone(&log);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("nvcache-flush".into())
                .spawn(move || run(&log, pages.as_ref(), settings, &shutdown))
                .map_err(|e| Error::internal(format!("failed to spawn flush thread: {e}")))?
        };
        log.attach_drainer(Some(handle.thread().clone()));
        Ok(Self {
            log,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the thread is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it. A full log becomes an error for
    /// writers from here on.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            error!("Flush thread panicked");
        }
        self.log.attach_drainer(None);
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(log: &NvLog, pages: &dyn PageTracker, settings: FlushSettings, shutdown: &AtomicBool) {
    if let Some(core) = settings.core {
        pin_to_core(core);
    }
    raise_priority();
    info!(
        "Flush thread started: batches of up to {} entries once more than {} are pending",
        settings.max_batch, settings.min_batch
    );

    while !shutdown.load(Ordering::Acquire) {
        if log.pending() > settings.min_batch as u64 || log.is_starved() {
            match log.flush_batch(pages, settings.max_batch) {
                Ok(0) => thread::yield_now(),
                Ok(n) => debug!("Flushed batch of {} entries", n),
                Err(e) => {
                    error!("Background log flush failed: {}", e);
                    thread::park_timeout(settings.idle);
                }
            }
        } else {
            thread::park_timeout(settings.idle);
        }
    }

    info!("Flush thread stopped");
}

fn pin_to_core(core: usize) {
    let Some(id) = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| id.id == core)
    else {
        warn!("Cannot pin flush thread: core {} not available", core);
        return;
    };
    if !core_affinity::set_for_current(id) {
        warn!("Failed to pin flush thread to core {}", core);
    }
}

#[cfg(target_os = "linux")]
fn raise_priority() {
    // On Linux a zero `who` with PRIO_PROCESS targets the calling thread.
    #[allow(unsafe_code)]
    // SAFETY: setpriority has no memory-safety preconditions.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, FLUSH_NICE) };
    if ret != 0 {
        warn!(
            "Cannot raise flush thread priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_priority() {
    let _ = FLUSH_NICE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{Cursor, FileTable};
    use crate::nvlog::Untracked;
    use std::time::Instant;
    use tempfile::tempdir;

    fn settings() -> FlushSettings {
        FlushSettings {
            max_batch: 4,
            min_batch: 0,
            idle: Duration::from_millis(1),
            core: None,
        }
    }

    #[test]
    fn test_flusher_frees_a_full_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let files = Arc::new(FileTable::new(4));
        let (log, _) = NvLog::open(None, 4, false, Arc::clone(&files)).unwrap();
        let log = Arc::new(log);
        let os_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let file = files.insert(os_file, path.clone(), libc::O_RDWR, Cursor::default()).unwrap();

        let flusher = Flusher::spawn(Arc::clone(&log), Arc::new(Untracked), settings()).unwrap();
        assert!(flusher.is_running());

        // Five times the log capacity: writers must wait for the drain.
        for i in 0..20u8 {
            log.add_entry(&Untracked, file.fd(), file.generation(), u64::from(i), &[i])
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while log.pending() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(log.pending(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), (0..20u8).collect::<Vec<_>>());

        flusher.stop();
        assert!(!flusher.is_running());
        for i in 0..3u64 {
            log.add_entry(&Untracked, file.fd(), file.generation(), i, b"x").unwrap();
        }
        assert!(matches!(
            log.add_entry(&Untracked, file.fd(), file.generation(), 0, b"x"),
            Err(Error::LogExhausted { .. })
        ));
    }

    #[test]
    fn test_idle_flusher_leaves_small_backlog() {
        let files = Arc::new(FileTable::new(4));
        let (log, _) = NvLog::open(None, 64, false, Arc::clone(&files)).unwrap();
        let log = Arc::new(log);
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let os_file = std::fs::File::create(&path).unwrap();
        let file = files.insert(os_file, path, libc::O_WRONLY, Cursor::default()).unwrap();

        let flusher = Flusher::spawn(
            Arc::clone(&log),
            Arc::new(Untracked),
            FlushSettings {
                min_batch: 8,
                ..settings()
            },
        )
        .unwrap();
        for i in 0..5u64 {
            log.add_entry(&Untracked, file.fd(), file.generation(), i, b"y").unwrap();
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(log.pending(), 5);
        drop(flusher);
        assert_eq!(log.pending(), 5);
    }
}
