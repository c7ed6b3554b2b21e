//! NVCache Core - Persistent write log with a RAM page cache
//!
//! Writes are made durable by appending them to a log in persistent
//! memory, mirrored into a RAM page cache for reads, and drained to the
//! backing files in batches by a background thread.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  NvCache (fd-keyed facade)   │
//! └───────┬──────────────┬───────┘
//!    write│              │read
//! ┌───────▼───────┐ ┌────▼───────────────┐
//! │ NvLog         │ │ RamCache           │
//! │ - reserve     │◄┤ - second-chance LRU│
//! │ - commit      │ │ - RadixIndex / fd  │
//! │ - replay      │ └────────────────────┘
//! └───────┬───────┘
//!         │ flush_batch (Flusher thread)
//! ┌───────▼───────┐
//! │ Backing files │
//! └───────────────┘
//! ```
//!
//! A cache miss and a batch flush exclude each other through the log's
//! flush mutex, so a page is always loaded either before an entry reaches
//! its file (and replays it) or after (and reads it from the file).

pub mod engine;
pub mod files;
pub mod flusher;
pub mod nvlog;
pub mod persist;
pub mod radix;
pub mod ram_cache;
pub mod recovery;
pub mod region;

pub use engine::{EngineStats, FileStat, FlockOp, NvCache};
pub use files::{BackingFile, Cursor, FileTable};
pub use flusher::{FlushSettings, Flusher};
pub use nvlog::{LogStats, LogStatsSnapshot, NvLog, PageTracker, Untracked};
pub use radix::{Lookup, PageId, RadixIndex, RangeLock, SlotGuard};
pub use ram_cache::{CacheStats, CacheStatsSnapshot, PageState, RamCache};
pub use recovery::{PendingEntry, RecoveryReport, scan};
pub use region::{FileRecord, PersistentRegion, RegionState, region_len, stored_capacity};
