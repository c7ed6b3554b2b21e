//! Per-file radix index
//!
//! Maps page-aligned file offsets to cached pages. The page number
//! (`offset / PAGE_SIZE`) is consumed 8 bits at a time from the most
//! significant end, so every interior node and every leaf fans out to 256
//! children. Leaves carry, per slot, the cached page, a dirty level (how many
//! unflushed log entries cover the page) and a recursive lock.
//!
//! Nodes are never removed while the index is alive. A missing child is
//! installed with a compare-and-swap; the thread that loses the race hands
//! its allocation back to the arena free list.

#![allow(unsafe_code)]

use nvcache_common::{Error, Fd, PAGE_SIZE, Result};
use parking_lot::lock_api::RawReentrantMutex;
use parking_lot::{Mutex, RawMutex, RawThreadId, RwLock};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tracing::warn;

const FANOUT: usize = 256;
const LEVEL_BITS: u32 = 8;
const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();
/// File offsets are non-negative `off_t` values, so 63 bits are significant.
const KEY_BITS: u32 = 63 - PAGE_SHIFT;
/// Index levels, the last one selecting a slot inside a leaf
const LEVELS: u32 = KEY_BITS.div_ceil(LEVEL_BITS);

type SlotLock = RawReentrantMutex<RawMutex, RawThreadId>;

/// Handle of a page in the RAM cache pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u32);

impl PageId {
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    const fn encode(self) -> u32 {
        self.0 + 1
    }

    const fn decode(raw: u32) -> Option<Self> {
        match raw {
            0 => None,
            v => Some(Self(v - 1)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeId(u32);

/// Handle of a leaf, kept by cached pages for O(1) eviction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Child {
    Empty,
    Node(NodeId),
    Leaf(LeafId),
}

impl Child {
    const fn encode(self) -> u32 {
        match self {
            Self::Empty => 0,
            Self::Node(NodeId(id)) => (id + 1) << 1,
            Self::Leaf(LeafId(id)) => ((id + 1) << 1) | 1,
        }
    }

    const fn decode(raw: u32) -> Self {
        if raw == 0 {
            Self::Empty
        } else if raw & 1 == 1 {
            Self::Leaf(LeafId((raw >> 1) - 1))
        } else {
            Self::Node(NodeId((raw >> 1) - 1))
        }
    }
}

struct Node {
    children: [AtomicU32; FANOUT],
}

impl Node {
    fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

struct Leaf {
    pages: [AtomicU32; FANOUT],
    dirty: [AtomicI32; FANOUT],
    locks: [SlotLock; FANOUT],
}

impl Leaf {
    fn new() -> Self {
        Self {
            pages: std::array::from_fn(|_| AtomicU32::new(0)),
            dirty: std::array::from_fn(|_| AtomicI32::new(0)),
            locks: std::array::from_fn(|_| SlotLock::INIT),
        }
    }
}

/// Append-only storage for nodes and leaves, addressed by handle
#[derive(Default)]
struct Arena {
    nodes: RwLock<Vec<Arc<Node>>>,
    leaves: RwLock<Vec<Arc<Leaf>>>,
    free_nodes: Mutex<Vec<NodeId>>,
    free_leaves: Mutex<Vec<LeafId>>,
}

impl Arena {
    fn node(&self, id: NodeId) -> Arc<Node> {
        Arc::clone(&self.nodes.read()[id.0 as usize])
    }

    fn leaf(&self, id: LeafId) -> Arc<Leaf> {
        Arc::clone(&self.leaves.read()[id.0 as usize])
    }

    fn alloc_node(&self) -> NodeId {
        if let Some(id) = self.free_nodes.lock().pop() {
            return id;
        }
        let mut nodes = self.nodes.write();
        nodes.push(Arc::new(Node::new()));
        NodeId((nodes.len() - 1) as u32)
    }

    fn alloc_leaf(&self) -> LeafId {
        if let Some(id) = self.free_leaves.lock().pop() {
            return id;
        }
        let mut leaves = self.leaves.write();
        leaves.push(Arc::new(Leaf::new()));
        LeafId((leaves.len() - 1) as u32)
    }

    /// Return an allocation that was never published
    fn release(&self, child: Child) {
        match child {
            Child::Node(id) => {
                let mut free = self.free_nodes.lock();
                assert!(!free.contains(&id), "radix node {id:?} released twice");
                free.push(id);
            }
            Child::Leaf(id) => {
                let mut free = self.free_leaves.lock();
                assert!(!free.contains(&id), "radix leaf {id:?} released twice");
                free.push(id);
            }
            Child::Empty => {}
        }
    }
}

/// Result of [`RadixIndex::find`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lookup {
    /// Cached page at the offset, if any
    pub page: Option<PageId>,
    /// Dirty level of the slot, `-1` when no leaf covers the offset
    pub dirty: i32,
}

impl Lookup {
    const ABSENT: Self = Self {
        page: None,
        dirty: -1,
    };
}

/// Holds one recursive slot lock; released on drop.
///
/// Must be dropped on the thread that acquired it.
pub struct SlotGuard {
    leaf: Arc<Leaf>,
    slot: usize,
    _not_send: PhantomData<*const ()>,
}

impl SlotGuard {
    /// Release the lock
    pub fn unlock(self) {}
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // SAFETY: the guard only exists while this thread holds the lock,
        // and the guard is !Send.
        unsafe { self.leaf.locks[self.slot].unlock() };
    }
}

/// A set of slot locks covering a byte range, released in reverse order
/// of acquisition on drop.
#[derive(Default)]
pub struct RangeLock {
    guards: Vec<SlotGuard>,
}

impl RangeLock {
    pub(crate) fn push(&mut self, guard: SlotGuard) {
        self.guards.push(guard);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Radix index of one open file
pub struct RadixIndex {
    fd: Fd,
    generation: u32,
    root: NodeId,
    arena: Arena,
}

impl RadixIndex {
    /// Create an empty index for `fd`
    #[must_use]
    pub fn new(fd: Fd, generation: u32) -> Self {
        let arena = Arena::default();
        let root = arena.alloc_node();
        Self {
            fd,
            generation,
            root,
            arena,
        }
    }

    #[must_use]
    pub const fn fd(&self) -> Fd {
        self.fd
    }

    /// Generation of the descriptor this index was created for
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    const fn key(offset: u64) -> Option<u64> {
        let key = offset >> PAGE_SHIFT;
        if key >> KEY_BITS == 0 { Some(key) } else { None }
    }

    const fn index(key: u64, level: u32) -> usize {
        ((key >> ((LEVELS - 1 - level) * LEVEL_BITS)) & (FANOUT as u64 - 1)) as usize
    }

    const fn slot(key: u64) -> usize {
        Self::index(key, LEVELS - 1)
    }

    /// Walk to the leaf covering `key`, creating missing nodes when `create`
    fn descend(&self, key: u64, create: bool) -> Option<LeafId> {
        let mut node = self.arena.node(self.root);
        for level in 0..LEVELS - 1 {
            let cell = &node.children[Self::index(key, level)];
            let mut child = Child::decode(cell.load(Ordering::Acquire));
            if child == Child::Empty {
                if !create {
                    return None;
                }
                let fresh = if level == LEVELS - 2 {
                    Child::Leaf(self.arena.alloc_leaf())
                } else {
                    Child::Node(self.arena.alloc_node())
                };
                match cell.compare_exchange(0, fresh.encode(), Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => child = fresh,
                    Err(current) => {
                        self.arena.release(fresh);
                        child = Child::decode(current);
                    }
                }
            }
            match child {
                Child::Node(id) => node = self.arena.node(id),
                Child::Leaf(id) => return Some(id),
                Child::Empty => unreachable!("child installed above"),
            }
        }
        unreachable!("the level above the last always holds leaves")
    }

    fn leaf_for(&self, offset: u64, create: bool) -> Option<(Arc<Leaf>, LeafId, usize)> {
        let key = Self::key(offset)?;
        let id = self.descend(key, create)?;
        Some((self.arena.leaf(id), id, Self::slot(key)))
    }

    /// Bind `page` to the page-aligned `offset`
    pub fn insert(&self, offset: u64, page: PageId) -> Result<LeafId> {
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(Error::invalid_argument(format!(
                "radix insert at unaligned offset {offset}"
            )));
        }
        let (leaf, id, slot) = self
            .leaf_for(offset, true)
            .ok_or_else(|| Error::invalid_argument(format!("offset {offset} out of range")))?;
        leaf.pages[slot].store(page.encode(), Ordering::Release);
        Ok(id)
    }

    /// Look up the page and dirty level at a page-aligned offset
    #[must_use]
    pub fn find(&self, offset: u64) -> Lookup {
        if offset % PAGE_SIZE as u64 != 0 {
            warn!("Radix lookup at unaligned offset {} on fd {}", offset, self.fd);
            return Lookup::ABSENT;
        }
        match self.leaf_for(offset, false) {
            Some((leaf, _, slot)) => Lookup {
                page: PageId::decode(leaf.pages[slot].load(Ordering::Acquire)),
                dirty: leaf.dirty[slot].load(Ordering::Acquire),
            },
            None => Lookup::ABSENT,
        }
    }

    /// Raise the dirty level of the page containing `offset`, creating the
    /// path if needed. Returns the new level.
    pub fn increase_dirty(&self, offset: u64) -> Option<i32> {
        let (leaf, _, slot) = self.leaf_for(offset, true)?;
        Some(leaf.dirty[slot].fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Lower the dirty level of the page containing `offset`, never below
    /// zero. Returns the new level, `None` if nothing was lowered.
    pub fn decrease_dirty(&self, offset: u64) -> Option<i32> {
        let (leaf, _, slot) = self.leaf_for(offset, false)?;
        match leaf.dirty[slot].fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
            (d > 0).then(|| d - 1)
        }) {
            Ok(previous) => Some(previous - 1),
            Err(_) => {
                warn!(
                    "Dirty level underflow at offset {} on fd {}",
                    offset, self.fd
                );
                None
            }
        }
    }

    /// Block until the slot lock of the page containing `offset` is held
    pub fn lock(&self, offset: u64) -> Result<SlotGuard> {
        let (leaf, _, slot) = self
            .leaf_for(offset, true)
            .ok_or_else(|| Error::invalid_argument(format!("offset {offset} out of range")))?;
        leaf.locks[slot].lock();
        Ok(SlotGuard {
            leaf,
            slot,
            _not_send: PhantomData,
        })
    }

    /// Take the slot lock of the page containing `offset` if it is free or
    /// already held by this thread
    #[must_use]
    pub fn try_lock(&self, offset: u64) -> Option<SlotGuard> {
        let (leaf, _, slot) = self.leaf_for(offset, true)?;
        if !leaf.locks[slot].try_lock() {
            return None;
        }
        Some(SlotGuard {
            leaf,
            slot,
            _not_send: PhantomData,
        })
    }

    /// Remove `page` from the slot at `offset`, using the leaf handle kept by
    /// the page when available. Returns whether the slot still held `page`.
    pub fn evict(&self, offset: u64, page: PageId, leaf: Option<LeafId>) -> bool {
        let Some(key) = Self::key(offset) else {
            return false;
        };
        let leaf = match leaf {
            Some(id) => self.arena.leaf(id),
            None => match self.descend(key, false) {
                Some(id) => self.arena.leaf(id),
                None => return false,
            },
        };
        leaf.pages[Self::slot(key)]
            .compare_exchange(page.encode(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Number of leaves allocated, for diagnostics
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.arena.leaves.read().len() - self.arena.free_leaves.lock().len()
    }
}
