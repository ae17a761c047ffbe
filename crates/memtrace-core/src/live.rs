//! Live allocation table: ground truth of outstanding allocations.
//!
//! Keyed by the live pointer, each entry carries the origin flags, subsystem
//! slot, size, a unique id, and the callsite record the allocation came from.
//! Entries live in pool chunks via [`PooledMap`], so tracking an allocation
//! never touches the tracked allocator itself.

use crate::callsite::CallsiteId;
use crate::pool::BookkeepingAlloc;
use crate::pool_map::PooledMap;
use crate::stats::{SLOT_HEAP, SLOT_INTERNAL, SLOT_POOL};

/// Allocation happened before the host signalled normal execution.
pub const FLAG_PRE_INIT: u16 = 1;
/// Allocation was served from a pooled (non-heap) source.
pub const FLAG_POOL_ORIGIN: u16 = 2;
/// Allocation belongs to the tracker's own bookkeeping.
pub const FLAG_INTERNAL: u16 = 4;
/// Allocation is intentionally long-lived and excluded from leak counts.
pub const FLAG_LEAK_IGNORED: u16 = 8;

/// Origin aggregate slot implied by an entry's flags.
#[must_use]
pub fn origin_slot(flags: u16) -> usize {
    if flags & FLAG_INTERNAL != 0 {
        SLOT_INTERNAL
    } else if flags & FLAG_POOL_ORIGIN != 0 {
        SLOT_POOL
    } else {
        SLOT_HEAP
    }
}

/// One outstanding allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveEntry {
    pub flags: u16,
    /// Statistics slot of the owning subsystem.
    pub slot: u32,
    pub size: u64,
    /// Monotonic id assigned at allocation, for stable report ordering.
    pub id: u64,
    pub callsite: CallsiteId,
}

impl LiveEntry {
    /// True when leak reporting must skip this entry.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.flags & FLAG_LEAK_IGNORED != 0
    }

    /// True when the allocation predates normal execution.
    #[must_use]
    pub fn is_pre_init(&self) -> bool {
        self.flags & FLAG_PRE_INIT != 0
    }
}

/// Pointer-keyed table of live allocations.
pub struct LiveTable {
    entries: PooledMap<LiveEntry>,
}

impl LiveTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: PooledMap::new(),
        }
    }

    /// Track `ptr`. Two live entries for one pointer can only mean the
    /// tracked allocator handed out the same address twice, so this is fatal.
    pub fn insert(&mut self, alloc: &mut BookkeepingAlloc, ptr: usize, entry: LiveEntry) {
        let previous = self.entries.insert(alloc, ptr as u64, entry);
        assert!(
            previous.is_none(),
            "pointer {ptr:#x} already tracked (allocator returned a live address)"
        );
    }

    /// Untrack `ptr`, returning its entry. A free of a pointer this table
    /// never saw is a double free or a foreign pointer and is fatal.
    pub fn remove(&mut self, alloc: &mut BookkeepingAlloc, ptr: usize) -> LiveEntry {
        self.entries
            .remove(alloc, ptr as u64)
            .unwrap_or_else(|| panic!("allocation record mismatch on free: {ptr:#x}"))
    }

    /// Entry for `ptr`, if tracked.
    #[must_use]
    pub fn get(&self, ptr: usize) -> Option<LiveEntry> {
        self.entries.get(ptr as u64)
    }

    /// True if `ptr` is tracked.
    #[must_use]
    pub fn contains(&self, ptr: usize) -> bool {
        self.entries.contains_key(ptr as u64)
    }

    /// Number of outstanding allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(ptr, entry)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, LiveEntry)> + '_ {
        self.entries.iter().map(|(k, v)| (k as usize, v))
    }

    /// Return every node chunk to the pool. Used at shutdown only.
    pub fn release(&mut self, alloc: &mut BookkeepingAlloc) {
        self.entries.clear(alloc);
    }
}

impl Default for LiveTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::SystemHeap;
    use crate::pool::PoolConfig;

    fn alloc() -> BookkeepingAlloc {
        BookkeepingAlloc::new(PoolConfig::default(), Box::new(SystemHeap))
    }

    fn entry(size: u64, flags: u16) -> LiveEntry {
        LiveEntry {
            flags,
            slot: 4,
            size,
            id: 1,
            callsite: CallsiteId(0),
        }
    }

    #[test]
    fn allocate_then_deallocate_leaves_no_trace() {
        let mut a = alloc();
        let mut table = LiveTable::new();
        table.insert(&mut a, 0x1000, entry(64, 0));
        assert!(table.contains(0x1000));
        assert_eq!(table.len(), 1);

        let removed = table.remove(&mut a, 0x1000);
        assert_eq!(removed.size, 64);
        assert!(!table.contains(0x1000));
        assert!(table.is_empty());
    }

    #[test]
    #[should_panic(expected = "allocation record mismatch on free")]
    fn untracked_free_is_fatal() {
        let mut a = alloc();
        let mut table = LiveTable::new();
        table.remove(&mut a, 0xBAD0);
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn double_insert_is_fatal() {
        let mut a = alloc();
        let mut table = LiveTable::new();
        table.insert(&mut a, 0x2000, entry(16, 0));
        table.insert(&mut a, 0x2000, entry(32, 0));
    }

    #[test]
    fn flags_classify_origin() {
        assert_eq!(origin_slot(0), SLOT_HEAP);
        assert_eq!(origin_slot(FLAG_PRE_INIT), SLOT_HEAP);
        assert_eq!(origin_slot(FLAG_POOL_ORIGIN), SLOT_POOL);
        assert_eq!(origin_slot(FLAG_INTERNAL), SLOT_INTERNAL);
        // Internal wins over pool origin.
        assert_eq!(origin_slot(FLAG_INTERNAL | FLAG_POOL_ORIGIN), SLOT_INTERNAL);

        let e = entry(8, FLAG_LEAK_IGNORED | FLAG_PRE_INIT);
        assert!(e.is_ignored());
        assert!(e.is_pre_init());
    }

    #[test]
    fn many_entries_survive_growth_and_release() {
        let mut a = alloc();
        let mut table = LiveTable::new();
        for i in 0..500usize {
            table.insert(&mut a, 0x10_0000 + i * 16, entry(i as u64, 0));
        }
        assert_eq!(table.len(), 500);
        for i in (0..500usize).step_by(2) {
            let e = table.remove(&mut a, 0x10_0000 + i * 16);
            assert_eq!(e.size, i as u64);
        }
        assert_eq!(table.len(), 250);
        assert_eq!(table.iter().count(), 250);

        table.release(&mut a);
        assert!(table.is_empty());
    }
}
