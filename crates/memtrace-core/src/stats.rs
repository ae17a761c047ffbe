//! Per-subsystem allocation statistics.
//!
//! One row per logical subsystem plus four aggregate rows at fixed slots:
//! global, heap-origin only, pool-origin only, and tracker-internal only.
//! Every tracked event updates exactly one origin aggregate, the global
//! aggregate, and its subsystem row, so the global live figures always equal
//! the sum of the three origin aggregates at any observation point.

use std::collections::HashMap;

/// Aggregate slot indices; subsystem rows start after these.
pub const SLOT_GLOBAL: usize = 0;
pub const SLOT_HEAP: usize = 1;
pub const SLOT_POOL: usize = 2;
pub const SLOT_INTERNAL: usize = 3;

/// Number of fixed aggregate rows.
pub const AGGREGATE_SLOTS: usize = 4;

/// Statistics for one slot (subsystem or aggregate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    pub name: String,
    pub live_count: u64,
    pub live_bytes: u64,
    pub ignored_count: u64,
    pub ignored_bytes: u64,
    /// Monotonically non-decreasing until shutdown.
    pub peak_bytes: u64,
    pub total_allocs: u64,
}

impl SlotStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            live_count: 0,
            live_bytes: 0,
            ignored_count: 0,
            ignored_bytes: 0,
            peak_bytes: 0,
            total_allocs: 0,
        }
    }

    /// Bytes considered leaked: live minus explicitly ignored.
    #[must_use]
    pub fn leaked_bytes(&self) -> u64 {
        self.live_bytes - self.ignored_bytes
    }

    /// Allocations considered leaked: live minus explicitly ignored.
    #[must_use]
    pub fn leaked_count(&self) -> u64 {
        self.live_count - self.ignored_count
    }
}

/// Statistics table: fixed aggregates plus lazily created subsystem rows.
pub struct StatsTable {
    slots: Vec<SlotStats>,
    by_tag: HashMap<u16, usize>,
}

impl StatsTable {
    /// Create a table holding only the four aggregate rows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![
                SlotStats::new("Global"),
                SlotStats::new("Heap"),
                SlotStats::new("Pool"),
                SlotStats::new("Internal"),
            ],
            by_tag: HashMap::new(),
        }
    }

    /// Slot index for a subsystem tag, creating its row on first sight.
    pub fn ensure_subsystem(&mut self, tag_id: u16, name: &str) -> usize {
        if let Some(&slot) = self.by_tag.get(&tag_id) {
            return slot;
        }
        let slot = self.slots.len();
        self.slots.push(SlotStats::new(name));
        self.by_tag.insert(tag_id, slot);
        slot
    }

    /// Fold an allocation of `bytes` into the global aggregate, the
    /// `origin` aggregate, and the subsystem row `slot`.
    pub fn record_alloc(&mut self, slot: usize, origin: usize, bytes: u64, ignored: bool) {
        debug_assert!(matches!(origin, SLOT_HEAP | SLOT_POOL | SLOT_INTERNAL));
        for idx in [SLOT_GLOBAL, origin, slot] {
            let row = &mut self.slots[idx];
            row.live_count += 1;
            row.live_bytes += bytes;
            row.total_allocs += 1;
            row.peak_bytes = row.peak_bytes.max(row.live_bytes);
            if ignored {
                row.ignored_count += 1;
                row.ignored_bytes += bytes;
            }
        }
    }

    /// Fold an allocation of `bytes` back out on free.
    ///
    /// Underflow here means the live table and statistics disagree, which is
    /// a structural corruption and fatal.
    pub fn record_free(&mut self, slot: usize, origin: usize, bytes: u64, ignored: bool) {
        for idx in [SLOT_GLOBAL, origin, slot] {
            let row = &mut self.slots[idx];
            assert!(
                row.live_count > 0 && row.live_bytes >= bytes,
                "statistics underflow on free in slot '{}'",
                row.name
            );
            row.live_count -= 1;
            row.live_bytes -= bytes;
            if ignored {
                row.ignored_count -= 1;
                row.ignored_bytes -= bytes;
            }
        }
    }

    /// All rows: aggregates first, then subsystems in creation order.
    #[must_use]
    pub fn slots(&self) -> &[SlotStats] {
        &self.slots
    }

    /// Owned copy of every row.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SlotStats> {
        self.slots.clone()
    }
}

impl Default for StatsTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_exist_up_front() {
        let t = StatsTable::new();
        assert_eq!(t.slots().len(), AGGREGATE_SLOTS);
        assert_eq!(t.slots()[SLOT_GLOBAL].name, "Global");
        assert_eq!(t.slots()[SLOT_INTERNAL].name, "Internal");
    }

    #[test]
    fn subsystem_rows_are_created_once() {
        let mut t = StatsTable::new();
        let a = t.ensure_subsystem(7, "render");
        let b = t.ensure_subsystem(9, "audio");
        let c = t.ensure_subsystem(7, "render");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(t.slots().len(), AGGREGATE_SLOTS + 2);
    }

    #[test]
    fn alloc_free_roundtrip_restores_rows() {
        let mut t = StatsTable::new();
        let slot = t.ensure_subsystem(1, "world");
        let before = t.snapshot();

        t.record_alloc(slot, SLOT_HEAP, 128, false);
        assert_eq!(t.slots()[SLOT_GLOBAL].live_bytes, 128);
        assert_eq!(t.slots()[SLOT_HEAP].live_bytes, 128);
        assert_eq!(t.slots()[slot].live_bytes, 128);
        assert_eq!(t.slots()[SLOT_POOL].live_bytes, 0);

        t.record_free(slot, SLOT_HEAP, 128, false);
        for (row, prev) in t.slots().iter().zip(&before) {
            assert_eq!(row.live_count, prev.live_count);
            assert_eq!(row.live_bytes, prev.live_bytes);
        }
    }

    #[test]
    fn peak_is_monotonic() {
        let mut t = StatsTable::new();
        let slot = t.ensure_subsystem(1, "world");
        t.record_alloc(slot, SLOT_HEAP, 100, false);
        t.record_alloc(slot, SLOT_HEAP, 50, false);
        assert_eq!(t.slots()[SLOT_GLOBAL].peak_bytes, 150);
        t.record_free(slot, SLOT_HEAP, 100, false);
        assert_eq!(t.slots()[SLOT_GLOBAL].peak_bytes, 150);
        t.record_alloc(slot, SLOT_HEAP, 20, false);
        assert_eq!(t.slots()[SLOT_GLOBAL].peak_bytes, 150);
        t.record_alloc(slot, SLOT_HEAP, 200, false);
        assert_eq!(t.slots()[SLOT_GLOBAL].peak_bytes, 270);
    }

    #[test]
    fn global_equals_sum_of_origins() {
        let mut t = StatsTable::new();
        let a = t.ensure_subsystem(1, "world");
        let b = t.ensure_subsystem(2, "render");
        t.record_alloc(a, SLOT_HEAP, 100, false);
        t.record_alloc(a, SLOT_POOL, 40, false);
        t.record_alloc(b, SLOT_INTERNAL, 7, false);
        t.record_alloc(b, SLOT_HEAP, 13, true);

        let s = t.slots();
        assert_eq!(
            s[SLOT_GLOBAL].live_bytes,
            s[SLOT_HEAP].live_bytes + s[SLOT_POOL].live_bytes + s[SLOT_INTERNAL].live_bytes
        );
        assert_eq!(
            s[SLOT_GLOBAL].live_count,
            s[SLOT_HEAP].live_count + s[SLOT_POOL].live_count + s[SLOT_INTERNAL].live_count
        );
    }

    #[test]
    fn ignored_tracked_separately_from_leaks() {
        let mut t = StatsTable::new();
        let slot = t.ensure_subsystem(1, "world");
        t.record_alloc(slot, SLOT_HEAP, 100, true);
        t.record_alloc(slot, SLOT_HEAP, 30, false);

        let row = &t.slots()[slot];
        assert_eq!(row.live_bytes, 130);
        assert_eq!(row.ignored_bytes, 100);
        assert_eq!(row.leaked_bytes(), 30);
        assert_eq!(row.leaked_count(), 1);
    }

    #[test]
    #[should_panic(expected = "statistics underflow")]
    fn free_without_alloc_is_fatal() {
        let mut t = StatsTable::new();
        let slot = t.ensure_subsystem(1, "world");
        t.record_free(slot, SLOT_HEAP, 64, false);
    }
}
