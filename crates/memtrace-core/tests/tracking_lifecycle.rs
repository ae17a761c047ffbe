//! Cross-module lifecycle tests driving the tracker through its public API.

use std::cell::Cell;

use memtrace_core::heap::SystemHeap;
use memtrace_core::live::{FLAG_INTERNAL, FLAG_POOL_ORIGIN};
use memtrace_core::shadow::ShadowFrameGuard;
use memtrace_core::stats::{SLOT_GLOBAL, SLOT_HEAP, SLOT_INTERNAL, SLOT_POOL};
use memtrace_core::tracker::{MemTracker, Phase, SubsystemResolver, SubsystemTag};
use memtrace_core::{NullUnwinder, TrackerConfig};

thread_local! {
    static TAG: Cell<SubsystemTag> = const { Cell::new(SubsystemTag { id: 0, name: "main" }) };
}

struct ThreadTag;

impl SubsystemResolver for ThreadTag {
    fn current(&self) -> SubsystemTag {
        TAG.with(Cell::get)
    }
}

fn tracker_with_thread_tags() -> MemTracker {
    MemTracker::new(
        TrackerConfig::default(),
        Box::new(SystemHeap),
        Box::new(NullUnwinder),
        Box::new(ThreadTag),
    )
}

#[test]
fn subsystem_rows_follow_the_resolver() {
    let tracker = tracker_with_thread_tags();
    tracker.set_phase(Phase::Running);

    TAG.with(|t| t.set(SubsystemTag { id: 1, name: "world" }));
    tracker.allocate(0x1000, 100, 100, 0);
    TAG.with(|t| t.set(SubsystemTag { id: 2, name: "render" }));
    tracker.allocate(0x2000, 50, 50, 0);
    tracker.allocate(0x3000, 25, 25, 0);

    let stats = tracker.stats_snapshot();
    let world = stats.iter().find(|s| s.name == "world").expect("world row");
    let render = stats.iter().find(|s| s.name == "render").expect("render row");
    assert_eq!(world.live_bytes, 100);
    assert_eq!(world.live_count, 1);
    assert_eq!(render.live_bytes, 75);
    assert_eq!(render.live_count, 2);
    tracker.shutdown();
}

#[test]
fn global_aggregate_balances_across_origins() {
    let tracker = tracker_with_thread_tags();
    tracker.set_phase(Phase::Running);

    tracker.allocate(0x1000, 100, 100, 0);
    tracker.allocate(0x2000, 40, 40, FLAG_POOL_ORIGIN);
    tracker.allocate(0x3000, 7, 7, FLAG_INTERNAL);
    tracker.deallocate(0x2000);
    tracker.allocate(0x4000, 13, 13, FLAG_POOL_ORIGIN);

    let s = tracker.stats_snapshot();
    assert_eq!(
        s[SLOT_GLOBAL].live_bytes,
        s[SLOT_HEAP].live_bytes + s[SLOT_POOL].live_bytes + s[SLOT_INTERNAL].live_bytes
    );
    assert_eq!(s[SLOT_POOL].live_bytes, 13);
    assert_eq!(s[SLOT_GLOBAL].live_bytes, 120);
    tracker.shutdown();
}

#[test]
fn callsites_deduplicate_across_threads() {
    use std::sync::Arc;

    let tracker = Arc::new(tracker_with_thread_tags());
    tracker.set_phase(Phase::Running);

    let mut handles = Vec::new();
    for t in 0..4usize {
        let tracker = Arc::clone(&tracker);
        handles.push(std::thread::spawn(move || {
            // Identical frame identity on every thread: one interned record.
            let _f = ShadowFrameGuard::enter("shared_site", "shared.rs", 7, false);
            for i in 0..50usize {
                tracker.allocate(0x10_0000 * (t + 1) + i * 16, 32, 32, 0);
            }
        }));
    }
    for h in handles {
        h.join().expect("worker");
    }

    assert_eq!(tracker.callsite_count(), 1);
    let (_, entry) = tracker.live_snapshot()[0];
    assert_eq!(tracker.callsite_stats(entry.callsite).alloc_count, 200);
    tracker.shutdown();
}

#[test]
fn live_snapshot_orders_by_allocation_id() {
    let tracker = tracker_with_thread_tags();
    tracker.set_phase(Phase::Running);
    for i in 0..10usize {
        tracker.allocate(0x9000 + i * 16, 8, 8, 0);
    }
    let ids: Vec<u64> = tracker.live_snapshot().iter().map(|(_, e)| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    tracker.shutdown();
}
