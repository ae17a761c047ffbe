//! Tracker context: the process-wide instrumentation entry point.
//!
//! One explicitly constructed [`MemTracker`] owns every cross-thread table:
//! the live allocation table, callsite record table, string interner,
//! statistics, and the bookkeeping allocator behind them. All of it sits
//! under a single mutex held for the duration of each tracked call, so the
//! live table and statistics are always mutually consistent at any
//! observation point taken outside the lock. Shadow-stack capture happens
//! before the lock is taken; it is thread-local and needs no serialization.
//!
//! Re-entrancy is prevented by a thread-local flag, not recursive locking:
//! any allocation the tracker makes while servicing a tracked event is
//! excluded from tracking.

use std::cell::Cell;
use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::callsite::{
    CallsiteId, CallsiteStats, CallsiteTable, CaptureMode, DecodedRecord, NativeUnwinder,
    NullUnwinder, RecordFrame, ResolvedSymbol, SymbolCache,
};
use crate::config::TrackerConfig;
use crate::heap::{HeapSource, SystemHeap};
use crate::live::{origin_slot, FLAG_LEAK_IGNORED, FLAG_PRE_INIT, LiveEntry, LiveTable};
use crate::pool::BookkeepingAlloc;
use crate::shadow::{FrameInfo, with_shadow};
use crate::stats::{SlotStats, StatsTable};
use crate::strings::{Interner, StringId};

/// Coarse process phase, pushed by the host and used only to classify
/// allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreInit,
    Running,
}

/// Opaque subsystem id/name pair used to bucket statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemTag {
    pub id: u16,
    pub name: &'static str,
}

/// Host-supplied thread-to-subsystem resolver.
pub trait SubsystemResolver: Send + Sync {
    /// Tag for the calling thread.
    fn current(&self) -> SubsystemTag;
}

/// Resolver for hosts without subsystem partitioning.
#[derive(Debug, Default)]
pub struct SingleSubsystem;

impl SubsystemResolver for SingleSubsystem {
    fn current(&self) -> SubsystemTag {
        SubsystemTag { id: 0, name: "main" }
    }
}

/// Most recent owner of a tracked ownership handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub target: usize,
    pub callsite: CallsiteId,
}

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
    static IGNORE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the calling thread as inside the tracker until dropped.
struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        IN_TRACKER.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_TRACKER.with(|flag| flag.set(false));
    }
}

/// Every cross-thread table, guarded together by one mutex.
struct TrackerInner {
    alloc: BookkeepingAlloc,
    strings: Interner,
    callsites: CallsiteTable,
    live: LiveTable,
    stats: StatsTable,
    symbols: SymbolCache,
    /// handle address -> most recent assignment.
    assignments: HashMap<usize, AssignmentRecord>,
    next_id: u64,
    phase: Phase,
    shut_down: bool,
}

/// The instrumentation context. Construct once, shut down once.
pub struct MemTracker {
    inner: Mutex<TrackerInner>,
    config: TrackerConfig,
    unwinder: Box<dyn NativeUnwinder>,
    resolver: Box<dyn SubsystemResolver>,
    epoch: Instant,
}

impl MemTracker {
    /// Construct a tracker. The heap source backs the bookkeeping pools and
    /// must never be the globally tracked allocator.
    pub fn new(
        config: TrackerConfig,
        heap: Box<dyn HeapSource>,
        unwinder: Box<dyn NativeUnwinder>,
        resolver: Box<dyn SubsystemResolver>,
    ) -> Self {
        if let Err(msg) = config.validate() {
            panic!("invalid tracker configuration: {msg}");
        }
        let alloc = BookkeepingAlloc::new(config.pool.clone(), heap);
        let callsites = CallsiteTable::new(config.arena_page_bytes);
        tracing::debug!(mode = ?config.capture_mode, "tracker initialized");
        Self {
            inner: Mutex::new(TrackerInner {
                alloc,
                strings: Interner::new(),
                callsites,
                live: LiveTable::new(),
                stats: StatsTable::new(),
                symbols: SymbolCache::new(),
                assignments: HashMap::new(),
                next_id: 1,
                phase: Phase::PreInit,
                shut_down: false,
            }),
            config,
            unwinder,
            resolver,
            epoch: Instant::now(),
        }
    }

    /// Tracker with the default configuration, system heap, no native
    /// unwinder, and a single "main" subsystem.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            TrackerConfig::default(),
            Box::new(SystemHeap),
            Box::new(NullUnwinder),
            Box::new(SingleSubsystem),
        )
    }

    /// Construction-time configuration.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Advance the process phase.
    pub fn set_phase(&self, phase: Phase) {
        let mut inner = self.inner.lock();
        inner.phase = phase;
        tracing::debug!(?phase, "tracker phase changed");
    }

    /// Current process phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Track one allocation.
    ///
    /// `ptr` is the address handed to the application, `size_used` the bytes
    /// actually consumed, `size_requested` what the caller asked for, and
    /// `flags` any origin bits the caller already knows (pool origin,
    /// internal). Phase and ignore-scope bits are derived here. Calls made
    /// while the tracker is already servicing an event on this thread are
    /// excluded from tracking.
    pub fn allocate(&self, ptr: usize, size_used: usize, size_requested: usize, flags: u16) {
        debug_assert!(size_used >= size_requested);
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };

        let (frames, native) = self.capture();
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let tag = self.resolver.current();

        let inner = &mut *self.inner.lock();
        assert!(!inner.shut_down, "tracker used after shutdown");

        let mut flags = flags;
        if inner.phase == Phase::PreInit {
            flags |= FLAG_PRE_INIT;
        }
        if IGNORE_DEPTH.with(Cell::get) > 0 {
            flags |= FLAG_LEAK_IGNORED;
        }

        let record_frames = intern_frames(&mut inner.strings, &frames);
        let callsite = inner.callsites.intern(
            &mut inner.alloc,
            &record_frames,
            &native,
            self.config.capture_mode.flag_bits(),
            now_ms,
        );

        let slot = inner.stats.ensure_subsystem(tag.id, tag.name);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(
            &mut inner.alloc,
            ptr,
            LiveEntry {
                flags,
                slot: slot as u32,
                size: size_used as u64,
                id,
                callsite,
            },
        );
        inner.stats.record_alloc(
            slot,
            origin_slot(flags),
            size_used as u64,
            flags & FLAG_LEAK_IGNORED != 0,
        );
        tracing::trace!(ptr = format_args!("{ptr:#x}"), size_used, "tracked alloc");
    }

    /// Track one deallocation. Fatal if `ptr` was never tracked.
    pub fn deallocate(&self, ptr: usize) {
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };

        let inner = &mut *self.inner.lock();
        assert!(!inner.shut_down, "tracker used after shutdown");

        let entry = inner.live.remove(&mut inner.alloc, ptr);
        inner.stats.record_free(
            entry.slot as usize,
            origin_slot(entry.flags),
            entry.size,
            entry.is_ignored(),
        );
        tracing::trace!(ptr = format_args!("{ptr:#x}"), size = entry.size, "tracked free");
    }

    /// Begin a per-thread scope in which allocations are flagged
    /// leak-ignored. Scopes nest.
    pub fn begin_ignore_leaks(&self) {
        IGNORE_DEPTH.with(|d| d.set(d.get() + 1));
    }

    /// End the innermost ignore scope. Fatal without a matching begin.
    pub fn end_ignore_leaks(&self) {
        IGNORE_DEPTH.with(|d| {
            assert!(d.get() > 0, "ignore-leaks scope underflow");
            d.set(d.get() - 1);
        });
    }

    /// RAII ignore scope for the calling thread.
    pub fn ignore_leaks(&self) -> IgnoreLeaksGuard<'_> {
        self.begin_ignore_leaks();
        IgnoreLeaksGuard {
            tracker: self,
            _not_send: std::marker::PhantomData,
        }
    }

    /// Record the most recent assignment of an ownership handle. A `None`
    /// target clears the handle's record.
    pub fn track_assignment(&self, handle: usize, target: Option<usize>) {
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };

        let (frames, native) = self.capture();
        let now_ms = self.epoch.elapsed().as_millis() as u64;

        let inner = &mut *self.inner.lock();
        assert!(!inner.shut_down, "tracker used after shutdown");

        let Some(target) = target else {
            inner.assignments.remove(&handle);
            return;
        };
        let record_frames = intern_frames(&mut inner.strings, &frames);
        let callsite = inner.callsites.intern(
            &mut inner.alloc,
            &record_frames,
            &native,
            self.config.capture_mode.flag_bits(),
            now_ms,
        );
        inner
            .assignments
            .insert(handle, AssignmentRecord { target, callsite });
    }

    /// Handles whose most recent assignment points at `target`.
    #[must_use]
    pub fn holders_of(&self, target: usize) -> Vec<(usize, AssignmentRecord)> {
        let inner = self.inner.lock();
        let mut holders: Vec<(usize, AssignmentRecord)> = inner
            .assignments
            .iter()
            .filter(|(_, rec)| rec.target == target)
            .map(|(&h, &rec)| (h, rec))
            .collect();
        holders.sort_unstable_by_key(|&(h, _)| h);
        holders
    }

    /// Owned copy of every assignment record, sorted by handle address.
    #[must_use]
    pub fn assignments_snapshot(&self) -> Vec<(usize, AssignmentRecord)> {
        let inner = self.inner.lock();
        let mut out: Vec<(usize, AssignmentRecord)> =
            inner.assignments.iter().map(|(&h, &r)| (h, r)).collect();
        out.sort_unstable_by_key(|&(h, _)| h);
        out
    }

    /// Owned copy of every statistics row.
    #[must_use]
    pub fn stats_snapshot(&self) -> Vec<SlotStats> {
        self.inner.lock().stats.snapshot()
    }

    /// Owned copy of every live allocation, sorted by allocation id.
    #[must_use]
    pub fn live_snapshot(&self) -> Vec<(usize, LiveEntry)> {
        let inner = self.inner.lock();
        let mut out: Vec<(usize, LiveEntry)> = inner.live.iter().collect();
        out.sort_unstable_by_key(|&(_, e)| e.id);
        out
    }

    /// Number of outstanding allocations.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Number of distinct interned callsites.
    #[must_use]
    pub fn callsite_count(&self) -> usize {
        self.inner.lock().callsites.len()
    }

    /// Decode an interned callsite record.
    #[must_use]
    pub fn decode_callsite(&self, id: CallsiteId) -> DecodedRecord {
        self.inner.lock().callsites.decode(id)
    }

    /// Statistics attached to an interned callsite.
    #[must_use]
    pub fn callsite_stats(&self, id: CallsiteId) -> CallsiteStats {
        self.inner.lock().callsites.stats(id)
    }

    /// Resolve an interned string to an owned copy.
    #[must_use]
    pub fn resolve_string(&self, id: StringId) -> String {
        self.inner.lock().strings.resolve(id).to_string()
    }

    /// Resolve a native address through the memoizing symbol cache.
    #[must_use]
    pub fn resolve_symbol(&self, addr: usize) -> Option<ResolvedSymbol> {
        let mut inner = self.inner.lock();
        inner.symbols.resolve(&*self.unwinder, addr).cloned()
    }

    /// Human-readable chain for a callsite, leaf first:
    /// `leaf (file:line) <- caller (file:line)`, native addresses appended.
    #[must_use]
    pub fn render_callsite(&self, id: CallsiteId) -> String {
        let inner = self.inner.lock();
        let record = inner.callsites.decode(id);
        let mut out = String::new();
        for (i, frame) in record.frames.iter().enumerate() {
            if i > 0 {
                out.push_str(" <- ");
            }
            out.push_str(&format!(
                "{} ({}:{})",
                inner.strings.resolve(frame.name),
                inner.strings.resolve(frame.file),
                frame.line
            ));
        }
        for addr in &record.native {
            if !out.is_empty() {
                out.push_str(" <- ");
            }
            out.push_str(&format!("{addr:#x}"));
        }
        if out.is_empty() {
            out.push_str("<no frames captured>");
        }
        out
    }

    /// Tear down the tracker, releasing every table. Entries still live at
    /// this point are leaks; report before shutting down. Fatal if called
    /// twice.
    pub fn shutdown(&self) {
        let inner = &mut *self.inner.lock();
        assert!(!inner.shut_down, "tracker shutdown called twice");
        inner.shut_down = true;

        let leaked = inner.live.len();
        inner.live.release(&mut inner.alloc);
        inner.callsites.release(&mut inner.alloc);
        inner.assignments.clear();
        tracing::debug!(
            leaked,
            pools_created = inner.alloc.pools_created(),
            pools_released = inner.alloc.pools_released(),
            "tracker shut down"
        );
    }

    /// True once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Capture shadow (and optionally native) frames for the current thread.
    /// Runs before the tracker mutex is taken.
    fn capture(&self) -> (Vec<FrameInfo>, Vec<usize>) {
        let frames = with_shadow(|stack| stack.top_frames(self.config.shadow_depth));
        let native = match self.config.capture_mode {
            CaptureMode::ShadowOnly => Vec::new(),
            CaptureMode::FastNative => self
                .unwinder
                .capture(self.config.native_skip, self.config.fast_native_depth),
            CaptureMode::FullNative => self
                .unwinder
                .capture(self.config.native_skip, self.config.full_native_depth),
        };
        (frames, native)
    }
}

fn intern_frames(strings: &mut Interner, frames: &[FrameInfo]) -> Vec<RecordFrame> {
    frames
        .iter()
        .map(|f| RecordFrame {
            name: strings.intern(f.name),
            file: strings.intern(f.file),
            line: f.line,
        })
        .collect()
}

/// Ends the ignore-leaks scope on drop. Thread-bound.
pub struct IgnoreLeaksGuard<'a> {
    tracker: &'a MemTracker,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for IgnoreLeaksGuard<'_> {
    fn drop(&mut self) {
        self.tracker.end_ignore_leaks();
    }
}
