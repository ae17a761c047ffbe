//! Callsite record table: interned, deduplicated capture points.
//!
//! A callsite record is the canonical answer to "where did this happen": a
//! bounded number of shadow frames, optionally native frames from a pluggable
//! unwinder, and capture flags, serialized into one byte buffer. Identity and
//! hashing are computed over the exact byte span, making the record both a
//! value and its own key. Interned records are immutable, live in the arena
//! for the tracker's lifetime, and every event from the same site shares one
//! record.

use std::collections::HashMap;

use crate::arena::{ArenaRef, RecordArena};
use crate::hash::hash_bytes;
use crate::pool::BookkeepingAlloc;
use crate::pool_map::PooledMap;
use crate::strings::StringId;

/// How much native unwinding to perform per capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// Shadow frames only; no native walk.
    #[default]
    ShadowOnly,
    /// Bounded, cheap native walk.
    FastNative,
    /// Deep native walk; slow, for offline diagnosis runs.
    FullNative,
}

impl CaptureMode {
    /// Record flag bits; records captured under different modes never alias.
    #[must_use]
    pub fn flag_bits(self) -> u16 {
        match self {
            Self::ShadowOnly => 0,
            Self::FastNative => 1,
            Self::FullNative => 2,
        }
    }
}

/// A resolved native symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Pluggable native stack walker.
///
/// The core consumes this as a capability; the host decides whether a real
/// unwinder is available and affordable.
pub trait NativeUnwinder: Send + Sync {
    /// Return up to `max` return addresses, leaf first, skipping `skip`
    /// leading instrumentation frames.
    fn capture(&self, skip: usize, max: usize) -> Vec<usize>;

    /// Resolve one instruction address. Expensive; callers memoize.
    fn resolve(&self, addr: usize) -> Option<ResolvedSymbol>;
}

/// Unwinder used when native walking is unavailable or disabled.
#[derive(Debug, Default)]
pub struct NullUnwinder;

impl NativeUnwinder for NullUnwinder {
    fn capture(&self, _skip: usize, _max: usize) -> Vec<usize> {
        Vec::new()
    }

    fn resolve(&self, _addr: usize) -> Option<ResolvedSymbol> {
        None
    }
}

/// One shadow frame as serialized into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFrame {
    pub name: StringId,
    pub file: StringId,
    pub line: u32,
}

/// Bytes per serialized shadow frame: name id, file id, line.
const FRAME_BYTES: usize = 12;
/// Record header: shadow count, native count, flags.
const HEADER_BYTES: usize = 4;

/// Id of an interned callsite record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallsiteId(pub u32);

/// Per-record statistics, attached one-to-one with the interned record.
#[derive(Debug, Clone, Copy)]
pub struct CallsiteStats {
    pub alloc_count: u64,
    pub first_seen_ms: u64,
}

/// A decoded record, for reporting.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub frames: Vec<RecordFrame>,
    pub native: Vec<usize>,
    pub flags: u16,
}

struct RecordMeta {
    bytes: ArenaRef,
    stats: CallsiteStats,
}

/// Interning table over arena storage with a pool-backed hash index.
pub struct CallsiteTable {
    /// hash -> record id.
    index: PooledMap<u32>,
    records: Vec<RecordMeta>,
    arena: RecordArena,
    scratch: Vec<u8>,
}

impl CallsiteTable {
    /// Create an empty table whose records live in `arena_page_bytes` pages.
    #[must_use]
    pub fn new(arena_page_bytes: usize) -> Self {
        Self {
            index: PooledMap::new(),
            records: Vec::new(),
            arena: RecordArena::new(arena_page_bytes),
            scratch: Vec::new(),
        }
    }

    /// Intern a capture, returning the canonical record id.
    ///
    /// On a hash hit the existing record must match the candidate byte for
    /// byte; a mismatch means two genuinely different callsites collided on
    /// the 64-bit hash, which is fatal rather than silently merged.
    pub fn intern(
        &mut self,
        alloc: &mut BookkeepingAlloc,
        frames: &[RecordFrame],
        native: &[usize],
        flags: u16,
        now_ms: u64,
    ) -> CallsiteId {
        assert!(frames.len() <= u8::MAX as usize, "shadow frame count overflow");
        assert!(native.len() <= u8::MAX as usize, "native frame count overflow");

        self.scratch.clear();
        self.scratch.push(frames.len() as u8);
        self.scratch.push(native.len() as u8);
        self.scratch.extend_from_slice(&flags.to_le_bytes());
        for frame in frames {
            self.scratch.extend_from_slice(&frame.name.0.to_le_bytes());
            self.scratch.extend_from_slice(&frame.file.0.to_le_bytes());
            self.scratch.extend_from_slice(&frame.line.to_le_bytes());
        }
        for &addr in native {
            self.scratch.extend_from_slice(&(addr as u64).to_le_bytes());
        }

        let hash = hash_bytes(&self.scratch);
        if let Some(raw) = self.index.get(hash) {
            let id = CallsiteId(raw);
            let meta = &mut self.records[raw as usize];
            assert!(
                self.arena.get(meta.bytes) == self.scratch.as_slice(),
                "callsite record hash collision: two distinct records hash to {hash:#018x}"
            );
            meta.stats.alloc_count += 1;
            return id;
        }

        let bytes = self.arena.copy_in(&self.scratch);
        let raw = self.records.len() as u32;
        self.records.push(RecordMeta {
            bytes,
            stats: CallsiteStats {
                alloc_count: 1,
                first_seen_ms: now_ms,
            },
        });
        self.index.insert(alloc, hash, raw);
        CallsiteId(raw)
    }

    /// Decode an interned record.
    #[must_use]
    pub fn decode(&self, id: CallsiteId) -> DecodedRecord {
        let bytes = self.arena.get(self.records[id.0 as usize].bytes);
        let shadow_count = bytes[0] as usize;
        let native_count = bytes[1] as usize;
        let flags = u16::from_le_bytes([bytes[2], bytes[3]]);

        let mut frames = Vec::with_capacity(shadow_count);
        let mut at = HEADER_BYTES;
        for _ in 0..shadow_count {
            let name = u32::from_le_bytes(bytes[at..at + 4].try_into().expect("frame bytes"));
            let file = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().expect("frame bytes"));
            let line = u32::from_le_bytes(bytes[at + 8..at + 12].try_into().expect("frame bytes"));
            frames.push(RecordFrame {
                name: StringId(name),
                file: StringId(file),
                line,
            });
            at += FRAME_BYTES;
        }

        let mut native = Vec::with_capacity(native_count);
        for _ in 0..native_count {
            let addr = u64::from_le_bytes(bytes[at..at + 8].try_into().expect("native bytes"));
            native.push(addr as usize);
            at += 8;
        }

        DecodedRecord {
            frames,
            native,
            flags,
        }
    }

    /// Statistics for an interned record.
    #[must_use]
    pub fn stats(&self, id: CallsiteId) -> CallsiteStats {
        self.records[id.0 as usize].stats
    }

    /// Number of distinct interned records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids of every interned record.
    pub fn ids(&self) -> impl Iterator<Item = CallsiteId> + '_ {
        (0..self.records.len() as u32).map(CallsiteId)
    }

    /// Drop all records and index nodes. Used at shutdown only.
    pub fn release(&mut self, alloc: &mut BookkeepingAlloc) {
        self.index.clear(alloc);
        self.records.clear();
        self.arena.release_all();
    }
}

/// Address -> symbol memoization cache.
///
/// Symbol resolution is expensive; hot callsites would otherwise pay it on
/// every report. Negative results are memoized too.
pub struct SymbolCache {
    entries: HashMap<usize, Option<ResolvedSymbol>>,
    hits: u64,
    misses: u64,
}

impl SymbolCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Resolve through the cache.
    pub fn resolve(
        &mut self,
        unwinder: &dyn NativeUnwinder,
        addr: usize,
    ) -> Option<&ResolvedSymbol> {
        if self.entries.contains_key(&addr) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let resolved = unwinder.resolve(addr);
            self.entries.insert(addr, resolved);
        }
        self.entries[&addr].as_ref()
    }

    /// Cache hit count.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Cache miss count.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::SystemHeap;
    use crate::pool::PoolConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn alloc() -> BookkeepingAlloc {
        BookkeepingAlloc::new(PoolConfig::default(), Box::new(SystemHeap))
    }

    fn frame(name: u32, file: u32, line: u32) -> RecordFrame {
        RecordFrame {
            name: StringId(name),
            file: StringId(file),
            line,
        }
    }

    #[test]
    fn identical_captures_intern_once() {
        let mut a = alloc();
        let mut table = CallsiteTable::new(4096);
        let frames = [frame(0, 1, 10), frame(2, 1, 55)];

        let first = table.intern(&mut a, &frames, &[], 0, 1);
        let second = table.intern(&mut a, &frames, &[], 0, 9);
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);

        let stats = table.stats(first);
        assert_eq!(stats.alloc_count, 2);
        assert_eq!(stats.first_seen_ms, 1);
        table.release(&mut a);
    }

    #[test]
    fn different_lines_are_different_records() {
        let mut a = alloc();
        let mut table = CallsiteTable::new(4096);
        let x = table.intern(&mut a, &[frame(0, 1, 10)], &[], 0, 0);
        let y = table.intern(&mut a, &[frame(0, 1, 11)], &[], 0, 0);
        assert_ne!(x, y);
        assert_eq!(table.len(), 2);
        table.release(&mut a);
    }

    #[test]
    fn native_frames_and_flags_are_identity() {
        let mut a = alloc();
        let mut table = CallsiteTable::new(4096);
        let frames = [frame(0, 1, 10)];
        let base = table.intern(&mut a, &frames, &[], 0, 0);
        let with_native = table.intern(&mut a, &frames, &[0x4000, 0x4100], 0, 0);
        let with_flags = table.intern(&mut a, &frames, &[], 1, 0);
        assert_ne!(base, with_native);
        assert_ne!(base, with_flags);
        assert_ne!(with_native, with_flags);
        table.release(&mut a);
    }

    #[test]
    fn decode_roundtrip() {
        let mut a = alloc();
        let mut table = CallsiteTable::new(4096);
        let frames = [frame(3, 4, 100), frame(5, 4, 200)];
        let native = [0xAAAA_usize, 0xBBBB];
        let id = table.intern(&mut a, &frames, &native, 2, 0);

        let decoded = table.decode(id);
        assert_eq!(decoded.frames, frames);
        assert_eq!(decoded.native, native);
        assert_eq!(decoded.flags, 2);
        table.release(&mut a);
    }

    #[test]
    fn release_empties_table() {
        let mut a = alloc();
        let mut table = CallsiteTable::new(4096);
        table.intern(&mut a, &[frame(0, 0, 1)], &[], 0, 0);
        table.release(&mut a);
        assert!(table.is_empty());
        assert_eq!(a.live_chunks(32), 0);
    }

    struct CountingUnwinder {
        resolves: AtomicU64,
    }

    impl NativeUnwinder for CountingUnwinder {
        fn capture(&self, _skip: usize, _max: usize) -> Vec<usize> {
            vec![0x1000, 0x2000]
        }
        fn resolve(&self, addr: usize) -> Option<ResolvedSymbol> {
            self.resolves.fetch_add(1, Ordering::Relaxed);
            (addr != 0xDEAD).then(|| ResolvedSymbol {
                name: format!("fn_{addr:x}"),
                file: "lib.rs".to_string(),
                line: 1,
            })
        }
    }

    #[test]
    fn symbol_cache_memoizes_hits_and_misses() {
        let unwinder = CountingUnwinder {
            resolves: AtomicU64::new(0),
        };
        let mut cache = SymbolCache::new();

        assert_eq!(
            cache.resolve(&unwinder, 0x1000).map(|s| s.name.clone()),
            Some("fn_1000".to_string())
        );
        assert!(cache.resolve(&unwinder, 0xDEAD).is_none());
        // Repeats hit the cache, not the unwinder.
        cache.resolve(&unwinder, 0x1000);
        cache.resolve(&unwinder, 0xDEAD);
        assert_eq!(unwinder.resolves.load(Ordering::Relaxed), 2);
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 2);
    }
}
