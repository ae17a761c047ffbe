//! # memtrace-core
//!
//! Runtime memory-allocation instrumentation and leak detection.
//!
//! Every tracked allocation is attributed to an interned callsite record and
//! a logical subsystem, with the live allocation table as ground truth for
//! outstanding memory. Bookkeeping storage comes from this crate's own arena
//! and pooled allocators, never the tracked allocator, so tracking cannot
//! recurse into itself. `unsafe` is confined to the pool-backed modules
//! (`heap`, `pool`, `pool_map`); everything else is deny-by-default.

#![deny(unsafe_code)]

pub mod arena;
pub mod callsite;
pub mod config;
pub mod hash;
pub mod heap;
pub mod live;
pub mod pool;
pub mod pool_map;
pub mod shadow;
pub mod stats;
pub mod strings;
pub mod tracker;

pub use callsite::{CallsiteId, CaptureMode, NativeUnwinder, NullUnwinder, ResolvedSymbol};
pub use config::TrackerConfig;
pub use heap::{HeapSource, SystemHeap, BLOCK_ALIGN};
pub use live::{
    FLAG_INTERNAL, FLAG_LEAK_IGNORED, FLAG_POOL_ORIGIN, FLAG_PRE_INIT, LiveEntry,
};
pub use pool::PoolConfig;
pub use shadow::ShadowFrameGuard;
pub use stats::{SLOT_GLOBAL, SLOT_HEAP, SLOT_INTERNAL, SLOT_POOL, SlotStats};
pub use tracker::{
    AssignmentRecord, MemTracker, Phase, SingleSubsystem, SubsystemResolver, SubsystemTag,
};
