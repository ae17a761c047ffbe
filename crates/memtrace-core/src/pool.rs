//! Pooled bookkeeping allocator.
//!
//! Serves the instrumentation layer's own hash-table nodes and records from
//! multi-size-class chunk pools so tracking never re-enters the tracked
//! allocator. Each size class owns a chain of pools; a pool is one heap block
//! of `pool_bytes` divided into equal chunks, with an intrusive free list
//! threaded through freed chunks. Pools are created lazily and released back
//! to the heap hooks the moment they become entirely free, bounding growth
//! from allocation bursts. Sizes above the largest class go straight to the
//! heap hooks.
//!
//! The allocator itself is not synchronized; it lives behind the tracker's
//! single coarse mutex and only serves the cold bookkeeping path.

#![allow(unsafe_code)]

use std::collections::HashMap;

use tracing::debug;

use crate::heap::{BLOCK_ALIGN, HeapSource};

/// Size-class and pool-size configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Ascending chunk sizes, each a multiple of [`BLOCK_ALIGN`].
    pub classes: Vec<usize>,
    /// Byte size of each pool block carved from the heap hooks.
    pub pool_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            classes: vec![32, 64, 128, 256, 512, 1024],
            pool_bytes: 16 * 1024,
        }
    }
}

impl PoolConfig {
    fn validate(&self) {
        assert!(!self.classes.is_empty(), "at least one size class required");
        let mut prev = 0;
        for &class in &self.classes {
            assert!(class > prev, "size classes must be strictly ascending");
            assert!(
                class % BLOCK_ALIGN == 0,
                "size class {class} is not a multiple of {BLOCK_ALIGN}"
            );
            assert!(
                class <= self.pool_bytes,
                "size class {class} exceeds pool size {}",
                self.pool_bytes
            );
            prev = class;
        }
    }
}

/// One pool: a heap block subdivided into `capacity` chunks of one class.
///
/// The header lives here as an ordinary owned struct; the block itself is
/// pure chunk storage, so `pool_bytes / chunk_size` chunks fit exactly.
struct Pool {
    base: usize,
    chunk_size: usize,
    capacity: usize,
    /// Chunks handed out by bump so far (never reset).
    bump: usize,
    /// Head of the intrusive free list (0 = empty).
    free_head: usize,
    /// Chunks currently handed out.
    used: usize,
}

impl Pool {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.capacity * self.chunk_size
    }

    /// Pop the free list, else bump untouched capacity. Returns 0 when full.
    fn alloc(&mut self) -> usize {
        if self.free_head != 0 {
            let addr = self.free_head;
            // SAFETY: addr is a free chunk of this live pool; its first word
            // holds the next-free link written by `free`.
            self.free_head = unsafe { (addr as *const usize).read() };
            self.used += 1;
            return addr;
        }
        if self.bump < self.capacity {
            let addr = self.base + self.bump * self.chunk_size;
            self.bump += 1;
            self.used += 1;
            return addr;
        }
        0
    }

    fn free(&mut self, addr: usize) {
        assert!(
            (addr - self.base) % self.chunk_size == 0,
            "pointer {addr:#x} is not on a chunk boundary (corrupted free)"
        );
        assert!(self.used > 0, "pool underflow on free of {addr:#x}");
        // SAFETY: addr is a chunk of this live pool being returned; the chunk
        // memory is dead to its former owner, so the link write is exclusive.
        unsafe {
            (addr as *mut usize).write(self.free_head);
        }
        self.free_head = addr;
        self.used -= 1;
    }
}

/// Chain of pools for one size class; the front pool is the active one.
struct ClassChain {
    chunk_size: usize,
    pools: Vec<Pool>,
}

/// Multi-size-class pool allocator over caller-supplied heap hooks.
pub struct BookkeepingAlloc {
    heap: Box<dyn HeapSource>,
    classes: Vec<ClassChain>,
    pool_bytes: usize,
    /// Out-of-class allocations (addr -> size), served directly by the heap
    /// hooks. Also what makes freeing a foreign pointer detectable.
    large: HashMap<usize, usize>,
    pools_created: u64,
    pools_released: u64,
}

impl BookkeepingAlloc {
    /// Create an allocator with the given size classes over `heap`.
    #[must_use]
    pub fn new(config: PoolConfig, heap: Box<dyn HeapSource>) -> Self {
        config.validate();
        let classes = config
            .classes
            .iter()
            .map(|&chunk_size| ClassChain {
                chunk_size,
                pools: Vec::new(),
            })
            .collect();
        Self {
            heap,
            classes,
            pool_bytes: config.pool_bytes,
            large: HashMap::new(),
            pools_created: 0,
            pools_released: 0,
        }
    }

    /// Smallest class index that fits `size`, or `None` for the heap path.
    fn class_index(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|c| size <= c.chunk_size)
    }

    /// Allocate `size` bytes of bookkeeping memory.
    ///
    /// Fatal if the heap hooks are exhausted: the tracker cannot continue
    /// without bookkeeping memory without losing accounting data.
    pub fn allocate(&mut self, size: usize) -> usize {
        let Some(class_idx) = self.class_index(size) else {
            let addr = self.heap.alloc(size);
            assert!(addr != 0, "bookkeeping heap exhausted ({size} bytes)");
            self.large.insert(addr, size);
            return addr;
        };

        let chunk_size = self.classes[class_idx].chunk_size;
        if let Some(active) = self.classes[class_idx].pools.first_mut() {
            let addr = active.alloc();
            if addr != 0 {
                return addr;
            }
        }

        // Active pool missing or full: carve a new pool and make it active.
        let base = self.heap.alloc(self.pool_bytes);
        assert!(
            base != 0,
            "bookkeeping heap exhausted (pool of {} bytes)",
            self.pool_bytes
        );
        self.pools_created += 1;
        debug!(chunk_size, base, "pool created");
        let mut pool = Pool {
            base,
            chunk_size,
            capacity: self.pool_bytes / chunk_size,
            bump: 0,
            free_head: 0,
            used: 0,
        };
        let addr = pool.alloc();
        self.classes[class_idx].pools.insert(0, pool);
        addr
    }

    /// Return `addr` to its owning pool, or to the heap hooks for
    /// out-of-class allocations.
    ///
    /// Fatal if `addr` is owned by neither: that is a double free or a
    /// foreign pointer, and continuing would corrupt the free lists.
    pub fn deallocate(&mut self, addr: usize) {
        if let Some(size) = self.large.remove(&addr) {
            self.heap.free(addr, size);
            return;
        }

        for class in &mut self.classes {
            let Some(pool_idx) = class.pools.iter().position(|p| p.contains(addr)) else {
                continue;
            };
            class.pools[pool_idx].free(addr);
            if class.pools[pool_idx].used == 0 {
                let pool = class.pools.remove(pool_idx);
                self.pools_released += 1;
                debug!(chunk_size = pool.chunk_size, base = pool.base, "pool released");
                self.heap.free(pool.base, self.pool_bytes);
            }
            return;
        }

        panic!("pointer {addr:#x} not owned by bookkeeping allocator (double free or foreign pointer)");
    }

    /// Resize a bookkeeping allocation, staying in place when the size class
    /// is unchanged.
    pub fn reallocate(&mut self, addr: usize, new_size: usize) -> usize {
        let old_size = self.owned_size(addr).unwrap_or_else(|| {
            panic!("pointer {addr:#x} not owned by bookkeeping allocator (realloc)")
        });

        let old_class = self.class_index(old_size);
        let new_class = self.class_index(new_size);
        if old_class.is_some() && old_class == new_class {
            return addr;
        }

        let new_addr = self.allocate(new_size);
        let copy = old_size.min(new_size);
        // SAFETY: both regions are live allocations of at least `copy` bytes
        // owned by this allocator, and they are distinct blocks.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, copy);
        }
        self.deallocate(addr);
        new_addr
    }

    /// Size capacity of the allocation owning `addr` (chunk size for pooled,
    /// requested size for heap-path allocations).
    fn owned_size(&self, addr: usize) -> Option<usize> {
        if let Some(&size) = self.large.get(&addr) {
            return Some(size);
        }
        for class in &self.classes {
            if class.pools.iter().any(|p| p.contains(addr)) {
                return Some(class.chunk_size);
            }
        }
        None
    }

    /// Number of live pools for the class serving `size`-byte chunks.
    #[must_use]
    pub fn live_pools(&self, size: usize) -> usize {
        self.class_index(size)
            .map_or(0, |i| self.classes[i].pools.len())
    }

    /// Live chunk count for the class serving `size`-byte chunks.
    #[must_use]
    pub fn live_chunks(&self, size: usize) -> usize {
        self.class_index(size)
            .map_or(0, |i| self.classes[i].pools.iter().map(|p| p.used).sum())
    }

    /// Total pools ever created.
    #[must_use]
    pub fn pools_created(&self) -> u64 {
        self.pools_created
    }

    /// Total pools released back to the heap hooks.
    #[must_use]
    pub fn pools_released(&self) -> u64 {
        self.pools_released
    }

    /// Outstanding out-of-class allocations.
    #[must_use]
    pub fn large_count(&self) -> usize {
        self.large.len()
    }
}

impl Drop for BookkeepingAlloc {
    fn drop(&mut self) {
        for class in &self.classes {
            for pool in &class.pools {
                self.heap.free(pool.base, self.pool_bytes);
            }
        }
        for (&addr, &size) in &self.large {
            self.heap.free(addr, size);
        }
    }
}
