//! Heap hooks backing the pooled bookkeeping allocator.
//!
//! The tracker never calls the globally tracked allocator for its own
//! bookkeeping; the host supplies these hooks at construction time and the
//! pool allocator routes block allocations and out-of-class sizes through
//! them. [`SystemHeap`] is the default implementation over `std::alloc`.

#![allow(unsafe_code)]

use std::alloc::Layout;

/// Alignment of every block and chunk handed out through the hooks.
///
/// Chunk sizes are required to be multiples of this, which is what lets the
/// pool store intrusive free-list links and node payloads in chunk memory.
pub const BLOCK_ALIGN: usize = 16;

/// Caller-supplied heap allocate/free hooks.
///
/// Sizes are explicit on both sides; the callers (pool blocks and the
/// out-of-class side table) always know the size they allocated.
pub trait HeapSource: Send {
    /// Allocate `size` bytes aligned to [`BLOCK_ALIGN`].
    ///
    /// Returns the block address, or 0 if the heap is exhausted.
    fn alloc(&self, size: usize) -> usize;

    /// Free a block previously returned by [`alloc`](Self::alloc) with the
    /// same `size`.
    fn free(&self, addr: usize, size: usize);
}

/// Default heap hooks over the process allocator.
#[derive(Debug, Default)]
pub struct SystemHeap;

impl HeapSource for SystemHeap {
    fn alloc(&self, size: usize) -> usize {
        let Ok(layout) = Layout::from_size_align(size.max(1), BLOCK_ALIGN) else {
            return 0;
        };
        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { std::alloc::alloc(layout) };
        ptr as usize
    }

    fn free(&self, addr: usize, size: usize) {
        if addr == 0 {
            return;
        }
        let layout =
            Layout::from_size_align(size.max(1), BLOCK_ALIGN).expect("layout valid at alloc time");
        // SAFETY: addr was returned by std::alloc::alloc with this exact layout.
        unsafe {
            std::alloc::dealloc(addr as *mut u8, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_aligned_block() {
        let heap = SystemHeap;
        let addr = heap.alloc(1024);
        assert_ne!(addr, 0);
        assert_eq!(addr % BLOCK_ALIGN, 0);
        heap.free(addr, 1024);
    }

    #[test]
    fn free_of_zero_is_noop() {
        SystemHeap.free(0, 64);
    }

    #[test]
    fn block_memory_is_writable() {
        let heap = SystemHeap;
        let addr = heap.alloc(64);
        // SAFETY: addr points to a live 64-byte block we own.
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0x5A, 64);
            assert_eq!(*(addr as *const u8), 0x5A);
        }
        heap.free(addr, 64);
    }
}
