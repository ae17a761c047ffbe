//! Bump arena for interned bookkeeping records.
//!
//! Objects placed here are never individually freed; the only reclamation is
//! `release_all`, which drops every page at once. Interned callsite records
//! live here for the lifetime of the tracker, which is what makes a
//! `CallsiteId` held by a live-allocation entry valid until shutdown.

/// A fixed-capacity page with a bump cursor.
///
/// `buf` is created with its full capacity up front and only ever grows by
/// appends, so data once written never moves.
struct Page {
    buf: Vec<u8>,
    capacity: usize,
}

impl Page {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }
}

/// Stable handle to a byte span inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRef {
    page: u32,
    offset: u32,
    len: u32,
}

impl ArenaRef {
    /// Length of the referenced span in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if the referenced span is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bump allocator over a chain of fixed-size pages.
///
/// Pages are created lazily on capacity exhaustion; the most recently created
/// page is the active one. There is no per-object deallocate by design.
pub struct RecordArena {
    pages: Vec<Page>,
    page_bytes: usize,
    total_bytes: usize,
}

impl RecordArena {
    /// Create an arena whose pages hold `page_bytes` each.
    #[must_use]
    pub fn new(page_bytes: usize) -> Self {
        assert!(page_bytes > 0, "arena page size must be non-zero");
        Self {
            pages: Vec::new(),
            page_bytes,
            total_bytes: 0,
        }
    }

    /// Copy `bytes` into the arena and return a stable handle.
    ///
    /// Fatal if the span is as large as a whole page; the arena serves
    /// small records only.
    pub fn copy_in(&mut self, bytes: &[u8]) -> ArenaRef {
        assert!(
            bytes.len() < self.page_bytes,
            "arena allocation of {} bytes exceeds page capacity {}",
            bytes.len(),
            self.page_bytes
        );

        let needs_page = match self.pages.last() {
            Some(page) => page.remaining() < bytes.len(),
            None => true,
        };
        if needs_page {
            self.pages.push(Page::new(self.page_bytes));
        }

        let page_idx = self.pages.len() - 1;
        let page = &mut self.pages[page_idx];
        let offset = page.buf.len();
        page.buf.extend_from_slice(bytes);
        self.total_bytes += bytes.len();

        ArenaRef {
            page: page_idx as u32,
            offset: offset as u32,
            len: bytes.len() as u32,
        }
    }

    /// Read back a span previously returned by [`copy_in`](Self::copy_in).
    #[must_use]
    pub fn get(&self, handle: ArenaRef) -> &[u8] {
        let page = &self.pages[handle.page as usize];
        let start = handle.offset as usize;
        &page.buf[start..start + handle.len as usize]
    }

    /// Number of pages currently held.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Total bytes handed out across all pages.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Drop every page and reset to the empty state. Idempotent.
    ///
    /// Every `ArenaRef` handed out before this call is invalidated.
    pub fn release_all(&mut self) {
        self.pages.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_in_and_read_back() {
        let mut arena = RecordArena::new(256);
        let a = arena.copy_in(b"hello");
        let b = arena.copy_in(b"world!");
        assert_eq!(arena.get(a), b"hello");
        assert_eq!(arena.get(b), b"world!");
        assert_eq!(arena.used_bytes(), 11);
    }

    #[test]
    fn earlier_spans_survive_page_growth() {
        let mut arena = RecordArena::new(64);
        let first = arena.copy_in(&[0xAB; 40]);
        // Force several new pages.
        for _ in 0..10 {
            arena.copy_in(&[0xCD; 40]);
        }
        assert!(arena.page_count() > 1);
        assert_eq!(arena.get(first), &[0xAB; 40]);
    }

    #[test]
    fn new_page_on_exhaustion() {
        let mut arena = RecordArena::new(64);
        arena.copy_in(&[1; 40]);
        assert_eq!(arena.page_count(), 1);
        arena.copy_in(&[2; 40]);
        assert_eq!(arena.page_count(), 2);
    }

    #[test]
    #[should_panic(expected = "exceeds page capacity")]
    fn oversized_allocation_is_fatal() {
        let mut arena = RecordArena::new(64);
        arena.copy_in(&[0; 64]);
    }

    #[test]
    fn release_all_is_idempotent() {
        let mut arena = RecordArena::new(64);
        arena.copy_in(&[1; 32]);
        arena.copy_in(&[2; 48]);

        arena.release_all();
        assert_eq!(arena.page_count(), 0);
        assert_eq!(arena.used_bytes(), 0);

        arena.release_all();
        assert_eq!(arena.page_count(), 0);
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn usable_after_release() {
        let mut arena = RecordArena::new(64);
        arena.copy_in(&[1; 32]);
        arena.release_all();
        let r = arena.copy_in(b"again");
        assert_eq!(arena.get(r), b"again");
    }
}
