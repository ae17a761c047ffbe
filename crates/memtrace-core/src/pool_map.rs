//! Hash map over the pooled bookkeeping allocator.
//!
//! Chained hash table keyed by `u64` whose nodes live in pool chunks, so the
//! callsite index and the live allocation table are backed by the
//! bookkeeping pools rather than the tracked allocator. Node chunks never
//! move once allocated; growing the table only relinks them across a larger
//! bucket array.
//!
//! The map does not own its allocator: every mutating call takes the
//! [`BookkeepingAlloc`] it was built over. Dropping the map without calling
//! [`clear`](PooledMap::clear) leaves its nodes in the pools until the
//! allocator itself is dropped.

#![allow(unsafe_code)]

use std::marker::PhantomData;

use crate::heap::BLOCK_ALIGN;
use crate::pool::BookkeepingAlloc;

const INITIAL_BUCKETS: usize = 64;

/// Node stored in one pool chunk.
#[repr(C)]
struct Node<V> {
    key: u64,
    /// Chunk address of the next node in this bucket (0 = end).
    next: usize,
    value: V,
}

/// Hash map with pool-chunk nodes and `Copy` values.
pub struct PooledMap<V: Copy> {
    /// Chunk address of each bucket's first node (0 = empty).
    buckets: Vec<usize>,
    len: usize,
    _marker: PhantomData<V>,
}

impl<V: Copy> PooledMap<V> {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        assert!(
            align_of::<Node<V>>() <= BLOCK_ALIGN,
            "node alignment exceeds pool chunk alignment"
        );
        Self {
            buckets: vec![0; INITIAL_BUCKETS],
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_of(&self, key: u64) -> usize {
        // Fibonacci spread; bucket count is always a power of two.
        let mixed = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((mixed >> 33) as usize) & (self.buckets.len() - 1)
    }

    /// Chunk address of the node holding `key`, or 0.
    fn find(&self, key: u64) -> usize {
        let mut addr = self.buckets[self.bucket_of(key)];
        while addr != 0 {
            // SAFETY: addr is a live node chunk owned by this map.
            let node = unsafe { &*(addr as *const Node<V>) };
            if node.key == key {
                return addr;
            }
            addr = node.next;
        }
        0
    }

    /// Copy out the value for `key`.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<V> {
        let addr = self.find(key);
        if addr == 0 {
            return None;
        }
        // SAFETY: addr is a live node chunk owned by this map.
        Some(unsafe { (*(addr as *const Node<V>)).value })
    }

    /// True if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: u64) -> bool {
        self.find(key) != 0
    }

    /// Insert or replace; returns the previous value if any.
    pub fn insert(&mut self, alloc: &mut BookkeepingAlloc, key: u64, value: V) -> Option<V> {
        let addr = self.find(key);
        if addr != 0 {
            // SAFETY: addr is a live node chunk owned by this map; replacing
            // a Copy value in place.
            let node = unsafe { &mut *(addr as *mut Node<V>) };
            let old = node.value;
            node.value = value;
            return Some(old);
        }

        if self.len >= self.buckets.len() {
            self.grow(self.buckets.len() * 2);
        }

        let bucket = self.bucket_of(key);
        let node_addr = alloc.allocate(size_of::<Node<V>>());
        // SAFETY: node_addr is a fresh chunk of at least Node<V> bytes,
        // aligned to BLOCK_ALIGN which covers align_of::<Node<V>>().
        unsafe {
            (node_addr as *mut Node<V>).write(Node {
                key,
                next: self.buckets[bucket],
                value,
            });
        }
        self.buckets[bucket] = node_addr;
        self.len += 1;
        None
    }

    /// Remove `key`, returning its node chunk to the pool.
    pub fn remove(&mut self, alloc: &mut BookkeepingAlloc, key: u64) -> Option<V> {
        let bucket = self.bucket_of(key);
        let mut prev: usize = 0;
        let mut addr = self.buckets[bucket];
        while addr != 0 {
            // SAFETY: addr is a live node chunk owned by this map.
            let node = unsafe { &*(addr as *const Node<V>) };
            if node.key == key {
                let value = node.value;
                if prev == 0 {
                    self.buckets[bucket] = node.next;
                } else {
                    // SAFETY: prev is the live predecessor node chunk.
                    unsafe {
                        (*(prev as *mut Node<V>)).next = node.next;
                    }
                }
                alloc.deallocate(addr);
                self.len -= 1;
                return Some(value);
            }
            prev = addr;
            addr = node.next;
        }
        None
    }

    /// Return every node chunk to the pool and reset to empty.
    pub fn clear(&mut self, alloc: &mut BookkeepingAlloc) {
        for bucket in &mut self.buckets {
            let mut addr = *bucket;
            *bucket = 0;
            while addr != 0 {
                // SAFETY: addr is a live node chunk owned by this map.
                let next = unsafe { (*(addr as *const Node<V>)).next };
                alloc.deallocate(addr);
                addr = next;
            }
        }
        self.len = 0;
    }

    /// Iterate `(key, value)` pairs in unspecified order.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            map: self,
            bucket: 0,
            node: 0,
        }
    }

    /// Relink every node across `new_size` buckets (power of two).
    fn grow(&mut self, new_size: usize) {
        debug_assert!(new_size.is_power_of_two());
        let mut nodes = Vec::with_capacity(self.len);
        for &head in &self.buckets {
            let mut addr = head;
            while addr != 0 {
                nodes.push(addr);
                // SAFETY: addr is a live node chunk owned by this map.
                addr = unsafe { (*(addr as *const Node<V>)).next };
            }
        }

        self.buckets = vec![0; new_size];
        for addr in nodes {
            // SAFETY: addr is a live node chunk owned by this map; relinking
            // rewrites only the next field.
            let node = unsafe { &mut *(addr as *mut Node<V>) };
            let bucket = self.bucket_of(node.key);
            node.next = self.buckets[bucket];
            self.buckets[bucket] = addr;
        }
    }
}

impl<V: Copy> Default for PooledMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a [`PooledMap`], copying values out.
pub struct Iter<'a, V: Copy> {
    map: &'a PooledMap<V>,
    bucket: usize,
    /// Current node chunk address, 0 when positioned before a bucket.
    node: usize,
}

impl<V: Copy> Iterator for Iter<'_, V> {
    type Item = (u64, V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.node == 0 {
            if self.bucket >= self.map.buckets.len() {
                return None;
            }
            self.node = self.map.buckets[self.bucket];
            self.bucket += 1;
        }
        // SAFETY: self.node is a live node chunk owned by the map.
        let node = unsafe { &*(self.node as *const Node<V>) };
        self.node = node.next;
        Some((node.key, node.value))
    }
}
