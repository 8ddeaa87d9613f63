//! Memory Cache Module
//!
//! Size-aware in-memory LRU cache for artifact payloads. Recency order is kept in a
//! slot-indexed doubly linked list so that touch, insert and evict are all O(1) and no
//! entry ever holds a reference to another.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;

/// One resident payload plus its links in the recency list
#[derive(Debug)]
struct Slot {
    key: String,
    payload: Bytes,
    /// Towards the head (more recently used)
    prev: Option<usize>,
    /// Towards the tail (less recently used)
    next: Option<usize>,
}

/// Memory cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryCacheStats {
    pub entries_count: usize,
    pub total_size_bytes: u64,
    pub capacity_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
}

/// Least-recently-used payload cache bounded by total bytes
#[derive(Debug)]
pub struct MemoryCache {
    enabled: bool,
    capacity_bytes: u64,
    /// Payloads at or above this size are never admitted
    max_entry_bytes: u64,
    index: HashMap<String, usize>,
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_size_bytes: u64,
    hit_count: u64,
    miss_count: u64,
    eviction_count: u64,
}

impl MemoryCache {
    /// Create a new cache; a disabled cache never admits anything
    pub fn new(enabled: bool, max_entry_bytes: u64, capacity_bytes: u64) -> Self {
        Self {
            enabled,
            capacity_bytes,
            max_entry_bytes,
            index: HashMap::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
            total_size_bytes: 0,
            hit_count: 0,
            miss_count: 0,
            eviction_count: 0,
        }
    }

    /// Membership test without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Return the payload for `key` and mark it most recently used
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        match self.index.get(key).copied() {
            Some(slot) => {
                self.unlink(slot);
                self.push_front(slot);
                self.hit_count += 1;
                self.slots[slot].as_ref().map(|s| s.payload.clone())
            }
            None => {
                self.miss_count += 1;
                None
            }
        }
    }

    /// Remove `key`, reporting whether it was resident
    pub fn delete(&mut self, key: &str) -> bool {
        match self.index.get(key).copied() {
            Some(slot) => {
                self.remove_slot(slot);
                true
            }
            None => false,
        }
    }

    /// Admit `payload` under `key` if caching is enabled and it fits the entry limit.
    ///
    /// Any existing entry under `key` is dropped first, so an oversize payload also
    /// removes the stale one.
    pub fn maybe_add(&mut self, key: &str, payload: Bytes) {
        if !self.enabled {
            return;
        }

        self.delete(key);

        let size = payload.len() as u64;
        if size >= self.max_entry_bytes || size > self.capacity_bytes {
            debug!(
                "Not caching {}: size {} exceeds entry limit {} or capacity {}",
                key, size, self.max_entry_bytes, self.capacity_bytes
            );
            return;
        }

        while self.total_size_bytes > 0 && self.total_size_bytes + size > self.capacity_bytes {
            match self.tail {
                Some(tail) => {
                    self.remove_slot(tail);
                    self.eviction_count += 1;
                }
                None => break,
            }
        }

        let slot = Slot {
            key: key.to_string(),
            payload,
            prev: None,
            next: None,
        };
        let slot_index = match self.free_slots.pop() {
            Some(free) => {
                self.slots[free] = Some(slot);
                free
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.push_front(slot_index);
        self.index.insert(key.to_string(), slot_index);
        self.total_size_bytes += size;

        debug!(
            "Added {} size={}, total size = {}",
            key, size, self.total_size_bytes
        );
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            match self.slots[slot].as_ref() {
                Some(s) => {
                    keys.push(s.key.clone());
                    cursor = s.next;
                }
                None => break,
            }
        }
        keys
    }

    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            entries_count: self.index.len(),
            total_size_bytes: self.total_size_bytes,
            capacity_bytes: self.capacity_bytes,
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            eviction_count: self.eviction_count,
        }
    }

    fn remove_slot(&mut self, slot: usize) {
        self.unlink(slot);
        if let Some(removed) = self.slots[slot].take() {
            self.index.remove(&removed.key);
            self.total_size_bytes -= removed.payload.len() as u64;
            self.free_slots.push(slot);
            debug!(
                "Removed {} size={}, total size = {}",
                removed.key,
                removed.payload.len(),
                self.total_size_bytes
            );
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(s) => (s.prev, s.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(s) = self.slots[p].as_mut() {
                    s.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(s) = self.slots[n].as_mut() {
                    s.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(s) = self.slots[slot].as_mut() {
            s.prev = None;
            s.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(s) = self.slots[slot].as_mut() {
            s.prev = None;
            s.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(s) = self.slots[h].as_mut() {
                s.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}
