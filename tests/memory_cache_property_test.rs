//! Property-based tests for the memory cache and the pending upload budget
//!
//! *For any* sequence of cache operations, the cache agrees with a straightforward
//! reference model of size-bounded LRU: same resident keys in the same recency order, and
//! a total size that never exceeds capacity.

use bytes::Bytes;
use quickcheck::{Arbitrary, Gen, TestResult};
use quickcheck_macros::quickcheck;
use s3_build_cache::memory_cache::MemoryCache;
use s3_build_cache::upload_staging::PendingUploadBudget;
use std::sync::Arc;

const CAPACITY: u64 = 100;
const MAX_ENTRY: u64 = 50;
const KEYS: u8 = 8;

#[derive(Debug, Clone)]
enum CacheOp {
    Add { key: u8, size: u8 },
    Get { key: u8 },
    Delete { key: u8 },
}

impl Arbitrary for CacheOp {
    fn arbitrary(g: &mut Gen) -> Self {
        let key = u8::arbitrary(g) % KEYS;
        match u8::arbitrary(g) % 3 {
            0 => CacheOp::Add {
                key,
                size: u8::arbitrary(g) % 64,
            },
            1 => CacheOp::Get { key },
            _ => CacheOp::Delete { key },
        }
    }
}

/// Recency-ordered list, most recent first
#[derive(Default)]
struct Model {
    entries: Vec<(String, u64)>,
}

impl Model {
    fn total(&self) -> u64 {
        self.entries.iter().map(|(_, size)| size).sum()
    }

    fn add(&mut self, key: &str, size: u64) {
        self.entries.retain(|(k, _)| k != key);
        if size >= MAX_ENTRY || size > CAPACITY {
            return;
        }
        while !self.entries.is_empty() && self.total() + size > CAPACITY {
            self.entries.pop();
        }
        self.entries.insert(0, (key.to_string(), size));
    }

    fn get(&mut self, key: &str) -> Option<u64> {
        let position = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(position);
        let size = entry.1;
        self.entries.insert(0, entry);
        Some(size)
    }

    fn delete(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        before != self.entries.len()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

#[quickcheck]
fn prop_cache_matches_reference_lru(ops: Vec<CacheOp>) -> bool {
    let mut cache = MemoryCache::new(true, MAX_ENTRY, CAPACITY);
    let mut model = Model::default();

    for op in ops {
        match op {
            CacheOp::Add { key, size } => {
                let key = format!("k{}", key);
                cache.maybe_add(&key, Bytes::from(vec![0u8; size as usize]));
                model.add(&key, size as u64);
            }
            CacheOp::Get { key } => {
                let key = format!("k{}", key);
                let got = cache.get(&key).map(|payload| payload.len() as u64);
                if got != model.get(&key) {
                    return false;
                }
            }
            CacheOp::Delete { key } => {
                let key = format!("k{}", key);
                if cache.delete(&key) != model.delete(&key) {
                    return false;
                }
            }
        }

        if cache.total_size_bytes() > CAPACITY
            || cache.total_size_bytes() != model.total()
            || cache.keys_by_recency() != model.keys()
            || cache.len() != model.entries.len()
        {
            return false;
        }
    }

    true
}

#[quickcheck]
fn prop_rejected_admission_removes_previous_value(key: u8, first: u8, second: u8) -> TestResult {
    let first = first as u64 % MAX_ENTRY;
    let second = second as u64;
    if second < MAX_ENTRY {
        return TestResult::discard();
    }

    let key = format!("k{}", key);
    let mut cache = MemoryCache::new(true, MAX_ENTRY, CAPACITY);
    cache.maybe_add(&key, Bytes::from(vec![1u8; first as usize]));
    cache.maybe_add(&key, Bytes::from(vec![2u8; second as usize]));

    TestResult::from_bool(!cache.contains(&key) && cache.total_size_bytes() == 0)
}

#[quickcheck]
fn prop_reinsertion_is_idempotent(sizes: Vec<u8>) -> bool {
    let mut cache = MemoryCache::new(true, MAX_ENTRY, CAPACITY);
    for size in &sizes {
        cache.maybe_add("same", Bytes::from(vec![0u8; (*size as u64 % MAX_ENTRY) as usize]));
    }
    match sizes.last() {
        Some(size) => {
            cache.len() == 1 && cache.total_size_bytes() == *size as u64 % MAX_ENTRY
        }
        None => cache.is_empty(),
    }
}

#[quickcheck]
fn prop_budget_never_exceeds_ceiling(sizes: Vec<u16>, release_every: u8) -> bool {
    let ceiling = 10_000u64;
    let budget = Arc::new(PendingUploadBudget::new(ceiling));
    let release_every = (release_every % 4) as usize + 1;
    let mut charges = Vec::new();

    for (i, size) in sizes.iter().enumerate() {
        let before = budget.pending_bytes();
        match budget.try_charge(*size as u64) {
            Some(charge) => {
                if before + *size as u64 > ceiling {
                    return false;
                }
                charges.push(charge);
            }
            None => {
                if before + (*size as u64) <= ceiling {
                    return false;
                }
            }
        }
        if budget.pending_bytes() > ceiling {
            return false;
        }
        if i % release_every == 0 && !charges.is_empty() {
            charges.remove(0);
        }
    }

    drop(charges);
    budget.pending_bytes() == 0
}
