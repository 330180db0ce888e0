//! LRU evictor for the cached (prefix-sharing) allocator.
//!
//! Holds blocks whose reference count dropped to zero but whose contents
//! are still valid for reuse. A block leaves the evictor either by being
//! revived under its hash or by being repurposed when the pool is full.

use std::collections::HashMap;

use crate::cache::block::{BlockId, BlockPool};

/// Pool of reusable zero-ref blocks, keyed by content hash.
#[derive(Debug, Default)]
pub struct LruEvictor {
    entries: HashMap<u64, BlockId>,
}

impl LruEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.entries.contains_key(&hash)
    }

    /// Park a zero-ref block under its content hash.
    pub fn add(&mut self, hash: u64, block: BlockId) {
        debug_assert!(!self.entries.contains_key(&hash));
        self.entries.insert(hash, block);
    }

    /// Revive a parked block by hash.
    pub fn remove(&mut self, hash: u64) -> Option<BlockId> {
        self.entries.remove(&hash)
    }

    /// Pick the eviction victim: least recently accessed block; ties break
    /// toward the block covering the most hashed tokens, then the lowest
    /// block number so replay stays deterministic.
    pub fn evict(&mut self, pool: &BlockPool) -> Option<(u64, BlockId)> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, &id)| {
                let meta = pool.get(id);
                (
                    meta.last_accessed,
                    std::cmp::Reverse(meta.num_hashed_tokens),
                    id,
                )
            })
            .map(|(&hash, &id)| (hash, id))?;
        self.entries.remove(&victim.0);
        Some(victim)
    }
}
