//! Per-tier block allocators.
//!
//! Two variants behind one closed enum:
//! - [`UncachedBlockAllocator`]: a pre-filled free list with O(1)
//!   allocate/free and reference counting.
//! - [`CachedBlockAllocator`]: prefix-sharing allocator that keeps
//!   hash-identified blocks alive in an LRU evictor after their last
//!   reference drops, so identical prompt prefixes reuse computed blocks.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::cache::block::{BlockId, BlockPool, Tier};
use crate::cache::evictor::LruEvictor;

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("out of memory: no free blocks on {tier} tier")]
    OutOfMemory { tier: Tier },

    #[error("double free of block {block} on {tier} tier")]
    DoubleFree { tier: Tier, block: BlockId },

    #[error("hash {hash:#x} already registered on {tier} tier")]
    HashCollision { tier: Tier, hash: u64 },
}

/// Free-list allocator without content addressing.
#[derive(Debug)]
pub struct UncachedBlockAllocator {
    tier: Tier,
    num_blocks: usize,
    pool: BlockPool,
    free_list: Vec<BlockId>,
}

impl UncachedBlockAllocator {
    pub fn new(tier: Tier, num_blocks: usize) -> Self {
        Self {
            tier,
            num_blocks,
            pool: BlockPool::prefilled(tier, num_blocks),
            free_list: (0..num_blocks as BlockId).collect(),
        }
    }

    pub fn allocate(&mut self) -> Result<BlockId, AllocatorError> {
        let block = self
            .free_list
            .pop()
            .ok_or(AllocatorError::OutOfMemory { tier: self.tier })?;
        self.pool.get_mut(block).ref_count = 1;
        Ok(block)
    }

    pub fn free(&mut self, block: BlockId) -> Result<(), AllocatorError> {
        let meta = self.pool.get_mut(block);
        if meta.ref_count == 0 {
            return Err(AllocatorError::DoubleFree {
                tier: self.tier,
                block,
            });
        }
        meta.ref_count -= 1;
        if meta.ref_count == 0 {
            self.free_list.push(block);
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }
}

/// Prefix-sharing allocator.
///
/// `cached` maps content hashes to in-use blocks; the evictor parks
/// zero-ref blocks that still hold valid contents. A hash hit on either
/// structure reuses the existing block instead of manufacturing one.
#[derive(Debug)]
pub struct CachedBlockAllocator {
    tier: Tier,
    num_blocks: usize,
    pool: BlockPool,
    cached: HashMap<u64, BlockId>,
    evictor: LruEvictor,
    default_hash_ctr: u64,
}

impl CachedBlockAllocator {
    pub fn new(tier: Tier, num_blocks: usize) -> Self {
        Self {
            tier,
            num_blocks,
            pool: BlockPool::new(tier, num_blocks),
            cached: HashMap::new(),
            evictor: LruEvictor::new(),
            default_hash_ctr: 0,
        }
    }

    fn next_default_hash(&mut self) -> u64 {
        // Synthetic identity for blocks that are not (yet) content-hashed,
        // kept out of the range SipHash produces in practice by tagging the
        // top bit.
        let h = self.default_hash_ctr | (1 << 63);
        self.default_hash_ctr += 1;
        h
    }

    fn manufacture_or_evict(
        &mut self,
        hash: u64,
        num_hashed_tokens: usize,
    ) -> Result<BlockId, AllocatorError> {
        let block = if self.pool.len() < self.num_blocks {
            self.pool.manufacture()
        } else {
            let (old_hash, block) = self
                .evictor
                .evict(&self.pool)
                .ok_or(AllocatorError::OutOfMemory { tier: self.tier })?;
            debug!(tier = %self.tier, block, old_hash, new_hash = hash, "repurposed cached block");
            block
        };
        let meta = self.pool.get_mut(block);
        meta.content_hash = Some(hash);
        meta.num_hashed_tokens = num_hashed_tokens;
        meta.computed = false;
        Ok(block)
    }

    pub fn allocate(
        &mut self,
        hash: Option<u64>,
        num_hashed_tokens: usize,
    ) -> Result<BlockId, AllocatorError> {
        let hash = match hash {
            Some(h) => h,
            None => self.next_default_hash(),
        };

        if let Some(block) = self.evictor.remove(hash) {
            debug_assert_eq!(self.pool.get(block).ref_count, 0);
            debug_assert_eq!(self.pool.get(block).content_hash, Some(hash));
            self.cached.insert(hash, block);
            self.pool.get_mut(block).ref_count = 1;
            return Ok(block);
        }

        if let Some(&block) = self.cached.get(&hash) {
            self.pool.get_mut(block).ref_count += 1;
            return Ok(block);
        }

        let block = self.manufacture_or_evict(hash, num_hashed_tokens)?;
        self.cached.insert(hash, block);
        self.pool.get_mut(block).ref_count = 1;
        Ok(block)
    }

    pub fn free(&mut self, block: BlockId) -> Result<(), AllocatorError> {
        let meta = self.pool.get_mut(block);
        if meta.ref_count == 0 {
            return Err(AllocatorError::DoubleFree {
                tier: self.tier,
                block,
            });
        }
        meta.ref_count -= 1;
        if meta.ref_count == 0 {
            // Never drop contents: park the block for later reuse.
            let hash = meta.content_hash.expect("cached block without hash");
            self.cached.remove(&hash);
            self.evictor.add(hash, block);
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.num_blocks - self.pool.len() + self.evictor.len()
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.cached.contains_key(&hash) || self.evictor.contains(hash)
    }

    /// Re-key a block once its contents are final (last block just filled).
    pub fn update_hash(&mut self, new_hash: u64, block: BlockId) -> Result<(), AllocatorError> {
        if self.contains(new_hash) {
            return Err(AllocatorError::HashCollision {
                tier: self.tier,
                hash: new_hash,
            });
        }
        let meta = self.pool.get_mut(block);
        let old_hash = meta.content_hash.expect("cached block without hash");
        meta.content_hash = Some(new_hash);
        self.cached.remove(&old_hash);
        self.cached.insert(new_hash, block);
        Ok(())
    }
}

/// The shared allocator interface over both variants.
#[derive(Debug)]
pub enum BlockAllocator {
    Uncached(UncachedBlockAllocator),
    Cached(CachedBlockAllocator),
}

impl BlockAllocator {
    pub fn uncached(tier: Tier, num_blocks: usize) -> Self {
        BlockAllocator::Uncached(UncachedBlockAllocator::new(tier, num_blocks))
    }

    pub fn cached(tier: Tier, num_blocks: usize) -> Self {
        BlockAllocator::Cached(CachedBlockAllocator::new(tier, num_blocks))
    }

    pub fn tier(&self) -> Tier {
        self.pool().tier()
    }

    pub fn allocate(
        &mut self,
        hash: Option<u64>,
        num_hashed_tokens: usize,
    ) -> Result<BlockId, AllocatorError> {
        match self {
            BlockAllocator::Uncached(a) => a.allocate(),
            BlockAllocator::Cached(a) => a.allocate(hash, num_hashed_tokens),
        }
    }

    pub fn free(&mut self, block: BlockId) -> Result<(), AllocatorError> {
        match self {
            BlockAllocator::Uncached(a) => a.free(block),
            BlockAllocator::Cached(a) => a.free(block),
        }
    }

    /// Add one reference to an already-allocated block (fork, shared prompt).
    pub fn incr_ref(&mut self, block: BlockId) {
        let meta = self.pool_mut().get_mut(block);
        debug_assert!(meta.ref_count > 0, "incr_ref on free block {block}");
        meta.ref_count += 1;
    }

    pub fn ref_count(&self, block: BlockId) -> u32 {
        self.pool().get(block).ref_count
    }

    pub fn num_free(&self) -> usize {
        match self {
            BlockAllocator::Uncached(a) => a.num_free(),
            BlockAllocator::Cached(a) => a.num_free(),
        }
    }

    pub fn num_total(&self) -> usize {
        match self {
            BlockAllocator::Uncached(a) => a.num_blocks,
            BlockAllocator::Cached(a) => a.num_blocks,
        }
    }

    /// Whether a content hash is resident (in use or parked). Only
    /// meaningful for the cached variant; the manager guards call sites
    /// with its prefix-caching flag.
    pub fn contains(&self, hash: u64) -> bool {
        match self {
            BlockAllocator::Uncached(_) => {
                unreachable!("contains() is not a valid codepath for the uncached allocator")
            }
            BlockAllocator::Cached(a) => a.contains(hash),
        }
    }

    pub fn update_hash(&mut self, new_hash: u64, block: BlockId) -> Result<(), AllocatorError> {
        match self {
            BlockAllocator::Uncached(_) => {
                unreachable!("update_hash() is not a valid codepath for the uncached allocator")
            }
            BlockAllocator::Cached(a) => a.update_hash(new_hash, block),
        }
    }

    pub fn pool(&self) -> &BlockPool {
        match self {
            BlockAllocator::Uncached(a) => &a.pool,
            BlockAllocator::Cached(a) => &a.pool,
        }
    }

    pub fn pool_mut(&mut self) -> &mut BlockPool {
        match self {
            BlockAllocator::Uncached(a) => &mut a.pool,
            BlockAllocator::Cached(a) => &mut a.pool,
        }
    }
}
