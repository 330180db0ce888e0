//! KV block identifiers and the per-tier block arena.
//!
//! A block is a fixed-size slot of `block_size` tokens on one tier. The
//! arena (`BlockPool`) owns all per-block bookkeeping for its tier; every
//! other component refers to blocks by `(tier, block_number)` only, so
//! block references are freely copyable and never alias owned state.

use serde::{Deserialize, Serialize};

/// Identifies which memory tier a block lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Accelerator memory holding the blocks the model reads this iteration.
    Device,
    /// Host memory holding swapped-out blocks.
    Host,
}

impl Tier {
    /// The opposite tier, used when moving blocks during swap in/out.
    pub fn other(&self) -> Tier {
        match self {
            Tier::Device => Tier::Host,
            Tier::Host => Tier::Device,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Device => write!(f, "device"),
            Tier::Host => write!(f, "host"),
        }
    }
}

/// Physical block number within one tier's pool.
pub type BlockId = u32;

/// A tier-qualified block reference, the unit entries of a block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    /// Tier the block currently resides on.
    pub tier: Tier,

    /// Block number within that tier.
    pub block: BlockId,
}

impl BlockRef {
    pub fn device(block: BlockId) -> Self {
        Self {
            tier: Tier::Device,
            block,
        }
    }

    pub fn host(block: BlockId) -> Self {
        Self {
            tier: Tier::Host,
            block,
        }
    }
}

/// Per-block metadata tracked by the arena.
#[derive(Debug, Clone)]
pub struct BlockMeta {
    /// Number of block-table entries pointing at this block.
    pub ref_count: u32,

    /// Content hash, when the block is identified by a token prefix.
    pub content_hash: Option<u64>,

    /// Number of prefix tokens covered by `content_hash`.
    pub num_hashed_tokens: usize,

    /// Logical access tick of the last touch. Logical rather than
    /// wall-clock so that eviction order is replayable.
    pub last_accessed: u64,

    /// Whether the block's contents have been computed by the model
    /// (prefix-caching bookkeeping).
    pub computed: bool,
}

impl BlockMeta {
    fn fresh() -> Self {
        Self {
            ref_count: 0,
            content_hash: None,
            num_hashed_tokens: 0,
            last_accessed: 0,
            computed: false,
        }
    }
}

/// The arena of block metadata for one tier.
///
/// Block numbers index directly into the arena. The pool never shrinks;
/// the cached allocator manufactures entries lazily up to `capacity`,
/// the uncached allocator fills the pool up front.
#[derive(Debug)]
pub struct BlockPool {
    tier: Tier,
    capacity: usize,
    metas: Vec<BlockMeta>,
}

impl BlockPool {
    pub fn new(tier: Tier, capacity: usize) -> Self {
        Self {
            tier,
            capacity,
            metas: Vec::new(),
        }
    }

    /// Pre-fill the arena with `capacity` blocks (uncached allocator).
    pub fn prefilled(tier: Tier, capacity: usize) -> Self {
        Self {
            tier,
            capacity,
            metas: vec![BlockMeta::fresh(); capacity],
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks manufactured so far.
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Manufacture a new block. Panics if the pool is already at capacity;
    /// callers check `len() < capacity()` first.
    pub fn manufacture(&mut self) -> BlockId {
        assert!(
            self.metas.len() < self.capacity,
            "block pool for {} tier exhausted",
            self.tier
        );
        self.metas.push(BlockMeta::fresh());
        (self.metas.len() - 1) as BlockId
    }

    pub fn get(&self, id: BlockId) -> &BlockMeta {
        &self.metas[id as usize]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BlockMeta {
        &mut self.metas[id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BlockMeta)> {
        self.metas
            .iter()
            .enumerate()
            .map(|(i, m)| (i as BlockId, m))
    }
}
