//! Block space manager: maps sequences to physical blocks on two tiers.
//!
//! The manager owns one allocator per tier and is the only component that
//! mutates them. It answers admission questions (`can_allocate`,
//! `can_append_slots`, `can_swap_in`, `can_swap_out`), performs the
//! corresponding mutations, and emits the block-number pairs the executor
//! must apply to its KV tensors (swap in/out, copy-on-write).

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::cache::allocator::{AllocatorError, BlockAllocator};
use crate::cache::block::{BlockId, BlockRef, Tier};
use crate::config::CacheConfig;
use crate::sequence::group::SequenceGroup;
use crate::sequence::{Sequence, SequenceStatus};

/// Answer to an admission question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// Fits now, above the watermark.
    Ok,
    /// Does not fit now but can once memory frees up.
    Later,
    /// Can never fit on this device; the request must be rejected.
    Never,
}

/// Manages the mapping between logical blocks of sequences and physical
/// blocks on the device and host tiers.
#[derive(Debug)]
pub struct BlockSpaceManager {
    block_size: usize,
    watermark_blocks: usize,
    enable_caching: bool,

    device: BlockAllocator,
    host: BlockAllocator,

    /// Logical clock driving LRU recency for the cached allocators.
    access_tick: u64,
}

impl BlockSpaceManager {
    pub fn new(config: &CacheConfig) -> Self {
        let (device, host) = if config.enable_prefix_caching {
            debug!("prefix caching enabled");
            (
                BlockAllocator::cached(Tier::Device, config.num_device_blocks),
                BlockAllocator::cached(Tier::Host, config.num_host_blocks),
            )
        } else {
            (
                BlockAllocator::uncached(Tier::Device, config.num_device_blocks),
                BlockAllocator::uncached(Tier::Host, config.num_host_blocks),
            )
        };
        Self {
            block_size: config.block_size,
            watermark_blocks: config.watermark_blocks(),
            enable_caching: config.enable_prefix_caching,
            device,
            host,
            access_tick: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_device_blocks(&self) -> usize {
        self.device.num_free()
    }

    pub fn num_free_host_blocks(&self) -> usize {
        self.host.num_free()
    }

    pub fn num_total_device_blocks(&self) -> usize {
        self.device.num_total()
    }

    pub fn ref_count(&self, r: BlockRef) -> u32 {
        self.allocator(r.tier).ref_count(r.block)
    }

    fn allocator(&self, tier: Tier) -> &BlockAllocator {
        match tier {
            Tier::Device => &self.device,
            Tier::Host => &self.host,
        }
    }

    fn allocator_mut(&mut self, tier: Tier) -> &mut BlockAllocator {
        match tier {
            Tier::Device => &mut self.device,
            Tier::Host => &mut self.host,
        }
    }

    /// Whether the group's prompt can be admitted onto the device.
    pub fn can_allocate(&self, group: &SequenceGroup) -> AllocStatus {
        // All sequences in a waiting group share one prompt; size off the
        // first one.
        let num_required = group
            .seqs_with_status(SequenceStatus::Waiting)
            .next()
            .map(|s| s.n_blocks())
            .unwrap_or(0);

        if num_required > self.device.num_total() {
            return AllocStatus::Never;
        }
        // The watermark keeps a small reserve free so that one admission
        // does not immediately force preemptions.
        if self.device.num_free() >= num_required + self.watermark_blocks {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    /// Allocate fresh device blocks for every waiting sequence of the
    /// group. Sequences share the prompt blocks; with prefix caching the
    /// blocks may be shared with other requests as well.
    pub fn allocate(&mut self, group: &mut SequenceGroup) -> Result<(), AllocatorError> {
        let mut first_table: Option<Vec<BlockRef>> = None;
        let waiting: Vec<usize> = group
            .seqs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SequenceStatus::Waiting)
            .map(|(i, _)| i)
            .collect();

        for &seq_idx in &waiting {
            let table = match first_table.clone() {
                None => {
                    let n_blocks = group.seqs[seq_idx].n_blocks();
                    let mut table = Vec::with_capacity(n_blocks);
                    for logical_idx in 0..n_blocks {
                        let (hash, num_hashed) = if self.enable_caching {
                            let seq = &group.seqs[seq_idx];
                            (
                                Some(seq.hash_of_block(logical_idx)),
                                seq.num_hashed_tokens_of_block(logical_idx),
                            )
                        } else {
                            (None, 0)
                        };
                        let block = self.device.allocate(hash, num_hashed)?;
                        table.push(BlockRef::device(block));
                    }
                    first_table = Some(table.clone());
                    table
                }
                Some(shared) => {
                    // Sibling sequences point at the same prompt blocks.
                    let mut seen = std::collections::HashSet::new();
                    for r in &shared {
                        if seen.insert(r.block) {
                            self.device.incr_ref(r.block);
                        }
                    }
                    shared
                }
            };
            group.seqs[seq_idx].block_table = table;
        }
        Ok(())
    }

    /// Whether every running sequence of the group could take one more
    /// block this iteration (the worst case for a decode step).
    pub fn can_append_slots(&self, group: &SequenceGroup) -> bool {
        let num_seqs = group.num_seqs_with_status(SequenceStatus::Running);
        num_seqs <= self.device.num_free()
    }

    fn allocate_last_physical_block(&mut self, seq: &Sequence) -> Result<BlockId, AllocatorError> {
        if !self.enable_caching {
            return self.device.allocate(None, 0);
        }
        let n_blocks = seq.n_blocks();
        let hash = if seq.len() % self.block_size == 0 {
            Some(seq.hash_of_block(n_blocks - 1))
        } else {
            None
        };
        self.device
            .allocate(hash, seq.num_hashed_tokens_of_block(n_blocks - 1))
    }

    /// Promote a just-filled last block to its content hash so later
    /// requests can share it. Merges with an existing cached block when
    /// the hash is already known.
    fn promote_last_block(
        &mut self,
        seq: &Sequence,
        last: BlockId,
    ) -> Result<BlockId, AllocatorError> {
        let new_hash = seq.hash_of_block(seq.n_blocks() - 1);
        if self.device.contains(new_hash) {
            self.device.free(last)?;
            self.device.allocate(Some(new_hash), 0)
        } else {
            self.device.update_hash(new_hash, last)?;
            Ok(last)
        }
    }

    /// Make room for the next token of `seq`.
    ///
    /// Returns copy edges `(src, dst)` when copy-on-write fired. An empty
    /// result means the token fits the existing table (possibly after a
    /// fresh block was appended).
    pub fn append_slots(
        &mut self,
        seq: &mut Sequence,
    ) -> Result<Vec<(BlockId, BlockId)>, AllocatorError> {
        let n_blocks = seq.n_blocks();

        if seq.block_table.len() < n_blocks {
            // The sequence grew past a block boundary; extend by one.
            debug_assert_eq!(seq.block_table.len(), n_blocks - 1);
            let new_block = self.allocate_last_physical_block(seq)?;
            seq.block_table.push(BlockRef::device(new_block));
            return Ok(Vec::new());
        }

        let last = *seq.block_table.last().expect("append on empty table");
        debug_assert_eq!(last.tier, Tier::Device);

        if self.device.ref_count(last.block) == 1 {
            if self.enable_caching && seq.len() % self.block_size == 0 {
                let maybe_new = self.promote_last_block(seq, last.block)?;
                let idx = seq.block_table.len() - 1;
                seq.block_table[idx] = BlockRef::device(maybe_new);
            }
            return Ok(Vec::new());
        }

        // Last block is shared: copy-on-write.
        let new_block = self.allocate_last_physical_block(seq)?;
        let idx = seq.block_table.len() - 1;
        seq.block_table[idx] = BlockRef::device(new_block);
        self.device.free(last.block)?;
        debug!(
            seq_id = seq.seq_id,
            src = last.block,
            dst = new_block,
            "copy-on-write on shared last block"
        );
        Ok(vec![(last.block, new_block)])
    }

    /// Distinct host-resident blocks across the group's live sequences.
    fn num_host_resident_blocks(&self, group: &SequenceGroup) -> usize {
        let mut seen = std::collections::HashSet::new();
        for seq in group.unfinished_seqs() {
            for r in &seq.block_table {
                if r.tier == Tier::Host {
                    seen.insert(r.block);
                }
            }
        }
        seen.len()
    }

    /// Distinct device-resident blocks across the group's live sequences.
    fn num_device_resident_blocks(&self, group: &SequenceGroup) -> usize {
        let mut seen = std::collections::HashSet::new();
        for seq in group.unfinished_seqs() {
            for r in &seq.block_table {
                if r.tier == Tier::Device {
                    seen.insert(r.block);
                }
            }
        }
        seen.len()
    }

    /// Whether a swapped group's host blocks fit back onto the device.
    /// Conservatively reserves one extra block per swapped sequence for
    /// the decode step right after the swap-in.
    pub fn can_swap_in(&self, group: &SequenceGroup) -> AllocStatus {
        let num_swapped_seqs = group.num_seqs_with_status(SequenceStatus::Swapped)
            + group.num_seqs_with_status(SequenceStatus::PartialSwapped);
        let num_required = self.num_host_resident_blocks(group) + num_swapped_seqs;

        if num_required > self.device.num_total() {
            AllocStatus::Never
        } else if self.device.num_free() >= num_required + self.watermark_blocks {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    /// Copy every host-resident block of the group back to the device,
    /// splicing the new device blocks into each table at the original
    /// index. Returns `(host_no, device_no)` pairs in allocation order.
    pub fn swap_in(
        &mut self,
        group: &mut SequenceGroup,
    ) -> Result<Vec<(BlockId, BlockId)>, AllocatorError> {
        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        let mut pairs = Vec::new();

        for seq in group.seqs.iter_mut().filter(|s| {
            matches!(
                s.status,
                SequenceStatus::Swapped | SequenceStatus::PartialSwapped
            )
        }) {
            seq.reset_swapped_out_blocks();
            for idx in 0..seq.block_table.len() {
                let entry = seq.block_table[idx];
                if entry.tier != Tier::Host {
                    continue;
                }
                let device_block = match mapping.get(&entry.block) {
                    Some(&dst) => {
                        self.device.incr_ref(dst);
                        dst
                    }
                    None => {
                        let hash = self.host.pool().get(entry.block).content_hash;
                        let nht = self.host.pool().get(entry.block).num_hashed_tokens;
                        let dst = if self.enable_caching {
                            self.device.allocate(hash, nht)?
                        } else {
                            self.device.allocate(None, 0)?
                        };
                        mapping.insert(entry.block, dst);
                        pairs.push((entry.block, dst));
                        dst
                    }
                };
                self.host.free(entry.block)?;
                seq.block_table[idx] = BlockRef::device(device_block);
            }
        }
        Ok(pairs)
    }

    /// Whether the host tier can take every device block of the group.
    pub fn can_swap_out(&self, group: &SequenceGroup) -> bool {
        self.num_device_resident_blocks(group) <= self.host.num_free()
    }

    /// Move device blocks of the group to the host tier.
    ///
    /// With `nblocks = None` every device-resident block moves. With
    /// `nblocks = Some(k)` exactly the next `k` blocks of each sequence
    /// move, starting from the first not-yet-swapped index; each
    /// sequence's swapped-block counter advances accordingly. Returns
    /// `(device_no, host_no)` pairs.
    pub fn swap_out(
        &mut self,
        group: &mut SequenceGroup,
        nblocks: Option<usize>,
    ) -> Result<Vec<(BlockId, BlockId)>, AllocatorError> {
        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        let mut pairs = Vec::new();

        for seq in group.seqs.iter_mut().filter(|s| {
            matches!(
                s.status,
                SequenceStatus::Running | SequenceStatus::PartialSwapped
            )
        }) {
            let table_len = seq.block_table.len();
            let (start, end) = match nblocks {
                Some(k) => {
                    let start = seq.swapped_out_blocks();
                    let end = (start + k).min(table_len);
                    seq.add_swapped_out_blocks(end - start);
                    (start, end)
                }
                None => {
                    let start = seq.swapped_out_blocks();
                    seq.add_swapped_out_blocks(table_len - start);
                    (start, table_len)
                }
            };

            for idx in start..end {
                let entry = seq.block_table[idx];
                if entry.tier != Tier::Device {
                    warn!(
                        seq_id = seq.seq_id,
                        idx, "swap-out index already host resident"
                    );
                    continue;
                }
                let host_block = match mapping.get(&entry.block) {
                    Some(&dst) => {
                        self.host.incr_ref(dst);
                        dst
                    }
                    None => {
                        let hash = self.device.pool().get(entry.block).content_hash;
                        let nht = self.device.pool().get(entry.block).num_hashed_tokens;
                        let dst = if self.enable_caching {
                            self.host.allocate(hash, nht)?
                        } else {
                            self.host.allocate(None, 0)?
                        };
                        mapping.insert(entry.block, dst);
                        pairs.push((entry.block, dst));
                        dst
                    }
                };
                self.device.free(entry.block)?;
                seq.block_table[idx] = BlockRef::host(host_block);
            }
        }
        Ok(pairs)
    }

    /// Return every block of the sequence to its allocator and detach the
    /// table. No-op when the table is already gone.
    pub fn free(&mut self, seq: &mut Sequence) -> Result<(), AllocatorError> {
        if seq.block_table.is_empty() {
            return Ok(());
        }
        let table = std::mem::take(&mut seq.block_table);
        for entry in table {
            self.allocator_mut(entry.tier).free(entry.block)?;
        }
        Ok(())
    }

    /// Duplicate the parent's table into the child and add one reference
    /// per distinct block.
    pub fn fork(&mut self, parent: &Sequence, child: &mut Sequence) {
        child.block_table = parent.block_table.clone();
        let mut seen = std::collections::HashSet::new();
        for entry in &parent.block_table {
            if seen.insert(*entry) {
                self.allocator_mut(entry.tier).incr_ref(entry.block);
            }
        }
    }

    /// Stamp every block of the sequence with a fresh logical access tick
    /// (cached allocators only; drives LRU eviction order).
    pub fn access_all_blocks_in_seq(&mut self, seq: &Sequence) {
        if !self.enable_caching {
            return;
        }
        self.access_tick += 1;
        let tick = self.access_tick;
        for entry in &seq.block_table {
            let pool = match entry.tier {
                Tier::Device => self.device.pool_mut(),
                Tier::Host => self.host.pool_mut(),
            };
            pool.get_mut(entry.block).last_accessed = tick;
        }
    }

    fn compute_full_blocks_in_seq(&mut self, seq: &Sequence) {
        if seq.block_table.is_empty() {
            return;
        }
        let max_full_block = match (seq.len() / self.block_size).checked_sub(1) {
            Some(n) => n,
            None => return,
        };
        let pool = self.device.pool_mut();
        for idx in (0..max_full_block).rev() {
            let entry = seq.block_table[idx];
            if entry.tier != Tier::Device {
                continue;
            }
            let meta = pool.get_mut(entry.block);
            if meta.computed {
                break;
            }
            meta.computed = true;
        }
    }

    /// Mark every fully-populated block of the group as computed; enables
    /// prefix reuse for future requests sharing those blocks.
    pub fn mark_blocks_as_computed(&mut self, group: &SequenceGroup) {
        if !self.enable_caching {
            return;
        }
        for seq in &group.seqs {
            self.compute_full_blocks_in_seq(seq);
        }
    }

    fn all_computed_blocks(&self, seq: &Sequence) -> Vec<BlockId> {
        if seq.block_table.is_empty() {
            return Vec::new();
        }
        // The last block is excluded so a fully cached prompt still leaves
        // work for the model runner.
        seq.block_table[..seq.block_table.len() - 1]
            .iter()
            .take_while(|r| r.tier == Tier::Device && self.device.pool().get(r.block).computed)
            .map(|r| r.block)
            .collect()
    }

    /// Longest common prefix of computed block numbers across sequences;
    /// prefill can skip those blocks.
    pub fn get_common_computed_block_ids(&self, seqs: &[&Sequence]) -> Vec<BlockId> {
        if !self.enable_caching {
            return Vec::new();
        }
        let lists: Vec<Vec<BlockId>> = seqs
            .iter()
            .map(|s| self.all_computed_blocks(s))
            .filter(|l| !l.is_empty())
            .collect();
        let Some(first) = lists.first() else {
            return Vec::new();
        };
        let mut prefix_len = first.len();
        for list in &lists[1..] {
            let common = first
                .iter()
                .zip(list.iter())
                .take_while(|(a, b)| a == b)
                .count();
            prefix_len = prefix_len.min(common);
        }
        first[..prefix_len].to_vec()
    }
}
