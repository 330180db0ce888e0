//! Scheduler outputs: the per-iteration batch plan and the intermediate
//! per-queue results it is assembled from.

use crate::cache::block::BlockId;

/// One scheduled group and the number of tokens it contributes to the
/// batch: the (possibly chunked) remaining prompt for prefill entries,
/// one per running sequence for decodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledGroup {
    pub request_id: String,
    pub token_chunk_size: usize,
}

/// The scheduling decision for one iteration.
///
/// `scheduled` lists prefill entries before decode entries. The block
/// movement vectors name physical block-number pairs the executor must
/// apply to its KV tensors before running the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    pub scheduled: Vec<ScheduledGroup>,

    /// How many leading entries of `scheduled` are prefills.
    pub num_prefill_groups: usize,

    pub num_batched_tokens: usize,

    /// Host to device copies, as `(host_no, device_no)`.
    pub blocks_to_swap_in: Vec<(BlockId, BlockId)>,

    /// Device to host copies, as `(device_no, host_no)`.
    pub blocks_to_swap_out: Vec<(BlockId, BlockId)>,

    /// Copy-on-write edges, as `(src_no, dst_no)`.
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,

    /// Requests rejected as infeasible this iteration.
    pub ignored: Vec<String>,

    pub num_lookahead_slots: usize,
    pub running_queue_size: usize,

    /// Groups preempted this iteration (recompute plus swap).
    pub preempted: usize,

    pub num_waiting_to_running: usize,
    pub num_running_to_waiting: usize,

    /// Prompt tokens re-run because of recompute preemptions.
    pub recomputed_token_nums: usize,
}

impl BatchPlan {
    /// Nothing to execute; ignored groups do not count.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
            && self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
            && self.blocks_to_copy.is_empty()
    }
}

/// Result of consuming the running queue.
#[derive(Debug, Default)]
pub(crate) struct RunningOutputs {
    pub decode_groups: Vec<ScheduledGroup>,
    /// Chunked or recomputed prefills still in the running queue.
    pub prefill_groups: Vec<ScheduledGroup>,
    pub preempted: Vec<String>,
    pub swapped_out: Vec<String>,
    pub blocks_to_swap_out: Vec<(BlockId, BlockId)>,
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,
    pub recomputed_token_nums: usize,
}

/// Result of consuming the swapped queue.
#[derive(Debug, Default)]
pub(crate) struct SwappedInOutputs {
    pub decode_groups: Vec<ScheduledGroup>,
    pub prefill_groups: Vec<ScheduledGroup>,
    pub blocks_to_swap_in: Vec<(BlockId, BlockId)>,
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,
    pub infeasible: Vec<String>,
}

/// Result of consuming the waiting queue.
#[derive(Debug, Default)]
pub(crate) struct PrefillOutputs {
    pub scheduled: Vec<ScheduledGroup>,
    pub ignored: Vec<String>,
}
