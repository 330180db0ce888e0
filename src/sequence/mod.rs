//! Generation streams and their scheduling state.
//!
//! - [`Sequence`]: one generation stream with its status state machine,
//!   block table and EOS-signal window
//! - [`group`]: SequenceGroup, the scheduling unit (one user request)
//! - [`sampling`]: SamplingParams value type

pub mod group;
pub mod sampling;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::cache::block::BlockRef;

/// Unique sequence identifier, assigned by the engine.
pub type SeqId = u64;

/// Number of recent EOS observations a sequence must accumulate before the
/// termination-estimating policies trust its window.
pub const EOS_ESTIMATION_WINDOW: usize = 15;

/// Log-probability assumed for the EOS token on steps where the sampler
/// did not report it (ln 0.1).
pub const DEFAULT_EOS_LOGPROB: f64 = -2.302_585_092_994_046;

/// Log-probability of one sampled token together with its vocabulary rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Logprob {
    pub logprob: f64,
    /// Vocabulary rank of the token (1 = most likely), when known.
    pub rank: Option<u32>,
}

/// Per-step sampler output for one token: token id to logprob info.
pub type TokenLogprobs = HashMap<u32, Logprob>;

/// Status of a sequence.
///
/// Transitions: `Waiting -> Running` on admission, `Running -> Waiting`
/// on recompute preemption, `Running -> Swapped | PartialSwapped` on
/// swap-out, `Swapped | PartialSwapped -> Running` on swap-in. The four
/// `Finished*` states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Swapped,
    /// A suffix of the block table lives on the host tier while the rest
    /// stays on the device.
    PartialSwapped,
    FinishedStopped,
    FinishedLengthCapped,
    FinishedAborted,
    FinishedIgnored,
}

impl SequenceStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SequenceStatus::FinishedStopped
                | SequenceStatus::FinishedLengthCapped
                | SequenceStatus::FinishedAborted
                | SequenceStatus::FinishedIgnored
        )
    }

    /// OpenAI-style finish reason, `None` while unfinished. Ignored
    /// requests report "length" like the length-capped ones.
    pub fn finished_reason(&self) -> Option<&'static str> {
        match self {
            SequenceStatus::FinishedStopped => Some("stop"),
            SequenceStatus::FinishedLengthCapped | SequenceStatus::FinishedIgnored => {
                Some("length")
            }
            SequenceStatus::FinishedAborted => Some("abort"),
            _ => None,
        }
    }
}

/// Whether the sequence is still processing its prompt or generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStage {
    Prefill,
    Decode,
}

/// One generation stream.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub seq_id: SeqId,
    pub block_size: usize,
    pub status: SequenceStatus,
    /// Token id that triggered a stop, if any.
    pub stop_reason: Option<u32>,

    /// Ordered block table covering the first `n_blocks` logical blocks.
    /// Entries may point at either tier while (partially) swapped.
    pub block_table: Vec<BlockRef>,

    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    cumulative_logprob: f64,
    num_computed_tokens: usize,
    stage: SequenceStage,

    eos_token_id: Option<u32>,
    /// Sliding windows of recent EOS log-probabilities and ranks, feeding
    /// the termination-estimating policies. Rank -1 marks steps where the
    /// sampler did not surface the EOS token.
    eos_logprobs: VecDeque<f64>,
    eos_ranks: VecDeque<i64>,
    min_eos_rank: Option<u32>,

    /// Blocks of this sequence already moved to the host tier, counted
    /// from the front of the table (partial swap bookkeeping).
    swapped_out_blocks: usize,
}

impl Sequence {
    pub fn new(
        seq_id: SeqId,
        prompt_token_ids: Vec<u32>,
        block_size: usize,
        eos_token_id: Option<u32>,
    ) -> Self {
        Self {
            seq_id,
            block_size,
            status: SequenceStatus::Waiting,
            stop_reason: None,
            block_table: Vec::new(),
            prompt_token_ids,
            output_token_ids: Vec::new(),
            cumulative_logprob: 0.0,
            num_computed_tokens: 0,
            stage: SequenceStage::Prefill,
            eos_token_id,
            eos_logprobs: VecDeque::new(),
            eos_ranks: VecDeque::new(),
            min_eos_rank: None,
            swapped_out_blocks: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    pub fn last_token_id(&self) -> u32 {
        *self
            .output_token_ids
            .last()
            .unwrap_or_else(|| self.prompt_token_ids.last().expect("empty sequence"))
    }

    pub fn cumulative_logprob(&self) -> f64 {
        self.cumulative_logprob
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// Number of logical blocks needed for the current length.
    pub fn n_blocks(&self) -> usize {
        self.len().div_ceil(self.block_size)
    }

    pub fn stage(&self) -> SequenceStage {
        self.stage
    }

    pub fn is_prefill(&self) -> bool {
        self.stage == SequenceStage::Prefill
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Prompt (plus regenerated output, after a recompute preemption)
    /// tokens not yet run through the model.
    pub fn num_uncomputed_tokens(&self) -> usize {
        self.len() - self.num_computed_tokens
    }

    /// Tokens this sequence contributes to the next batch: the remaining
    /// uncomputed span during prefill, one during decode.
    pub fn num_new_tokens(&self) -> usize {
        if self.stage == SequenceStage::Decode {
            1
        } else {
            self.num_uncomputed_tokens()
        }
    }

    pub fn update_num_computed_tokens(&mut self, num_new: usize) {
        self.num_computed_tokens += num_new;
        debug_assert!(self.num_computed_tokens <= self.len());
        if self.num_uncomputed_tokens() == 0 {
            self.stage = SequenceStage::Decode;
        }
    }

    /// Reset computation state after a recompute preemption: the whole
    /// stream (prompt and generated output) becomes prefill work again.
    pub fn reset_for_recompute(&mut self) {
        self.num_computed_tokens = 0;
        self.stage = SequenceStage::Prefill;
        self.swapped_out_blocks = 0;
    }

    pub fn swapped_out_blocks(&self) -> usize {
        self.swapped_out_blocks
    }

    pub fn add_swapped_out_blocks(&mut self, n: usize) {
        self.swapped_out_blocks = (self.swapped_out_blocks + n).min(self.n_blocks());
    }

    pub fn reset_swapped_out_blocks(&mut self) {
        self.swapped_out_blocks = 0;
    }

    /// Append one sampled token and fold its EOS signal into the window.
    pub fn append_token_id(&mut self, token_id: u32, logprobs: &TokenLogprobs) {
        if let Some(lp) = logprobs.get(&token_id) {
            self.cumulative_logprob += lp.logprob;
        }
        self.output_token_ids.push(token_id);

        let eos = match self.eos_token_id {
            Some(eos) => eos,
            None => return,
        };
        match logprobs.get(&eos) {
            Some(lp) => {
                self.push_eos_observation(lp.logprob, lp.rank.map(|r| r as i64).unwrap_or(-1));
                if let Some(rank) = lp.rank {
                    self.min_eos_rank = Some(match self.min_eos_rank {
                        Some(prev) => prev.min(rank),
                        None => rank,
                    });
                }
            }
            None => self.push_eos_observation(DEFAULT_EOS_LOGPROB, -1),
        }
    }

    fn push_eos_observation(&mut self, logprob: f64, rank: i64) {
        self.eos_logprobs.push_back(logprob);
        self.eos_ranks.push_back(rank);
        while self.eos_logprobs.len() > EOS_ESTIMATION_WINDOW {
            self.eos_logprobs.pop_front();
            self.eos_ranks.pop_front();
        }
    }

    /// The EOS log-probability window, `None` until it has filled.
    pub fn eos_logprob_window(&self) -> Option<&VecDeque<f64>> {
        (self.eos_logprobs.len() >= EOS_ESTIMATION_WINDOW).then_some(&self.eos_logprobs)
    }

    /// The EOS rank window (-1 marks unobserved steps), `None` until full.
    pub fn eos_rank_window(&self) -> Option<&VecDeque<i64>> {
        (self.eos_ranks.len() >= EOS_ESTIMATION_WINDOW).then_some(&self.eos_ranks)
    }

    pub fn min_eos_rank(&self) -> Option<u32> {
        self.min_eos_rank
    }

    /// Content hash identifying logical block `logical_idx`: the token
    /// prefix it completes. Used for prefix-cache sharing.
    pub fn hash_of_block(&self, logical_idx: usize) -> u64 {
        let num_tokens = self.num_hashed_tokens_of_block(logical_idx);
        let mut hasher = DefaultHasher::new();
        let prompt_take = num_tokens.min(self.prompt_token_ids.len());
        self.prompt_token_ids[..prompt_take].hash(&mut hasher);
        if num_tokens > prompt_take {
            // A not-yet-full last block hashes whatever tokens exist.
            let output_take = (num_tokens - prompt_take).min(self.output_token_ids.len());
            self.output_token_ids[..output_take].hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn num_hashed_tokens_of_block(&self, logical_idx: usize) -> usize {
        (logical_idx + 1) * self.block_size
    }

    /// Clone this stream under a new id (beam/parallel-sampling branch).
    /// Block-table reference counts are the block manager's job.
    pub fn fork(&self, new_seq_id: SeqId) -> Sequence {
        let mut child = self.clone();
        child.seq_id = new_seq_id;
        child
    }
}
