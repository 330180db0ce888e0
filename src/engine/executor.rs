//! The executor boundary.
//!
//! The core hands the executor one [`BatchPlan`] plus per-group metadata
//! per iteration; the executor applies the swap/copy block mappings to
//! its KV tensors, runs the model over the packed batch, and returns one
//! sampled token per sequence. [`SimulatedExecutor`] is a deterministic
//! stand-in used by the demo driver and tests.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::block::BlockId;
use crate::sched::plan::BatchPlan;
use crate::sequence::sampling::SamplingParams;
use crate::sequence::{Logprob, SeqId, TokenLogprobs};

/// Per-sequence slice of the batch handed to the executor.
#[derive(Debug, Clone)]
pub struct SeqMetadata {
    pub seq_id: SeqId,
    pub len: usize,
    pub num_computed_tokens: usize,
    pub last_token_id: u32,
    /// Device block numbers backing this sequence, in logical order.
    pub block_table: Vec<BlockId>,
}

/// Per-group slice of the batch.
#[derive(Debug, Clone)]
pub struct GroupMetadata {
    pub request_id: String,
    pub is_prompt: bool,
    pub token_chunk_size: usize,
    /// False on prefill iterations: those only populate the KV cache;
    /// tokens are sampled on decode iterations.
    pub do_sample: bool,
    pub sampling_params: SamplingParams,
    pub seqs: Vec<SeqMetadata>,
    /// Prefix blocks whose contents are already computed (prefix caching).
    pub computed_block_ids: Vec<BlockId>,
}

/// One sampled token for one sequence.
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    /// The sequence this sample was drawn from. Several samples may share
    /// a parent right after prefill when `best_of > 1`.
    pub parent_seq_id: SeqId,
    pub token_id: u32,
    pub logprobs: TokenLogprobs,
}

/// Executor results for one scheduled group.
#[derive(Debug, Clone)]
pub struct SequenceGroupOutput {
    pub request_id: String,
    pub samples: Vec<SequenceOutput>,
}

/// Synchronous model executor callback. Called exactly once per
/// non-empty iteration; outputs are positionally aligned with
/// `plan.scheduled`.
pub trait ModelExecutor {
    fn execute(&mut self, plan: &BatchPlan, batch: &[GroupMetadata]) -> Vec<SequenceGroupOutput>;
}

/// Deterministic fake model: seeded sampling, EOS with a fixed
/// probability, and bookkeeping of the block mappings it was asked to
/// apply.
pub struct SimulatedExecutor {
    rng: StdRng,
    vocab_size: u32,
    eos_token_id: u32,
    eos_prob: f64,

    pub applied_swap_in_blocks: usize,
    pub applied_swap_out_blocks: usize,
    pub applied_copies: usize,
}

impl SimulatedExecutor {
    pub fn new(seed: u64, vocab_size: u32, eos_token_id: u32, eos_prob: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            vocab_size,
            eos_token_id,
            eos_prob,
            applied_swap_in_blocks: 0,
            applied_swap_out_blocks: 0,
            applied_copies: 0,
        }
    }

    fn sample(&mut self, parent_seq_id: SeqId) -> SequenceOutput {
        let token_id = if self.rng.gen_bool(self.eos_prob) {
            self.eos_token_id
        } else {
            // Ordinary tokens stay clear of the EOS id so termination is
            // governed by eos_prob alone.
            self.rng.gen_range(self.eos_token_id + 1..self.vocab_size)
        };
        let mut logprobs: TokenLogprobs = HashMap::new();
        logprobs.insert(
            token_id,
            Logprob {
                logprob: -self.rng.gen_range(0.05..2.0),
                rank: Some(1),
            },
        );
        if token_id != self.eos_token_id {
            logprobs.insert(
                self.eos_token_id,
                Logprob {
                    logprob: -self.rng.gen_range(2.0..12.0),
                    rank: Some(self.rng.gen_range(2..2000)),
                },
            );
        }
        SequenceOutput {
            parent_seq_id,
            token_id,
            logprobs,
        }
    }
}

impl ModelExecutor for SimulatedExecutor {
    fn execute(&mut self, plan: &BatchPlan, batch: &[GroupMetadata]) -> Vec<SequenceGroupOutput> {
        // A real executor copies KV tensors here; we only account for it.
        self.applied_swap_in_blocks += plan.blocks_to_swap_in.len();
        self.applied_swap_out_blocks += plan.blocks_to_swap_out.len();
        self.applied_copies += plan.blocks_to_copy.len();

        batch
            .iter()
            .map(|meta| {
                let mut samples = Vec::new();
                if meta.do_sample {
                    let best_of = meta.sampling_params.best_of;
                    if best_of > meta.seqs.len() {
                        // First decode after the prompt: emit best_of
                        // candidates off the single prompt sequence.
                        let parent = meta.seqs[0].seq_id;
                        for _ in 0..best_of {
                            samples.push(self.sample(parent));
                        }
                    } else {
                        for seq in &meta.seqs {
                            samples.push(self.sample(seq.seq_id));
                        }
                    }
                }
                SequenceGroupOutput {
                    request_id: meta.request_id.clone(),
                    samples,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(request_id: &str, is_prompt: bool, do_sample: bool, n_seqs: usize) -> GroupMetadata {
        GroupMetadata {
            request_id: request_id.to_string(),
            is_prompt,
            token_chunk_size: 1,
            do_sample,
            sampling_params: SamplingParams::default(),
            seqs: (0..n_seqs)
                .map(|i| SeqMetadata {
                    seq_id: i as SeqId,
                    len: 8,
                    num_computed_tokens: 8,
                    last_token_id: 5,
                    block_table: vec![0],
                })
                .collect(),
            computed_block_ids: Vec::new(),
        }
    }

    #[test]
    fn test_one_sample_per_decode_seq() {
        let mut exec = SimulatedExecutor::new(0, 1000, 2, 0.0);
        let out = exec.execute(&BatchPlan::default(), &[meta("r", false, true, 3)]);
        assert_eq!(out[0].samples.len(), 3);
    }

    #[test]
    fn test_no_samples_mid_chunk() {
        let mut exec = SimulatedExecutor::new(0, 1000, 2, 0.0);
        let out = exec.execute(&BatchPlan::default(), &[meta("r", true, false, 1)]);
        assert!(out[0].samples.is_empty());
    }

    #[test]
    fn test_best_of_fanout_on_first_decode() {
        let mut exec = SimulatedExecutor::new(0, 1000, 2, 0.0);
        let mut m = meta("r", false, true, 1);
        m.sampling_params.best_of = 4;
        let out = exec.execute(&BatchPlan::default(), &[m]);
        assert_eq!(out[0].samples.len(), 4);
        assert!(out[0].samples.iter().all(|s| s.parent_seq_id == 0));
    }

    #[test]
    fn test_same_seed_same_tokens() {
        let mut a = SimulatedExecutor::new(42, 1000, 2, 0.1);
        let mut b = SimulatedExecutor::new(42, 1000, 2, 0.1);
        let out_a = a.execute(&BatchPlan::default(), &[meta("r", false, true, 1)]);
        let out_b = b.execute(&BatchPlan::default(), &[meta("r", false, true, 1)]);
        assert_eq!(out_a[0].samples[0].token_id, out_b[0].samples[0].token_id);
    }
}
