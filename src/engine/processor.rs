//! Output processing: applies sampled tokens back onto sequences and
//! drives the stop conditions that finish them.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::engine::executor::SequenceGroupOutput;
use crate::sched::plan::BatchPlan;
use crate::sched::scheduler::Scheduler;
use crate::sequence::sampling::SamplingParams;
use crate::sequence::{SeqId, Sequence, SequenceStatus};

/// Applies executor outputs to the scheduled groups.
pub struct OutputProcessor {
    max_model_len: usize,
}

impl OutputProcessor {
    pub fn new(max_model_len: usize) -> Self {
        Self { max_model_len }
    }

    /// Fold one iteration's sampler outputs into the scheduler state:
    /// advance computed-token counts, fork `best_of` siblings on the
    /// first sample after prefill, append tokens, apply stop conditions
    /// and free finished sequences. Outputs for requests the scheduler no
    /// longer knows (aborted mid-flight) are dropped.
    pub fn process(
        &self,
        scheduler: &mut Scheduler,
        plan: &BatchPlan,
        outputs: &[SequenceGroupOutput],
        next_seq_id: &mut SeqId,
        now: f64,
    ) {
        let by_request: HashMap<&str, &SequenceGroupOutput> = outputs
            .iter()
            .map(|o| (o.request_id.as_str(), o))
            .collect();

        for entry in &plan.scheduled {
            let Some((group, block_manager)) = scheduler.group_and_manager_mut(&entry.request_id)
            else {
                debug!(request_id = %entry.request_id, "dropping outputs for vanished request");
                continue;
            };

            let samples = by_request
                .get(entry.request_id.as_str())
                .map(|o| o.samples.as_slice())
                .unwrap_or(&[]);

            let params = group.sampling_params.clone();

            // Resolve every sample to a target sequence first: extra
            // samples for one parent materialize forked siblings, and all
            // forks must clone the parent before any token lands on it.
            let mut seen_parents: HashSet<SeqId> = HashSet::new();
            let mut targets: Vec<(SeqId, usize)> = Vec::with_capacity(samples.len());
            for (sample_idx, sample) in samples.iter().enumerate() {
                if seen_parents.insert(sample.parent_seq_id) {
                    targets.push((sample.parent_seq_id, sample_idx));
                    continue;
                }
                let child = {
                    let Some(parent) = group.find(sample.parent_seq_id) else {
                        continue;
                    };
                    let mut child = parent.fork(*next_seq_id);
                    block_manager.fork(parent, &mut child);
                    child
                };
                *next_seq_id += 1;
                targets.push((child.seq_id, sample_idx));
                group.add(child);
            }

            for (target_seq_id, sample_idx) in targets {
                let sample = &samples[sample_idx];
                let Some(seq) = group.find_mut(target_seq_id) else {
                    continue;
                };
                if seq.is_finished() {
                    continue;
                }
                seq.append_token_id(sample.token_id, &sample.logprobs);
                check_stop(seq, &params, self.max_model_len);
                if seq.is_finished() {
                    block_manager
                        .free(seq)
                        .expect("freeing finished sequence");
                }
            }

            // Decode appends land before the computed-token advance so the
            // count covers the token the model just consumed; on pure
            // prefill iterations (no samples) this is the whole chunk.
            group.update_num_computed_tokens(entry.token_chunk_size);

            group.maybe_set_first_token_time(now);
            if group.is_finished() {
                group.metrics.finished_time = Some(now);
            }
        }
    }
}

/// Transition a sequence to a terminal state when a stop condition hit.
fn check_stop(seq: &mut Sequence, params: &SamplingParams, max_model_len: usize) {
    // EOS and stop sequences are suppressed until min_tokens.
    if seq.output_len() >= params.min_tokens {
        for stop in &params.stop_sequences {
            if !stop.is_empty() && seq.output_token_ids().ends_with(stop) {
                seq.stop_reason = stop.last().copied();
                seq.status = SequenceStatus::FinishedStopped;
                return;
            }
        }
        if !params.ignore_eos {
            if let Some(eos) = seq.eos_token_id() {
                if seq.last_token_id() == eos {
                    seq.status = SequenceStatus::FinishedStopped;
                    return;
                }
            }
        }
    }

    if seq.len() >= max_model_len {
        seq.status = SequenceStatus::FinishedLengthCapped;
        return;
    }
    if seq.output_len() >= params.max_tokens {
        seq.status = SequenceStatus::FinishedLengthCapped;
    }
}
