//! Client-facing request outputs.

use crate::sequence::group::{RequestMetrics, SequenceGroup};

/// One completion stream of a request.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    /// Position among the request's parallel sequences.
    pub index: usize,
    pub token_ids: Vec<u32>,
    pub cumulative_logprob: f64,
    /// "stop", "length" or "abort" once finished.
    pub finish_reason: Option<&'static str>,
}

/// Snapshot of a request after an engine step.
#[derive(Debug, Clone)]
pub struct RequestOutput {
    pub request_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
    pub metrics: RequestMetrics,
}

impl RequestOutput {
    pub fn from_group(group: &SequenceGroup) -> Self {
        let outputs = group
            .seqs
            .iter()
            .enumerate()
            .map(|(index, seq)| CompletionOutput {
                index,
                token_ids: seq.output_token_ids().to_vec(),
                cumulative_logprob: seq.cumulative_logprob(),
                finish_reason: seq.status.finished_reason(),
            })
            .collect();
        Self {
            request_id: group.request_id.clone(),
            prompt_token_ids: group.prompt_token_ids().to_vec(),
            outputs,
            finished: group.is_finished(),
            metrics: group.metrics.clone(),
        }
    }
}
