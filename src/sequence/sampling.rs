//! Sampling parameters attached to a request.

use serde::{Deserialize, Serialize};

/// Immutable sampling configuration for one request. Pure values; the
/// scheduler only reads the fields that shape memory and termination
/// (`best_of`, `max_tokens`, `min_tokens`, stop conditions), the rest is
/// passed through to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of completions to return.
    pub n: usize,

    /// Number of parallel sequences generated before picking `n` of them.
    pub best_of: usize,

    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,

    /// Suppress EOS and stop sequences until this many tokens exist.
    pub min_tokens: usize,

    /// Hard cap on generated tokens.
    pub max_tokens: usize,

    pub use_beam_search: bool,

    /// Number of top logprobs the executor should report per token.
    pub logprobs: Option<usize>,

    /// Keep generating through the EOS token.
    pub ignore_eos: bool,

    /// Token-id sequences that terminate generation when they appear as a
    /// suffix of the output.
    pub stop_sequences: Vec<Vec<u32>>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: 1,
            best_of: 1,
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            min_tokens: 0,
            max_tokens: 16,
            use_beam_search: false,
            logprobs: None,
            ignore_eos: false,
            stop_sequences: Vec::new(),
        }
    }
}

impl SamplingParams {
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    /// The larger of `n` and `best_of`; how many sequences the group can
    /// hold at its widest.
    pub fn num_parallel_seqs(&self) -> usize {
        self.n.max(self.best_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = SamplingParams::default();
        assert_eq!(p.best_of, 1);
        assert_eq!(p.max_tokens, 16);
        assert!(!p.ignore_eos);
    }

    #[test]
    fn test_parallel_seqs() {
        let p = SamplingParams {
            n: 2,
            best_of: 4,
            ..Default::default()
        };
        assert_eq!(p.num_parallel_seqs(), 4);
    }
}
