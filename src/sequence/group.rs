//! Sequence groups: the unit the scheduler moves between queues.

use crate::sequence::sampling::SamplingParams;
use crate::sequence::{SeqId, Sequence, SequenceStatus};

/// Request-level timing and scheduling counters.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Arrival time in seconds.
    pub arrival_time: f64,
    pub first_scheduled_time: Option<f64>,
    pub first_token_time: Option<f64>,
    /// Seconds between arrival and first scheduling.
    pub time_in_queue: Option<f64>,
    pub finished_time: Option<f64>,

    /// Consecutive iterations spent waiting since last scheduled.
    pub waiting_iter_count: u64,

    /// Times this request was swapped out.
    pub swap_count: u64,
}

impl RequestMetrics {
    pub fn new(arrival_time: f64) -> Self {
        Self {
            arrival_time,
            first_scheduled_time: None,
            first_token_time: None,
            time_in_queue: None,
            finished_time: None,
            waiting_iter_count: 0,
            swap_count: 0,
        }
    }
}

/// A group of sequences generated from the same prompt; one user request.
///
/// Created with a single prompt sequence; parallel sampling forks
/// `best_of` siblings once the prompt is computed. Destroyed after every
/// constituent sequence reached a terminal state and its blocks were
/// returned to the block manager.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    pub request_id: String,
    pub seqs: Vec<Sequence>,
    pub sampling_params: SamplingParams,
    pub metrics: RequestMetrics,

    /// When the group was last swapped out, for queueing telemetry.
    pub swap_out_moment: Option<f64>,

    /// Skip-join MLFQ level, assigned lazily on first scoring.
    pub mlfq_level: Option<u32>,
    /// Whether the MLFQ starvation promotion already fired.
    pub mlfq_promoted: bool,

    /// Last priority rate computed by the tradeoff policy; queue averages
    /// use it for groups without an EOS signal yet.
    pub priority_rate: f64,
}

impl SequenceGroup {
    pub fn new(
        request_id: impl Into<String>,
        seq: Sequence,
        sampling_params: SamplingParams,
        arrival_time: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            seqs: vec![seq],
            sampling_params,
            metrics: RequestMetrics::new(arrival_time),
            swap_out_moment: None,
            mlfq_level: None,
            mlfq_promoted: false,
            priority_rate: 0.0,
        }
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        // All sequences share the prompt; read it off the first.
        self.seqs[0].prompt_token_ids()
    }

    pub fn prompt_len(&self) -> usize {
        self.seqs[0].prompt_len()
    }

    pub fn seqs_with_status(&self, status: SequenceStatus) -> impl Iterator<Item = &Sequence> {
        self.seqs.iter().filter(move |s| s.status == status)
    }

    pub fn seqs_with_status_mut(
        &mut self,
        status: SequenceStatus,
    ) -> impl Iterator<Item = &mut Sequence> {
        self.seqs.iter_mut().filter(move |s| s.status == status)
    }

    pub fn find(&self, seq_id: SeqId) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.seq_id == seq_id)
    }

    pub fn find_mut(&mut self, seq_id: SeqId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id == seq_id)
    }

    pub fn add(&mut self, seq: Sequence) {
        debug_assert!(self.find(seq.seq_id).is_none());
        self.seqs.push(seq);
    }

    pub fn num_seqs(&self) -> usize {
        self.seqs.len()
    }

    pub fn num_seqs_with_status(&self, status: SequenceStatus) -> usize {
        self.seqs_with_status(status).count()
    }

    pub fn unfinished_seqs(&self) -> impl Iterator<Item = &Sequence> {
        self.seqs.iter().filter(|s| !s.is_finished())
    }

    pub fn num_unfinished_seqs(&self) -> usize {
        self.unfinished_seqs().count()
    }

    pub fn is_finished(&self) -> bool {
        self.seqs.iter().all(|s| s.is_finished())
    }

    /// Every live sequence is in the same stage; the group is prefill iff
    /// its first unfinished sequence is.
    pub fn is_prefill(&self) -> bool {
        self.unfinished_seqs()
            .next()
            .map(|s| s.is_prefill())
            .unwrap_or(false)
    }

    /// Upper bound on sequences running in parallel over the rest of the
    /// request's lifetime.
    pub fn max_num_running_seqs(&self) -> usize {
        let params = &self.sampling_params;
        if params.use_beam_search {
            params.best_of
        } else if params.best_of > self.num_seqs() {
            // Prompt stage: forks have not happened yet.
            params.best_of
        } else {
            self.num_unfinished_seqs()
        }
    }

    pub fn num_uncomputed_tokens(&self) -> usize {
        self.unfinished_seqs()
            .map(|s| s.num_uncomputed_tokens())
            .sum()
    }

    pub fn update_num_computed_tokens(&mut self, num_new: usize) {
        for seq in self.seqs.iter_mut().filter(|s| !s.is_finished()) {
            seq.update_num_computed_tokens(num_new);
        }
    }

    /// Combined length of all sequences (prompt plus output).
    pub fn seq_len(&self) -> usize {
        self.seqs.iter().map(|s| s.len()).sum()
    }

    /// Total generated tokens across sequences.
    pub fn decode_len(&self) -> usize {
        self.seqs.iter().map(|s| s.output_len()).sum()
    }

    /// Total logical blocks across sequences, the group's device footprint
    /// ceiling.
    pub fn total_token_blocks(&self) -> usize {
        self.seqs.iter().map(|s| s.n_blocks()).sum()
    }

    pub fn max_tokens(&self) -> usize {
        self.sampling_params.max_tokens
    }

    pub fn update_waiting_iter_count(&mut self) {
        self.metrics.waiting_iter_count += 1;
    }

    pub fn reset_waiting_iter_count(&mut self) {
        self.metrics.waiting_iter_count = 0;
    }

    pub fn maybe_set_first_scheduled_time(&mut self, now: f64) {
        if self.metrics.first_scheduled_time.is_none() {
            self.metrics.first_scheduled_time = Some(now);
            self.metrics.time_in_queue = Some(now - self.metrics.arrival_time);
        }
    }

    pub fn maybe_set_first_token_time(&mut self, now: f64) {
        if self.metrics.first_token_time.is_none()
            && self.seqs.first().map(|s| s.output_len()) == Some(1)
        {
            self.metrics.first_token_time = Some(now);
        }
    }
}
