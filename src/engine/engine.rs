//! The engine façade.
//!
//! Accepts requests (directly or through a thread-safe inbox drained at
//! iteration boundaries), runs one scheduler iteration per `step()`,
//! dispatches the batch to the executor, applies sampled tokens, and
//! frees finished requests. The core stays synchronous; an async serving
//! loop wraps `step()` from outside.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, SchedulerConfig};
use crate::engine::executor::{GroupMetadata, ModelExecutor, SeqMetadata};
use crate::engine::outputs::RequestOutput;
use crate::engine::processor::OutputProcessor;
use crate::sched::plan::BatchPlan;
use crate::sched::scheduler::{Scheduler, SchedulerError};
use crate::sequence::group::SequenceGroup;
use crate::sequence::sampling::SamplingParams;
use crate::sequence::{SeqId, Sequence, SequenceStatus};
use crate::trace::{TraceRecorder, TraceRow};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("duplicate request id {0}")]
    DuplicateRequestId(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Time source, injected so tests and replays control the clock.
pub trait Clock: Send {
    /// Seconds; monotone non-decreasing across calls.
    fn now(&self) -> f64;
}

/// Wall clock (Unix seconds).
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs_f64()
    }
}

/// Hand-advanced clock for tests and deterministic replay.
#[derive(Clone, Default)]
pub struct ManualClock {
    t: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            t: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, dt: f64) {
        *self.t.lock().unwrap() += dt;
    }

    pub fn set(&self, t: f64) {
        *self.t.lock().unwrap() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.t.lock().unwrap()
    }
}

/// A request as submitted through the inbox.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub request_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub params: SamplingParams,
    pub arrival_time_ns: u64,
}

/// Cloneable producer side of the engine inbox. Submissions are picked up
/// at the next iteration boundary.
#[derive(Clone)]
pub struct SubmitHandle {
    queue: Arc<Mutex<VecDeque<EngineRequest>>>,
}

impl SubmitHandle {
    pub fn submit(&self, request: EngineRequest) {
        self.queue.lock().unwrap().push_back(request);
    }
}

pub struct Engine {
    scheduler: Scheduler,
    executor: Box<dyn ModelExecutor + Send>,
    processor: OutputProcessor,
    clock: Box<dyn Clock>,

    inbox: Arc<Mutex<VecDeque<EngineRequest>>>,
    next_seq_id: SeqId,
    block_size: usize,
    eos_token_id: Option<u32>,

    /// Seconds-from-start deadline taken from the config; armed as an
    /// absolute time on the first step.
    relative_deadline: Option<f64>,
    deadline_armed: bool,

    trace: Option<TraceRecorder>,
    iteration: u64,
}

impl Engine {
    pub fn new(
        scheduler_config: SchedulerConfig,
        cache_config: &CacheConfig,
        executor: Box<dyn ModelExecutor + Send>,
    ) -> Self {
        let relative_deadline = scheduler_config.deadline;
        let processor = OutputProcessor::new(scheduler_config.max_model_len);
        Self {
            scheduler: Scheduler::new(scheduler_config, cache_config),
            executor,
            processor,
            clock: Box::new(SystemClock),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            next_seq_id: 0,
            block_size: cache_config.block_size,
            eos_token_id: None,
            relative_deadline,
            deadline_armed: false,
            trace: None,
            iteration: 0,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_eos_token(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    pub fn with_trace(mut self, trace: TraceRecorder) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Producer handle for cross-thread submission.
    pub fn handle(&self) -> SubmitHandle {
        SubmitHandle {
            queue: Arc::clone(&self.inbox),
        }
    }

    /// Register a new request. Fails on a duplicate id.
    pub fn add_request(
        &mut self,
        request_id: impl Into<String>,
        prompt_token_ids: Vec<u32>,
        params: SamplingParams,
        arrival_time_ns: u64,
    ) -> Result<(), EngineError> {
        let request_id = request_id.into();
        if self.scheduler.contains_request(&request_id) {
            return Err(EngineError::DuplicateRequestId(request_id));
        }
        let seq = Sequence::new(
            self.next_seq_id,
            prompt_token_ids,
            self.block_size,
            self.eos_token_id,
        );
        self.next_seq_id += 1;
        let arrival = arrival_time_ns as f64 / 1e9;
        self.scheduler
            .add_group(SequenceGroup::new(request_id, seq, params, arrival));
        Ok(())
    }

    /// Abort requests; gone from every queue on return, blocks freed.
    /// Unknown ids are ignored.
    pub fn abort_request(&mut self, request_ids: &[String]) {
        self.scheduler.abort(request_ids);
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished()
    }

    /// Run exactly one iteration: drain the inbox, schedule, execute,
    /// apply outputs, free finished groups.
    pub fn step(&mut self) -> Result<Vec<RequestOutput>, EngineError> {
        let pending: Vec<EngineRequest> = {
            let mut inbox = self.inbox.lock().unwrap();
            inbox.drain(..).collect()
        };
        for request in pending {
            let id = request.request_id.clone();
            if let Err(e) = self.add_request(
                request.request_id,
                request.prompt_token_ids,
                request.params,
                request.arrival_time_ns,
            ) {
                warn!(request_id = %id, error = %e, "rejected inbox submission");
            }
        }

        let ts_start = self.clock.now();
        if !self.deadline_armed {
            self.deadline_armed = true;
            if let Some(rel) = self.relative_deadline {
                self.scheduler.arm_deadline(ts_start + rel);
                info!(deadline_s = rel, "deadline armed");
            }
        }

        let plan = self.scheduler.schedule(ts_start)?;

        let outputs = if plan.is_empty() {
            Vec::new()
        } else {
            let batch = self.build_metadata(&plan);
            debug!(
                groups = batch.len(),
                tokens = plan.num_batched_tokens,
                prefills = plan.num_prefill_groups,
                "executing batch"
            );
            self.executor.execute(&plan, &batch)
        };

        self.processor.process(
            &mut self.scheduler,
            &plan,
            &outputs,
            &mut self.next_seq_id,
            ts_start,
        );

        let mut results = Vec::with_capacity(plan.scheduled.len() + plan.ignored.len());
        for entry in &plan.scheduled {
            if let Some(group) = self.scheduler.get_group(&entry.request_id) {
                results.push(RequestOutput::from_group(group));
            }
        }
        for id in &plan.ignored {
            if let Some(group) = self.scheduler.get_group(id) {
                results.push(RequestOutput::from_group(group));
            }
        }

        self.scheduler.free_finished();

        let ts_end = self.clock.now();
        if let Some(trace) = &mut self.trace {
            let (n_waiting, n_running, n_swapped) = self.scheduler.queue_lens();
            let row = TraceRow {
                iteration: self.iteration,
                ts_start,
                ts_end,
                n_running,
                n_waiting,
                n_swapped,
                tokens_batched: plan.num_batched_tokens,
                n_scheduled: plan.scheduled.len(),
                preempted: plan.preempted,
                swapped_in_blocks: plan.blocks_to_swap_in.len(),
                swapped_out_blocks: plan.blocks_to_swap_out.len(),
                copied_blocks: plan.blocks_to_copy.len(),
            };
            if let Err(e) = trace.record(&row) {
                warn!(error = %e, "trace write failed");
            }
        }
        self.iteration += 1;

        Ok(results)
    }

    /// Flush the trace file, if any.
    pub fn finish(&mut self) {
        if let Some(trace) = &mut self.trace {
            if let Err(e) = trace.flush() {
                warn!(error = %e, "trace flush failed");
            }
        }
    }

    fn build_metadata(&self, plan: &BatchPlan) -> Vec<GroupMetadata> {
        plan.scheduled
            .iter()
            .filter_map(|entry| {
                let group = self.scheduler.get_group(&entry.request_id)?;
                let is_prompt = group.is_prefill();
                let seqs: Vec<SeqMetadata> = group
                    .seqs_with_status(SequenceStatus::Running)
                    .map(|seq| SeqMetadata {
                        seq_id: seq.seq_id,
                        len: seq.len(),
                        num_computed_tokens: seq.num_computed_tokens(),
                        last_token_id: seq.last_token_id(),
                        block_table: seq.block_table.iter().map(|r| r.block).collect(),
                    })
                    .collect();
                // Prefill iterations only populate the KV cache; sampling
                // starts with the first decode iteration.
                let do_sample = !is_prompt;
                Some(GroupMetadata {
                    request_id: entry.request_id.clone(),
                    is_prompt,
                    token_chunk_size: entry.token_chunk_size,
                    do_sample,
                    sampling_params: group.sampling_params.clone(),
                    seqs,
                    computed_block_ids: self.scheduler.common_computed_block_ids(&entry.request_id),
                })
            })
            .collect()
    }
}
