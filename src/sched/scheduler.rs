//! The request scheduler.
//!
//! Owns the waiting/running/swapped queues and the partial-swap table,
//! and produces one [`BatchPlan`] per iteration: which groups run, their
//! token chunk sizes, and the block movements the executor must apply.
//! Groups live in a registry keyed by request id; the queues hold ids
//! only, so a group can be referenced by a queue and the partial-swap
//! table at once without aliasing.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::allocator::AllocatorError;
use crate::cache::block::BlockId;
use crate::cache::manager::{AllocStatus, BlockSpaceManager};
use crate::config::{CacheConfig, PreemptionMode, SchedulerConfig, SwapMode};
use crate::sched::budget::SchedulingBudget;
use crate::sched::plan::{BatchPlan, PrefillOutputs, RunningOutputs, ScheduledGroup, SwappedInOutputs};
use crate::sched::policy::{self, Policy, PolicyParams, QueueKind};
use crate::sequence::group::SequenceGroup;
use crate::sequence::{Sequence, SequenceStatus};

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A multi-sequence victim can neither be swapped out (host full) nor
    /// recomputed; there is no local recovery.
    #[error("request {request_id}: host tier exhausted and recompute is unsupported for multi-sequence groups")]
    OutOfHostMemory { request_id: String },
}

/// Out-of-device-memory past an admission check is an accounting bug, not
/// a load condition; fail the step loudly.
fn fatal<T>(result: Result<T, AllocatorError>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("block accounting violated: {e}"),
    }
}

/// Cumulative scheduler telemetry. Swap counters track blocks actually
/// moved, not the sizes of the groups they belonged to.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub iterations: u64,
    pub cumulative_preemptions: u64,
    pub total_swap_out_blocks: u64,
    pub total_swap_in_blocks: u64,
    pub total_swap_out_seqs: u64,
    pub total_swap_in_seqs: u64,
}

/// Which queue a status-filtered token count should look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CountKind {
    Waiting,
    Running,
    Swapped,
}

pub struct Scheduler {
    config: SchedulerConfig,
    policy: Policy,
    policy_params: PolicyParams,

    block_manager: BlockSpaceManager,

    /// Registry of live groups; queues and the partial-swap table refer
    /// into it by request id.
    groups: HashMap<String, SequenceGroup>,

    waiting: VecDeque<String>,
    running: VecDeque<String>,
    swapped: VecDeque<String>,

    /// request_id -> device blocks still resident for groups split across
    /// tiers.
    partial_swapped: HashMap<String, usize>,
    /// Companion vector sorted ascending by remaining blocks, for the
    /// smallest-sum-at-least-N victim query.
    partial_swapped_index: Vec<(usize, String)>,

    rng: StdRng,

    deadline: Option<f64>,
    reached_deadline: bool,

    // Prompt-delay gate state.
    prev_time: f64,
    prev_prompt: bool,
    last_prompt_latency: f64,

    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, cache_config: &CacheConfig) -> Self {
        let policy = config.policy;
        let policy_params = PolicyParams::from_config(&config);
        let seed = config.seed;
        Self {
            policy,
            policy_params,
            block_manager: BlockSpaceManager::new(cache_config),
            groups: HashMap::new(),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            partial_swapped: HashMap::new(),
            partial_swapped_index: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            // Armed by the caller with an absolute time; the config value
            // is relative to engine start.
            deadline: None,
            reached_deadline: false,
            prev_time: 0.0,
            prev_prompt: false,
            last_prompt_latency: 0.0,
            stats: SchedulerStats::default(),
            config,
        }
    }

    pub fn block_manager(&self) -> &BlockSpaceManager {
        &self.block_manager
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn arm_deadline(&mut self, deadline: f64) {
        self.deadline = Some(deadline);
    }

    pub fn add_group(&mut self, group: SequenceGroup) {
        debug_assert!(!self.groups.contains_key(&group.request_id));
        debug!(request_id = %group.request_id, prompt_len = group.prompt_len(), "enqueued");
        self.waiting.push_back(group.request_id.clone());
        self.groups.insert(group.request_id.clone(), group);
    }

    pub fn contains_request(&self, request_id: &str) -> bool {
        self.groups.contains_key(request_id)
    }

    pub fn get_group(&self, request_id: &str) -> Option<&SequenceGroup> {
        self.groups.get(request_id)
    }

    /// Disjoint mutable access for output processing: the group and the
    /// block manager at once.
    pub fn group_and_manager_mut(
        &mut self,
        request_id: &str,
    ) -> Option<(&mut SequenceGroup, &mut BlockSpaceManager)> {
        let manager = &mut self.block_manager;
        self.groups.get_mut(request_id).map(|g| (g, manager))
    }

    pub fn has_unfinished(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }

    pub fn num_unfinished_groups(&self) -> usize {
        self.waiting.len() + self.running.len() + self.swapped.len()
    }

    /// (waiting, running, swapped) queue lengths.
    pub fn queue_lens(&self) -> (usize, usize, usize) {
        (self.waiting.len(), self.running.len(), self.swapped.len())
    }

    /// Device blocks still resident for a partially swapped group.
    pub fn partial_swapped_remaining(&self, request_id: &str) -> Option<usize> {
        self.partial_swapped.get(request_id).copied()
    }

    pub fn common_computed_block_ids(&self, request_id: &str) -> Vec<BlockId> {
        let Some(group) = self.groups.get(request_id) else {
            return Vec::new();
        };
        let running: Vec<&Sequence> = group
            .seqs_with_status(SequenceStatus::Running)
            .collect();
        self.block_manager.get_common_computed_block_ids(&running)
    }

    /// Remove the given requests from every queue, marking their
    /// unfinished sequences aborted and freeing their blocks. Ids that are
    /// not present are ignored.
    pub fn abort(&mut self, request_ids: &[String]) {
        let mut targets: HashSet<&str> = request_ids.iter().map(|s| s.as_str()).collect();
        let mut aborted: Vec<String> = Vec::new();

        for queue in [&mut self.waiting, &mut self.running, &mut self.swapped] {
            queue.retain(|id| {
                if targets.remove(id.as_str()) {
                    aborted.push(id.clone());
                    false
                } else {
                    true
                }
            });
        }

        for id in aborted {
            remove_partial_swapped(&mut self.partial_swapped, &mut self.partial_swapped_index, &id);
            if let Some(mut group) = self.groups.remove(&id) {
                for seq in group.seqs.iter_mut().filter(|s| !s.is_finished()) {
                    seq.status = SequenceStatus::FinishedAborted;
                    fatal(self.block_manager.free(seq));
                }
                debug!(request_id = %id, "aborted");
            }
        }
    }

    /// Drop finished groups from the running queue and the registry,
    /// with a final free pass over any residual block tables.
    pub fn free_finished(&mut self) {
        let groups = &self.groups;
        self.running
            .retain(|id| groups.get(id).map(|g| !g.is_finished()).unwrap_or(false));

        let finished: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, g)| g.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            let mut group = self.groups.remove(&id).expect("finished group");
            for seq in &mut group.seqs {
                fatal(self.block_manager.free(seq));
            }
        }
    }

    /// Run one scheduling iteration.
    pub fn schedule(&mut self, now: f64) -> Result<BatchPlan, SchedulerError> {
        if self.reached_deadline {
            return Ok(BatchPlan::default());
        }
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                return Ok(self.finish_all_for_deadline());
            }
        }

        let plan = if self.config.enable_chunked_prefill {
            self.schedule_chunked_prefill(now)?
        } else {
            self.schedule_default(now)?
        };

        // Everything still queued after this iteration waited one more.
        for id in self.waiting.iter().chain(self.swapped.iter()) {
            if let Some(group) = self.groups.get_mut(id) {
                group.update_waiting_iter_count();
            }
        }

        // Batch bookkeeping for the scheduled groups: timing, prefix-cache
        // recency and computed-block marking.
        for entry in &plan.scheduled {
            if let Some(group) = self.groups.get_mut(&entry.request_id) {
                group.maybe_set_first_scheduled_time(now);
            }
            if let Some(group) = self.groups.get(&entry.request_id) {
                for seq in group.seqs_with_status(SequenceStatus::Running) {
                    self.block_manager.access_all_blocks_in_seq(seq);
                }
            }
            if let Some(group) = self.groups.get(&entry.request_id) {
                self.block_manager.mark_blocks_as_computed(group);
            }
        }

        self.stats.iterations += 1;
        Ok(plan)
    }

    /// Deadline pass: every queued group finishes stopped, queues drain,
    /// and the iteration returns an empty plan listing the casualties.
    fn finish_all_for_deadline(&mut self) -> BatchPlan {
        self.reached_deadline = true;
        let ids: Vec<String> = self
            .waiting
            .iter()
            .chain(self.running.iter())
            .chain(self.swapped.iter())
            .cloned()
            .collect();
        info!(count = ids.len(), "deadline reached, stopping all requests");

        for id in &ids {
            if let Some(group) = self.groups.get_mut(id) {
                for seq in group.seqs.iter_mut().filter(|s| !s.is_finished()) {
                    seq.status = SequenceStatus::FinishedStopped;
                    fatal(self.block_manager.free(seq));
                }
            }
        }
        self.waiting.clear();
        self.running.clear();
        self.swapped.clear();
        self.partial_swapped.clear();
        self.partial_swapped_index.clear();

        BatchPlan {
            ignored: ids,
            ..Default::default()
        }
    }

    /// Default (non-chunked) iteration: prefills run alone; decodes and
    /// swap-ins only when no prefill was admitted.
    fn schedule_default(&mut self, now: f64) -> Result<BatchPlan, SchedulerError> {
        let mut budget = SchedulingBudget::new(
            self.config.max_num_batched_tokens,
            self.config.max_num_seqs,
        );
        // Account running sequences up front so prefill admission cannot
        // push the batch past max_num_seqs.
        for id in &self.running {
            let group = &self.groups[id];
            budget.add_seqs(id, group.max_num_running_seqs());
        }

        let mut prefills = PrefillOutputs::default();
        let mut running_out = RunningOutputs::default();
        let mut swapped_in = SwappedInOutputs::default();

        if !self.waiting.is_empty() && self.swapped.is_empty() {
            prefills = self.schedule_prefills(&mut budget, now, false);
        }

        if prefills.scheduled.is_empty() {
            running_out = self.schedule_running(&mut budget, now, false, false)?;
            if running_out.preempted.is_empty() && running_out.swapped_out.is_empty() {
                swapped_in = self.schedule_swapped(&mut budget, now, false);
            }
        }

        debug_assert!(budget.num_batched_tokens() <= self.config.max_num_batched_tokens);
        debug_assert!(budget.num_curr_seqs() <= self.config.max_num_seqs);

        // Prefills and decodes never mix here.
        debug_assert!(running_out.prefill_groups.is_empty());
        debug_assert!(swapped_in.prefill_groups.is_empty());

        self.requeue_after_iteration(&prefills, &running_out, &swapped_in);

        let preempted = running_out.preempted.len() + running_out.swapped_out.len();
        let num_running_to_waiting = running_out.preempted.len();
        let mut scheduled = prefills.scheduled;
        let num_prefill_groups = scheduled.len();
        scheduled.extend(running_out.decode_groups);
        scheduled.extend(swapped_in.decode_groups);

        let mut blocks_to_copy = running_out.blocks_to_copy;
        blocks_to_copy.extend(swapped_in.blocks_to_copy);
        let mut ignored = prefills.ignored;
        ignored.extend(swapped_in.infeasible);

        Ok(BatchPlan {
            scheduled,
            num_prefill_groups,
            num_batched_tokens: budget.num_batched_tokens(),
            blocks_to_swap_in: swapped_in.blocks_to_swap_in,
            blocks_to_swap_out: running_out.blocks_to_swap_out,
            blocks_to_copy,
            ignored,
            num_lookahead_slots: self.config.num_lookahead_slots,
            running_queue_size: self.running.len(),
            preempted,
            num_waiting_to_running: 0,
            num_running_to_waiting,
            recomputed_token_nums: 0,
        })
    }

    /// Chunked-prefill iteration: decodes first (with preemption), then
    /// swap-ins, then as much prefill work as the budget allows.
    fn schedule_chunked_prefill(&mut self, now: f64) -> Result<BatchPlan, SchedulerError> {
        let mut budget = SchedulingBudget::new(
            self.config.max_num_batched_tokens,
            self.config.max_num_seqs,
        );

        let partial = self.config.swap_out_mode == SwapMode::Partial;
        let running_out = self.schedule_running(&mut budget, now, true, partial)?;

        let swapped_in = if running_out.preempted.is_empty() && running_out.swapped_out.is_empty()
        {
            self.schedule_swapped(&mut budget, now, true)
        } else {
            SwappedInOutputs::default()
        };

        let prefills = self.schedule_prefills(&mut budget, now, true);

        debug_assert!(budget.num_batched_tokens() <= self.config.max_num_batched_tokens);
        debug_assert!(budget.num_curr_seqs() <= self.config.max_num_seqs);

        self.requeue_after_iteration(&prefills, &running_out, &swapped_in);

        let num_prefill_groups = prefills.scheduled.len()
            + running_out.prefill_groups.len()
            + swapped_in.prefill_groups.len();
        let mut scheduled = prefills.scheduled;
        scheduled.extend(running_out.prefill_groups.iter().cloned());
        scheduled.extend(swapped_in.prefill_groups.iter().cloned());
        scheduled.extend(running_out.decode_groups.iter().cloned());
        scheduled.extend(swapped_in.decode_groups.iter().cloned());

        let mut blocks_to_copy = running_out.blocks_to_copy;
        blocks_to_copy.extend(swapped_in.blocks_to_copy);
        let mut ignored = prefills.ignored;
        ignored.extend(swapped_in.infeasible);

        Ok(BatchPlan {
            scheduled,
            num_prefill_groups,
            num_batched_tokens: budget.num_batched_tokens(),
            blocks_to_swap_in: swapped_in.blocks_to_swap_in,
            blocks_to_swap_out: running_out.blocks_to_swap_out,
            blocks_to_copy,
            ignored,
            num_lookahead_slots: self.config.num_lookahead_slots,
            running_queue_size: self.running.len(),
            preempted: running_out.preempted.len() + running_out.swapped_out.len(),
            num_waiting_to_running: running_out.prefill_groups.len(),
            num_running_to_waiting: running_out.preempted.len(),
            recomputed_token_nums: running_out.recomputed_token_nums,
        })
    }

    /// Splice phase results back onto the queues: recompute victims to the
    /// front of waiting, swap victims to the back of swapped, everything
    /// scheduled back onto running.
    fn requeue_after_iteration(
        &mut self,
        prefills: &PrefillOutputs,
        running_out: &RunningOutputs,
        swapped_in: &SwappedInOutputs,
    ) {
        for id in &running_out.preempted {
            self.waiting.push_front(id.clone());
        }
        self.running
            .extend(prefills.scheduled.iter().map(|s| s.request_id.clone()));
        self.running
            .extend(running_out.decode_groups.iter().map(|s| s.request_id.clone()));
        self.running
            .extend(running_out.prefill_groups.iter().map(|s| s.request_id.clone()));
        self.running
            .extend(swapped_in.decode_groups.iter().map(|s| s.request_id.clone()));
        self.running
            .extend(swapped_in.prefill_groups.iter().map(|s| s.request_id.clone()));
        self.swapped.extend(running_out.swapped_out.iter().cloned());
    }

    /// Consume the running queue in policy order, preempting victims when
    /// the device cannot take one more block per running sequence.
    fn schedule_running(
        &mut self,
        budget: &mut SchedulingBudget,
        now: f64,
        enable_chunking: bool,
        partial: bool,
    ) -> Result<RunningOutputs, SchedulerError> {
        let mut running = std::mem::take(&mut self.running);
        policy::sort_by_priority(
            self.policy,
            &self.policy_params,
            QueueKind::Running,
            now,
            &mut running,
            &mut self.groups,
            &mut self.rng,
        );

        let mut out = RunningOutputs::default();
        let partial_rate = self.config.swap_out_partial_rate;

        'queue: while let Some(id) = running.front().cloned() {
            let num_running_tokens = {
                let group = self.groups.get_mut(&id).expect("running group");
                get_num_new_tokens(group, CountKind::Running, enable_chunking, budget)
            };
            if num_running_tokens == 0 {
                // Hard "cannot schedule now": stop consuming this queue.
                break;
            }
            running.pop_front();

            // Worst-case footprint of the group being kept on device,
            // used to size partial evictions.
            let mut required_blocks = self.groups[&id].total_token_blocks();

            loop {
                if self.block_manager.can_append_slots(&self.groups[&id]) {
                    let Self {
                        groups,
                        block_manager,
                        ..
                    } = self;
                    let group = groups.get_mut(&id).expect("running group");
                    for seq in group.seqs_with_status_mut(SequenceStatus::Running) {
                        let cows = fatal(block_manager.append_slots(seq));
                        out.blocks_to_copy.extend(cows);
                    }
                    group.reset_waiting_iter_count();
                    if group.is_prefill() {
                        out.prefill_groups.push(ScheduledGroup {
                            request_id: id.clone(),
                            token_chunk_size: num_running_tokens,
                        });
                        out.recomputed_token_nums += num_running_tokens;
                    } else {
                        out.decode_groups.push(ScheduledGroup {
                            request_id: id.clone(),
                            token_chunk_size: 1,
                        });
                    }
                    budget.add_tokens(&id, num_running_tokens);
                    if enable_chunking {
                        let num_seqs = group.max_num_running_seqs();
                        budget.add_seqs(&id, num_seqs);
                    }
                    continue 'queue;
                }

                // Not enough room: release this group's budget and evict.
                budget.subtract_tokens(&id, num_running_tokens);
                let num_seqs = self.groups[&id].max_num_running_seqs();
                budget.subtract_seqs(&id, num_seqs);

                if partial && !self.partial_swapped.is_empty() {
                    // Partially swapped groups give up their remaining
                    // device blocks before any running victim does.
                    self.evict_from_partial_swapped(required_blocks, now, &mut out)?;
                    required_blocks = 0;
                    continue;
                }

                if let Some(victim_id) = running.pop_back() {
                    if partial {
                        self.preempt_partial_victim(
                            &victim_id,
                            &mut required_blocks,
                            partial_rate,
                            now,
                            &mut out,
                        )?;
                    } else {
                        let mode = self.preempt(&victim_id, &mut out.blocks_to_swap_out, None, SequenceStatus::Swapped, now)?;
                        self.record_preemption(&victim_id, mode, &mut out);
                    }
                    continue;
                }

                // No other victims: preempt the group itself.
                if partial {
                    let total = self.groups[&id].total_token_blocks();
                    let unit = ((total as f64 * partial_rate).ceil() as usize).max(1);
                    let left = total.saturating_sub(unit);
                    if left > 0 {
                        let mode = self.preempt(&id, &mut out.blocks_to_swap_out, Some(unit), SequenceStatus::PartialSwapped, now)?;
                        if mode == PreemptionMode::Swap {
                            insert_partial_swapped(
                                &mut self.partial_swapped,
                                &mut self.partial_swapped_index,
                                &id,
                                left,
                            );
                        }
                        self.record_preemption(&id, mode, &mut out);
                    } else {
                        let mode = self.preempt(&id, &mut out.blocks_to_swap_out, None, SequenceStatus::Swapped, now)?;
                        self.record_preemption(&id, mode, &mut out);
                    }
                } else {
                    let mode = self.preempt(&id, &mut out.blocks_to_swap_out, None, SequenceStatus::Swapped, now)?;
                    self.record_preemption(&id, mode, &mut out);
                }
                break 'queue;
            }
        }

        self.running = running;
        Ok(out)
    }

    /// Swap out a freshly chosen running victim, partially when its
    /// footprint exceeds what the current group needs.
    fn preempt_partial_victim(
        &mut self,
        victim_id: &str,
        required_blocks: &mut usize,
        partial_rate: f64,
        now: f64,
        out: &mut RunningOutputs,
    ) -> Result<(), SchedulerError> {
        let victim_blocks = self.groups[victim_id].total_token_blocks();

        if victim_blocks <= *required_blocks {
            let mode = self.preempt(victim_id, &mut out.blocks_to_swap_out, None, SequenceStatus::Swapped, now)?;
            *required_blocks -= victim_blocks;
            self.record_preemption(victim_id, mode, out);
            return Ok(());
        }

        let unit = ((victim_blocks as f64 * partial_rate).ceil() as usize).max(1);
        let to_swap = (required_blocks.div_ceil(unit) * unit).max(1).min(victim_blocks);
        let left = victim_blocks - to_swap;

        if left > 0 {
            let mode = self.preempt(victim_id, &mut out.blocks_to_swap_out, Some(to_swap), SequenceStatus::PartialSwapped, now)?;
            if mode == PreemptionMode::Swap {
                insert_partial_swapped(
                    &mut self.partial_swapped,
                    &mut self.partial_swapped_index,
                    victim_id,
                    left,
                );
                *required_blocks = 0;
            }
            self.record_preemption(victim_id, mode, out);
        } else {
            let mode = self.preempt(victim_id, &mut out.blocks_to_swap_out, None, SequenceStatus::Swapped, now)?;
            *required_blocks = required_blocks.saturating_sub(victim_blocks);
            self.record_preemption(victim_id, mode, out);
        }
        Ok(())
    }

    /// Evict remaining device blocks of partially swapped groups: pick the
    /// smallest set whose remaining blocks sum to at least `required` via
    /// a prefix-sum search over the sorted index, then fall back to
    /// draining the whole table when it cannot cover the need.
    fn evict_from_partial_swapped(
        &mut self,
        required: usize,
        now: f64,
        out: &mut RunningOutputs,
    ) -> Result<(), SchedulerError> {
        let selected = match select_partial_victims(&self.partial_swapped_index, required) {
            Some(count) => self.partial_swapped_index[..count].to_vec(),
            None => self.partial_swapped_index.clone(),
        };

        let mut still_needed = required;
        for (remaining, victim_id) in selected {
            remove_partial_swapped(
                &mut self.partial_swapped,
                &mut self.partial_swapped_index,
                &victim_id,
            );

            if remaining <= still_needed {
                // Finish evicting this group.
                self.preempt(&victim_id, &mut out.blocks_to_swap_out, Some(remaining), SequenceStatus::Swapped, now)?;
                still_needed -= remaining;
            } else {
                let total = self.groups[&victim_id].total_token_blocks();
                let unit = ((total as f64 * self.config.swap_out_partial_rate).ceil() as usize).max(1);
                let to_swap = (still_needed.div_ceil(unit) * unit).max(1).min(remaining);
                let left = remaining - to_swap;
                if left > 0 {
                    self.preempt(&victim_id, &mut out.blocks_to_swap_out, Some(to_swap), SequenceStatus::PartialSwapped, now)?;
                    insert_partial_swapped(
                        &mut self.partial_swapped,
                        &mut self.partial_swapped_index,
                        &victim_id,
                        left,
                    );
                } else {
                    self.preempt(&victim_id, &mut out.blocks_to_swap_out, Some(to_swap), SequenceStatus::Swapped, now)?;
                }
                still_needed = 0;
            }
            // Already resident in the swapped queue; no requeue here.
        }
        Ok(())
    }

    fn record_preemption(&mut self, id: &str, mode: PreemptionMode, out: &mut RunningOutputs) {
        self.stats.cumulative_preemptions += 1;
        match mode {
            PreemptionMode::Recompute => out.preempted.push(id.to_string()),
            PreemptionMode::Swap => {
                // Partially swapped victims already live in the swapped
                // queue; only fresh victims move there.
                if !self.swapped.contains(&id.to_string())
                    && !out.swapped_out.iter().any(|s| s == id)
                {
                    out.swapped_out.push(id.to_string());
                }
            }
        }
    }

    /// Preempt one group, resolving the mode per victim: recompute for
    /// single-sequence groups (or a full host), swap otherwise. Partial
    /// swap-outs force swap mode. An un-swappable multi-sequence group is
    /// unrecoverable and surfaces as an error.
    fn preempt(
        &mut self,
        request_id: &str,
        blocks_to_swap_out: &mut Vec<(BlockId, BlockId)>,
        nblocks: Option<usize>,
        target_status: SequenceStatus,
        now: f64,
    ) -> Result<PreemptionMode, SchedulerError> {
        let Self {
            config,
            groups,
            block_manager,
            stats,
            ..
        } = self;
        let group = groups.get_mut(request_id).expect("preempt target");

        let single = group.max_num_running_seqs() == 1;
        let can_swap = block_manager.can_swap_out(group);
        let mode = if nblocks.is_some() {
            // Partial swap is only meaningful as a swap.
            if can_swap {
                PreemptionMode::Swap
            } else if single {
                PreemptionMode::Recompute
            } else {
                return Err(SchedulerError::OutOfHostMemory {
                    request_id: request_id.to_string(),
                });
            }
        } else {
            match config.preemption_mode {
                Some(PreemptionMode::Swap) if can_swap => PreemptionMode::Swap,
                Some(PreemptionMode::Swap) | Some(PreemptionMode::Recompute) | None => {
                    if single {
                        PreemptionMode::Recompute
                    } else if can_swap {
                        PreemptionMode::Swap
                    } else {
                        return Err(SchedulerError::OutOfHostMemory {
                            request_id: request_id.to_string(),
                        });
                    }
                }
            }
        };

        if stats.cumulative_preemptions % 50 == 0 {
            debug!(
                request_id,
                ?mode,
                total = stats.cumulative_preemptions + 1,
                "preempting for KV cache space"
            );
        }

        match mode {
            PreemptionMode::Recompute => {
                for seq in group.seqs.iter_mut().filter(|s| {
                    matches!(
                        s.status,
                        SequenceStatus::Running | SequenceStatus::PartialSwapped
                    )
                }) {
                    seq.status = SequenceStatus::Waiting;
                    fatal(block_manager.free(seq));
                    seq.reset_for_recompute();
                }
            }
            PreemptionMode::Swap => {
                let mapping = fatal(block_manager.swap_out(group, nblocks));
                stats.total_swap_out_blocks += mapping.len() as u64;
                stats.total_swap_out_seqs += group
                    .seqs
                    .iter()
                    .filter(|s| {
                        matches!(
                            s.status,
                            SequenceStatus::Running | SequenceStatus::PartialSwapped
                        )
                    })
                    .count() as u64;
                blocks_to_swap_out.extend(mapping);
                for seq in group.seqs.iter_mut().filter(|s| {
                    matches!(
                        s.status,
                        SequenceStatus::Running | SequenceStatus::PartialSwapped
                    )
                }) {
                    seq.status = target_status;
                }
                group.swap_out_moment = Some(now);
                group.metrics.swap_count += 1;
            }
        }
        Ok(mode)
    }

    /// Consume the swapped queue in policy order, swapping groups back in
    /// while the device and the budget allow.
    fn schedule_swapped(
        &mut self,
        budget: &mut SchedulingBudget,
        now: f64,
        enable_chunking: bool,
    ) -> SwappedInOutputs {
        let mut swapped = std::mem::take(&mut self.swapped);
        policy::sort_by_priority(
            self.policy,
            &self.policy_params,
            QueueKind::Swapped,
            now,
            &mut swapped,
            &mut self.groups,
            &mut self.rng,
        );

        let mut out = SwappedInOutputs::default();
        let mut leftover: Vec<String> = Vec::new();
        // The tradeoff policy defers individually rather than stalling the
        // whole queue behind one oversized group.
        let defer_individually = self.policy == Policy::TfitTradeoff;
        // The policies that create partial swaps hold those groups back
        // until their device remainder is resolved; everyone else lets
        // swap-in reunite the split table.
        let defer_partial = matches!(self.policy, Policy::Infer | Policy::TfitTradeoff);

        while let Some(id) = swapped.front().cloned() {
            if defer_partial && self.partial_swapped.contains_key(&id) {
                swapped.pop_front();
                leftover.push(id);
                continue;
            }

            let alloc_status = self.block_manager.can_swap_in(&self.groups[&id]);
            match alloc_status {
                AllocStatus::Never => {
                    warn!(
                        request_id = %id,
                        "not enough KV blocks to ever run this request; failing it"
                    );
                    let Self {
                        groups,
                        block_manager,
                        ..
                    } = self;
                    let group = groups.get_mut(&id).expect("swapped group");
                    for seq in group.seqs.iter_mut().filter(|s| !s.is_finished()) {
                        seq.status = SequenceStatus::FinishedIgnored;
                        fatal(block_manager.free(seq));
                    }
                    out.infeasible.push(id.clone());
                    swapped.pop_front();
                    continue;
                }
                AllocStatus::Later => {
                    if defer_individually {
                        swapped.pop_front();
                        leftover.push(id);
                        continue;
                    }
                    break;
                }
                AllocStatus::Ok => {}
            }

            let (num_new_seqs, num_new_tokens) = {
                let group = self.groups.get_mut(&id).expect("swapped group");
                let seqs = group.max_num_running_seqs();
                let tokens = get_num_new_tokens(group, CountKind::Swapped, enable_chunking, budget);
                (seqs, tokens)
            };
            if num_new_tokens == 0 || !budget.can_schedule(num_new_tokens, num_new_seqs) {
                if defer_individually {
                    swapped.pop_front();
                    leftover.push(id);
                    continue;
                }
                break;
            }

            swapped.pop_front();
            remove_partial_swapped(&mut self.partial_swapped, &mut self.partial_swapped_index, &id);

            let Self {
                groups,
                block_manager,
                stats,
                ..
            } = self;
            let group = groups.get_mut(&id).expect("swapped group");
            let mapping = fatal(block_manager.swap_in(group));
            stats.total_swap_in_blocks += mapping.len() as u64;
            stats.total_swap_in_seqs += group
                .seqs
                .iter()
                .filter(|s| {
                    matches!(
                        s.status,
                        SequenceStatus::Swapped | SequenceStatus::PartialSwapped
                    )
                })
                .count() as u64;
            out.blocks_to_swap_in.extend(mapping);
            for seq in group.seqs.iter_mut().filter(|s| {
                matches!(
                    s.status,
                    SequenceStatus::Swapped | SequenceStatus::PartialSwapped
                )
            }) {
                seq.status = SequenceStatus::Running;
            }
            for seq in group.seqs_with_status_mut(SequenceStatus::Running) {
                let cows = fatal(block_manager.append_slots(seq));
                out.blocks_to_copy.extend(cows);
            }
            group.swap_out_moment = None;

            if group.is_prefill() {
                out.prefill_groups.push(ScheduledGroup {
                    request_id: id.clone(),
                    token_chunk_size: num_new_tokens,
                });
            } else {
                out.decode_groups.push(ScheduledGroup {
                    request_id: id.clone(),
                    token_chunk_size: 1,
                });
            }
            budget.add_tokens(&id, num_new_tokens);
            budget.add_seqs(&id, num_new_seqs);
            group.reset_waiting_iter_count();
        }

        for id in leftover.into_iter().rev() {
            swapped.push_front(id);
        }
        self.swapped = swapped;
        out
    }

    /// Consume the waiting queue (arrival order, or policy order for the
    /// tradeoff policy), admitting prompts that fit the device and the
    /// budget.
    fn schedule_prefills(
        &mut self,
        budget: &mut SchedulingBudget,
        now: f64,
        enable_chunking: bool,
    ) -> PrefillOutputs {
        let mut out = PrefillOutputs::default();
        if !self.passed_delay(now) {
            return out;
        }

        let mut waiting = std::mem::take(&mut self.waiting);
        if self.policy.sorts_waiting_queue() {
            policy::sort_by_priority(
                self.policy,
                &self.policy_params,
                QueueKind::Waiting,
                now,
                &mut waiting,
                &mut self.groups,
                &mut self.rng,
            );
        }

        let prompt_limit = if self.config.enable_chunked_prefill {
            self.config.max_model_len
        } else {
            self.config
                .max_model_len
                .min(self.config.max_num_batched_tokens)
        };

        while let Some(id) = waiting.front().cloned() {
            let num_new_tokens = {
                let group = self.groups.get_mut(&id).expect("waiting group");
                get_num_new_tokens(group, CountKind::Waiting, enable_chunking, budget)
            };

            let full_len = self.groups[&id].num_uncomputed_tokens();
            if full_len > prompt_limit {
                warn!(
                    request_id = %id,
                    prompt_len = full_len,
                    limit = prompt_limit,
                    "prompt over the length limit, ignoring request"
                );
                self.ignore_waiting_group(&id, &mut out);
                waiting.pop_front();
                continue;
            }

            match self.block_manager.can_allocate(&self.groups[&id]) {
                AllocStatus::Never => {
                    warn!(
                        request_id = %id,
                        prompt_len = full_len,
                        "prompt exceeds total device capacity, ignoring request"
                    );
                    self.ignore_waiting_group(&id, &mut out);
                    waiting.pop_front();
                    continue;
                }
                AllocStatus::Later => break,
                AllocStatus::Ok => {}
            }

            let num_new_seqs = self.groups[&id].max_num_running_seqs();
            if num_new_tokens == 0 || !budget.can_schedule(num_new_tokens, num_new_seqs) {
                break;
            }

            waiting.pop_front();
            let Self {
                groups,
                block_manager,
                ..
            } = self;
            let group = groups.get_mut(&id).expect("waiting group");
            fatal(block_manager.allocate(group));
            for seq in group.seqs_with_status_mut(SequenceStatus::Waiting) {
                seq.status = SequenceStatus::Running;
            }
            group.swap_out_moment = None;

            out.scheduled.push(ScheduledGroup {
                request_id: id.clone(),
                token_chunk_size: num_new_tokens,
            });
            budget.add_tokens(&id, num_new_tokens);
            budget.add_seqs(&id, num_new_seqs);
        }

        if !out.scheduled.is_empty() {
            self.prev_prompt = true;
        }
        self.waiting = waiting;
        out
    }

    fn ignore_waiting_group(&mut self, id: &str, out: &mut PrefillOutputs) {
        let group = self.groups.get_mut(id).expect("waiting group");
        for seq in group.seqs.iter_mut().filter(|s| !s.is_finished()) {
            seq.status = SequenceStatus::FinishedIgnored;
        }
        out.ignored.push(id.to_string());
    }

    /// Prompt-delay gate: hold new prefills briefly so the waiting queue
    /// can batch up, unless nothing is running.
    fn passed_delay(&mut self, now: f64) -> bool {
        if self.prev_prompt {
            self.last_prompt_latency = now - self.prev_time;
        }
        self.prev_time = now;
        self.prev_prompt = false;

        if self.config.delay_factor > 0.0 && !self.waiting.is_empty() {
            let earliest_arrival = self
                .waiting
                .iter()
                .filter_map(|id| self.groups.get(id))
                .map(|g| g.metrics.arrival_time)
                .fold(f64::INFINITY, f64::min);
            (now - earliest_arrival) > self.config.delay_factor * self.last_prompt_latency
                || self.running.is_empty()
        } else {
            true
        }
    }
}

/// Tokens the group contributes to the next batch given its queue, capped
/// by the remaining token budget when chunking applies (single-sequence
/// groups only; beam groups decode in lockstep and cannot be chunked).
/// Zero means "cannot schedule now".
fn get_num_new_tokens(
    group: &SequenceGroup,
    kind: CountKind,
    enable_chunking: bool,
    budget: &SchedulingBudget,
) -> usize {
    let statuses: &[SequenceStatus] = match kind {
        CountKind::Waiting => &[SequenceStatus::Waiting],
        CountKind::Running => &[SequenceStatus::Running],
        CountKind::Swapped => &[SequenceStatus::Swapped, SequenceStatus::PartialSwapped],
    };
    let mut num_seqs = 0usize;
    let mut num_new_tokens = 0usize;
    for seq in group.seqs.iter().filter(|s| statuses.contains(&s.status)) {
        num_seqs += 1;
        num_new_tokens += seq.num_new_tokens();
    }
    debug_assert!(num_new_tokens > 0, "group {} has no new tokens", group.request_id);

    if enable_chunking && num_seqs == 1 {
        num_new_tokens = num_new_tokens.min(budget.remaining_token_budget());
    }
    num_new_tokens
}

fn insert_partial_swapped(
    map: &mut HashMap<String, usize>,
    index: &mut Vec<(usize, String)>,
    id: &str,
    remaining: usize,
) {
    debug_assert!(remaining > 0);
    map.insert(id.to_string(), remaining);
    let entry = (remaining, id.to_string());
    let pos = index.partition_point(|e| *e < entry);
    index.insert(pos, entry);
}

fn remove_partial_swapped(
    map: &mut HashMap<String, usize>,
    index: &mut Vec<(usize, String)>,
    id: &str,
) -> Option<usize> {
    let remaining = map.remove(id)?;
    if let Some(pos) = index.iter().position(|(r, i)| *r == remaining && i == id) {
        index.remove(pos);
    }
    Some(remaining)
}

/// Smallest count k such that the k smallest remaining-block entries sum
/// to at least `required`; `None` when the whole table cannot cover it.
fn select_partial_victims(index: &[(usize, String)], required: usize) -> Option<usize> {
    let mut prefix = Vec::with_capacity(index.len());
    let mut sum = 0usize;
    for (remaining, _) in index {
        sum += remaining;
        prefix.push(sum);
    }
    let pos = prefix.partition_point(|&s| s < required);
    if pos >= prefix.len() {
        return None;
    }
    Some(pos + 1)
}
