//! Integration tests for the scheduler: chunked prefill, preemption,
//! partial swap and deterministic replay.

use kv_sched::cache::block::Tier;
use kv_sched::config::{CacheConfig, PreemptionMode, SchedulerConfig, SwapMode};
use kv_sched::sched::plan::BatchPlan;
use kv_sched::sched::policy::Policy;
use kv_sched::sched::scheduler::Scheduler;
use kv_sched::sequence::group::SequenceGroup;
use kv_sched::sequence::sampling::SamplingParams;
use kv_sched::sequence::{Sequence, SequenceStatus};

fn cache(block_size: usize, device: usize, host: usize) -> CacheConfig {
    CacheConfig {
        block_size,
        num_device_blocks: device,
        num_host_blocks: host,
        watermark: 0.0,
        enable_prefix_caching: false,
    }
}

fn enqueue(s: &mut Scheduler, id: &str, seq_id: u64, prompt: usize, max_tokens: usize, bs: usize) {
    let seq = Sequence::new(seq_id, (0..prompt as u32).collect(), bs, None);
    s.add_group(SequenceGroup::new(
        id,
        seq,
        SamplingParams::with_max_tokens(max_tokens),
        seq_id as f64,
    ));
}

/// Mirror the engine's output application: decode entries append one
/// token per running sequence, then the computed-token count advances by
/// the chunk.
fn apply_step(s: &mut Scheduler, plan: &BatchPlan) {
    for entry in &plan.scheduled {
        let Some((group, _)) = s.group_and_manager_mut(&entry.request_id) else {
            continue;
        };
        if !group.is_prefill() {
            let ids: Vec<u64> = group
                .seqs_with_status(SequenceStatus::Running)
                .map(|q| q.seq_id)
                .collect();
            for sid in ids {
                group
                    .find_mut(sid)
                    .unwrap()
                    .append_token_id(1000, &Default::default());
            }
        }
        group.update_num_computed_tokens(entry.token_chunk_size);
    }
    s.free_finished();
}

#[test]
fn test_chunked_prefill_splits_across_iterations() {
    let config = SchedulerConfig {
        enable_chunked_prefill: true,
        max_num_batched_tokens: 16,
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 64, 16));
    enqueue(&mut s, "r1", 0, 40, 8, 4);

    let mut chunks = Vec::new();
    for now in 0..4 {
        let plan = s.schedule(now as f64).unwrap();
        chunks.push(plan.scheduled[0].token_chunk_size);
        apply_step(&mut s, &plan);
    }
    // 40 prompt tokens under a 16-token budget, then the first decode.
    assert_eq!(chunks, vec![16, 16, 8, 1]);
}

#[test]
fn test_chunked_cobatches_decode_with_prefill() {
    let config = SchedulerConfig {
        enable_chunked_prefill: true,
        max_num_batched_tokens: 16,
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 64, 16));
    enqueue(&mut s, "r1", 0, 8, 8, 4);

    // Run r1 through its prefill so it is decoding.
    let plan = s.schedule(0.0).unwrap();
    apply_step(&mut s, &plan);

    enqueue(&mut s, "r2", 1, 40, 8, 4);
    let plan = s.schedule(1.0).unwrap();
    // Prefill entries precede decode entries; r2 gets the budget left
    // after r1's decode token.
    assert_eq!(plan.num_prefill_groups, 1);
    assert_eq!(plan.scheduled[0].request_id, "r2");
    assert_eq!(plan.scheduled[0].token_chunk_size, 15);
    assert_eq!(plan.scheduled[1].request_id, "r1");
    assert_eq!(plan.scheduled[1].token_chunk_size, 1);
}

#[test]
fn test_budget_invariant_holds_every_iteration() {
    let config = SchedulerConfig {
        enable_chunked_prefill: true,
        max_num_batched_tokens: 32,
        max_num_seqs: 4,
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 48, 16));
    for i in 0..8 {
        enqueue(&mut s, &format!("r{i}"), i, 24, 8, 4);
    }
    for now in 0..40 {
        let plan = s.schedule(now as f64).unwrap();
        assert!(plan.num_batched_tokens <= 32, "iteration {now}");
        apply_step(&mut s, &plan);
    }
}

#[test]
fn test_default_mode_never_mixes_prefill_and_decode() {
    let mut s = Scheduler::new(SchedulerConfig::default(), &cache(4, 64, 16));
    enqueue(&mut s, "r1", 0, 8, 8, 4);
    let plan = s.schedule(0.0).unwrap();
    apply_step(&mut s, &plan);

    enqueue(&mut s, "r2", 1, 8, 8, 4);
    let plan = s.schedule(1.0).unwrap();
    // The prefill iteration returns immediately; the decode waits.
    assert_eq!(plan.num_prefill_groups, plan.scheduled.len());
    assert_eq!(plan.scheduled[0].request_id, "r2");
}

#[test]
fn test_swap_preemption_prefers_last_arrival() {
    let config = SchedulerConfig {
        preemption_mode: Some(PreemptionMode::Swap),
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 4, 8));
    enqueue(&mut s, "old", 0, 8, 16, 4);
    enqueue(&mut s, "new", 1, 8, 16, 4);

    let plan = s.schedule(0.0).unwrap();
    assert_eq!(plan.scheduled.len(), 2);
    apply_step(&mut s, &plan);

    // Both decode; the device is full, so the later arrival is evicted.
    let plan = s.schedule(1.0).unwrap();
    assert_eq!(plan.preempted, 1);
    assert!(!plan.blocks_to_swap_out.is_empty());
    let (_, _, n_swapped) = s.queue_lens();
    assert_eq!(n_swapped, 1);
    let victim = s.get_group("new").unwrap();
    assert_eq!(victim.seqs[0].status, SequenceStatus::Swapped);
    assert!(s
        .get_group("old")
        .unwrap()
        .seqs[0]
        .block_table
        .iter()
        .all(|r| r.tier == Tier::Device));
}

#[test]
fn test_partial_swap_evicts_in_units_and_restores() {
    let config = SchedulerConfig {
        enable_chunked_prefill: true,
        swap_out_mode: SwapMode::Partial,
        swap_out_partial_rate: 0.5,
        preemption_mode: Some(PreemptionMode::Swap),
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 12, 16));
    // r0: 4 blocks, r1: 8 blocks; together they fill the device.
    enqueue(&mut s, "r0", 0, 13, 40, 4);
    enqueue(&mut s, "r1", 1, 29, 40, 4);

    let plan = s.schedule(0.0).unwrap();
    assert_eq!(plan.num_prefill_groups, 2);
    apply_step(&mut s, &plan);
    assert_eq!(s.block_manager().num_free_device_blocks(), 0);

    // r0's decode cannot fit: one partial unit of r1 (8 * 0.5 = 4
    // blocks) moves out, the rest stays resident.
    let plan = s.schedule(1.0).unwrap();
    assert_eq!(plan.blocks_to_swap_out.len(), 4);
    assert_eq!(s.partial_swapped_remaining("r1"), Some(4));
    assert_eq!(
        s.get_group("r1").unwrap().seqs[0].status,
        SequenceStatus::PartialSwapped
    );
    apply_step(&mut s, &plan);

    // Keep decoding r0 until it needs the rest of r1's blocks; the
    // remainder is then fully evicted through the partial-swap table.
    let mut saw_full_evict = false;
    for now in 2..40 {
        let plan = s.schedule(now as f64).unwrap();
        apply_step(&mut s, &plan);
        if s.partial_swapped_remaining("r1").is_none() {
            let r1 = s.get_group("r1").unwrap();
            if r1.seqs[0].status == SequenceStatus::Swapped {
                saw_full_evict = true;
                break;
            }
        }
    }
    assert!(saw_full_evict, "r1 never fully evicted");
    assert_eq!(s.stats().total_swap_out_blocks, 8);

    // Retire r0; r1 swaps back in whole.
    {
        let (r0, _) = s.group_and_manager_mut("r0").unwrap();
        for seq in &mut r0.seqs {
            seq.status = SequenceStatus::FinishedStopped;
        }
    }
    s.free_finished();

    let plan = s.schedule(100.0).unwrap();
    assert_eq!(plan.blocks_to_swap_in.len(), 8);
    let r1 = s.get_group("r1").unwrap();
    assert_eq!(r1.seqs[0].status, SequenceStatus::Running);
    assert_eq!(r1.seqs[0].num_computed_tokens(), 29);
    assert!(r1.seqs[0].block_table.iter().all(|r| r.tier == Tier::Device));
    assert_eq!(s.stats().total_swap_in_blocks, 8);
}

#[test]
fn test_deterministic_replay_with_random_policy() {
    let build = || {
        let config = SchedulerConfig {
            policy: Policy::Random,
            seed: 1234,
            enable_chunked_prefill: true,
            max_num_batched_tokens: 32,
            ..Default::default()
        };
        let mut s = Scheduler::new(config, &cache(4, 32, 16));
        for i in 0..6 {
            enqueue(&mut s, &format!("r{i}"), i, 16 + i as usize, 8, 4);
        }
        s
    };
    let mut a = build();
    let mut b = build();

    for now in 0..30 {
        let plan_a = a.schedule(now as f64).unwrap();
        let plan_b = b.schedule(now as f64).unwrap();
        assert_eq!(plan_a, plan_b, "diverged at iteration {now}");
        apply_step(&mut a, &plan_a);
        apply_step(&mut b, &plan_b);
    }
}

#[test]
fn test_sjf_orders_decodes_by_job_size() {
    let config = SchedulerConfig {
        policy: Policy::Sjf,
        enable_chunked_prefill: true,
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 64, 16));
    enqueue(&mut s, "long", 0, 8, 512, 4);
    enqueue(&mut s, "short", 1, 8, 8, 4);

    let plan = s.schedule(0.0).unwrap();
    apply_step(&mut s, &plan);

    // Both decode; the shorter job is served first in the batch.
    let plan = s.schedule(1.0).unwrap();
    let decode_ids: Vec<&str> = plan
        .scheduled
        .iter()
        .map(|g| g.request_id.as_str())
        .collect();
    assert_eq!(decode_ids, vec!["short", "long"]);
}

#[test]
fn test_tradeoff_defers_partially_swapped_groups() {
    let config = SchedulerConfig {
        policy: Policy::TfitTradeoff,
        enable_chunked_prefill: true,
        swap_out_mode: SwapMode::Partial,
        swap_out_partial_rate: 0.5,
        preemption_mode: Some(PreemptionMode::Swap),
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 12, 16));
    // r0 scores higher (close to its length cap), so r1 is the victim;
    // r1's footprint exceeds r0's need, making the swap partial.
    enqueue(&mut s, "r0", 0, 13, 14, 4);
    enqueue(&mut s, "r1", 1, 29, 40, 4);

    let plan = s.schedule(0.0).unwrap();
    apply_step(&mut s, &plan);
    // Force the partial swap of r1.
    let plan = s.schedule(1.0).unwrap();
    apply_step(&mut s, &plan);
    assert!(s.partial_swapped_remaining("r1").is_some());

    // Under the tradeoff policy a half-resident group is not swapped back
    // in, even though the device now has room for its host blocks.
    for now in 2..6 {
        let plan = s.schedule(now as f64).unwrap();
        assert!(plan.blocks_to_swap_in.is_empty());
        apply_step(&mut s, &plan);
        if s.partial_swapped_remaining("r1").is_none() {
            break;
        }
        assert_eq!(
            s.get_group("r1").unwrap().seqs[0].status,
            SequenceStatus::PartialSwapped
        );
    }
}

#[test]
fn test_waiting_iterations_accumulate_while_starved() {
    let config = SchedulerConfig {
        enable_chunked_prefill: true,
        ..Default::default()
    };
    // The first request leaves too little room for the second.
    let mut s = Scheduler::new(config, &cache(4, 4, 8));
    enqueue(&mut s, "hog", 0, 8, 64, 4);
    enqueue(&mut s, "starved", 1, 16, 8, 4);

    for now in 0..5 {
        let plan = s.schedule(now as f64).unwrap();
        apply_step(&mut s, &plan);
    }
    let starved = s.get_group("starved").unwrap();
    assert!(starved.metrics.waiting_iter_count >= 4);
    assert_eq!(s.get_group("hog").unwrap().metrics.waiting_iter_count, 0);
}

#[test]
fn test_zero_chunk_stops_queue_consumption() {
    let config = SchedulerConfig {
        enable_chunked_prefill: true,
        max_num_batched_tokens: 8,
        ..Default::default()
    };
    let mut s = Scheduler::new(config, &cache(4, 64, 16));
    enqueue(&mut s, "big", 0, 40, 8, 4);
    enqueue(&mut s, "next", 1, 8, 8, 4);

    // The whole budget goes to the first prompt's chunk; the second
    // request makes no partial progress.
    let plan = s.schedule(0.0).unwrap();
    assert_eq!(plan.scheduled.len(), 1);
    assert_eq!(plan.scheduled[0].request_id, "big");
    assert_eq!(plan.scheduled[0].token_chunk_size, 8);
}
