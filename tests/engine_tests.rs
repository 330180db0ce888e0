//! End-to-end engine tests: the full add_request / step / output loop
//! against the simulated executor.

use kv_sched::cache::block::Tier;
use kv_sched::config::{CacheConfig, PreemptionMode, SchedulerConfig};
use kv_sched::engine::engine::{Engine, EngineRequest, ManualClock};
use kv_sched::engine::executor::SimulatedExecutor;
use kv_sched::sequence::sampling::SamplingParams;
use kv_sched::sequence::SequenceStatus;

const EOS: u32 = 2;

fn build_engine(
    scheduler: SchedulerConfig,
    block_size: usize,
    device: usize,
    host: usize,
) -> (Engine, ManualClock) {
    let cache = CacheConfig {
        block_size,
        num_device_blocks: device,
        num_host_blocks: host,
        watermark: 0.0,
        enable_prefix_caching: false,
    };
    // eos_prob 0: termination comes from max_tokens only.
    let executor = Box::new(SimulatedExecutor::new(7, 32000, EOS, 0.0));
    let clock = ManualClock::new(0.0);
    let engine = Engine::new(scheduler, &cache, executor)
        .with_eos_token(EOS)
        .with_clock(Box::new(clock.clone()));
    (engine, clock)
}

fn step(engine: &mut Engine, clock: &ManualClock) -> Vec<kv_sched::engine::outputs::RequestOutput> {
    let outputs = engine.step().unwrap();
    clock.advance(0.01);
    outputs
}

#[test]
fn test_single_short_request_runs_in_six_steps() {
    let (mut engine, clock) = build_engine(SchedulerConfig::default(), 16, 8, 4);
    engine
        .add_request("r1", (0..10).collect(), SamplingParams::with_max_tokens(5), 0)
        .unwrap();

    // Step 1: prefill only, no token yet.
    let outputs = step(&mut engine, &clock);
    assert_eq!(outputs.len(), 1);
    assert!(!outputs[0].finished);
    assert!(outputs[0].outputs[0].token_ids.is_empty());

    // Steps 2..=6: one decode token each.
    for expected_tokens in 1..=5usize {
        assert!(engine.has_unfinished_requests());
        let outputs = step(&mut engine, &clock);
        assert_eq!(outputs[0].outputs[0].token_ids.len(), expected_tokens);
    }

    assert!(!engine.has_unfinished_requests());
    // No stop token was sampled, so the request is length-capped.
    let (w, r, s) = engine.scheduler().queue_lens();
    assert_eq!((w, r, s), (0, 0, 0));
    assert_eq!(
        engine.scheduler().block_manager().num_free_device_blocks(),
        8
    );
}

#[test]
fn test_preempt_by_recompute_serializes_under_pressure() {
    let config = SchedulerConfig {
        preemption_mode: Some(PreemptionMode::Recompute),
        ..Default::default()
    };
    // Each request needs 3 of 4 device blocks: strictly one at a time.
    let (mut engine, clock) = build_engine(config, 4, 4, 4);
    for (i, id) in ["r1", "r2", "r3"].iter().enumerate() {
        engine
            .add_request(*id, (0..12).collect(), SamplingParams::with_max_tokens(1), i as u64)
            .unwrap();
    }

    // Step 1: only r1 fits.
    let outputs = step(&mut engine, &clock);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].request_id, "r1");

    // Step 2: r1 decodes its single token and finishes.
    let outputs = step(&mut engine, &clock);
    assert!(outputs[0].finished);
    assert_eq!(outputs[0].outputs[0].finish_reason, Some("length"));

    // Steps 3..6: r2 then r3, same two-step pattern.
    let outputs = step(&mut engine, &clock);
    assert_eq!(outputs[0].request_id, "r2");
    let outputs = step(&mut engine, &clock);
    assert!(outputs[0].finished);
    let outputs = step(&mut engine, &clock);
    assert_eq!(outputs[0].request_id, "r3");
    let outputs = step(&mut engine, &clock);
    assert!(outputs[0].finished);

    assert!(!engine.has_unfinished_requests());
    // Admission control did all the work; nothing was ever preempted.
    assert_eq!(engine.scheduler().stats().cumulative_preemptions, 0);
    assert_eq!(engine.scheduler().stats().total_swap_out_blocks, 0);
}

#[test]
fn test_swap_out_then_swap_in() {
    let config = SchedulerConfig {
        preemption_mode: Some(PreemptionMode::Swap),
        ..Default::default()
    };
    let (mut engine, clock) = build_engine(config, 4, 4, 8);
    engine
        .add_request("r1", (0..8).collect(), SamplingParams::with_max_tokens(8), 0)
        .unwrap();
    engine
        .add_request("r2", (0..8).collect(), SamplingParams::with_max_tokens(8), 1)
        .unwrap();

    let mut r2_was_swapped = false;
    let mut r2_resumed = false;
    for _ in 0..64 {
        step(&mut engine, &clock);
        if let Some(group) = engine.scheduler().get_group("r2") {
            if group.seqs[0].status == SequenceStatus::Swapped {
                // The victim's two blocks moved to the host tier whole.
                assert!(group.seqs[0].block_table.iter().all(|r| r.tier == Tier::Host));
                if !r2_was_swapped {
                    assert_eq!(engine.scheduler().stats().total_swap_out_blocks, 2);
                }
                r2_was_swapped = true;
            }
            if r2_was_swapped && !r2_resumed && group.seqs[0].status == SequenceStatus::Running {
                // Once r1 released the device, r2 came back whole.
                r2_resumed = true;
                assert!(group.seqs[0].block_table.iter().all(|r| r.tier == Tier::Device));
                assert_eq!(engine.scheduler().stats().total_swap_in_blocks, 2);
            }
        }
        if !engine.has_unfinished_requests() {
            break;
        }
    }

    assert!(r2_was_swapped, "r2 never went through the swapped queue");
    assert!(r2_resumed, "r2 never came back to the device");
    assert!(!engine.has_unfinished_requests());
    // Whatever the requests' fates, no block leaked on either tier.
    assert_eq!(
        engine.scheduler().block_manager().num_free_device_blocks(),
        4
    );
    assert_eq!(engine.scheduler().block_manager().num_free_host_blocks(), 8);
}

#[test]
fn test_parallel_sampling_shares_prompt_and_copies_on_write() {
    let (mut engine, clock) = build_engine(SchedulerConfig::default(), 4, 8, 4);
    let params = SamplingParams {
        best_of: 2,
        n: 2,
        max_tokens: 6,
        ..Default::default()
    };
    // Prompt of 3 leaves the shared last block partially filled.
    engine.add_request("r1", vec![5, 6, 7], params, 0).unwrap();

    // Step 1: prefill; step 2: first decode forks the sibling.
    step(&mut engine, &clock);
    step(&mut engine, &clock);
    {
        let group = engine.scheduler().get_group("r1").unwrap();
        assert_eq!(group.num_seqs(), 2);
        let shared = group.seqs[0].block_table[0];
        assert_eq!(group.seqs[1].block_table[0], shared);
        assert_eq!(engine.scheduler().block_manager().ref_count(shared), 2);
    }

    // Step 3: appending into the shared block triggers exactly one
    // copy-on-write; one extra device block is consumed.
    let free_before = engine.scheduler().block_manager().num_free_device_blocks();
    step(&mut engine, &clock);
    {
        let group = engine.scheduler().get_group("r1").unwrap();
        let a = group.seqs[0].block_table[0];
        let b = group.seqs[1].block_table[0];
        assert_ne!(a, b);
        assert_eq!(engine.scheduler().block_manager().ref_count(a), 1);
        assert_eq!(engine.scheduler().block_manager().ref_count(b), 1);
        assert_eq!(
            engine.scheduler().block_manager().num_free_device_blocks(),
            free_before - 1
        );
    }

    while engine.has_unfinished_requests() {
        step(&mut engine, &clock);
    }
    assert_eq!(
        engine.scheduler().block_manager().num_free_device_blocks(),
        8
    );
}

#[test]
fn test_deadline_stops_everything_once() {
    let config = SchedulerConfig {
        deadline: Some(10.0),
        ..Default::default()
    };
    let (mut engine, clock) = build_engine(config, 16, 16, 4);
    engine
        .add_request("r1", (0..8).collect(), SamplingParams::with_max_tokens(100), 0)
        .unwrap();
    engine
        .add_request("r2", (0..64).collect(), SamplingParams::with_max_tokens(100), 1)
        .unwrap();

    // A few normal iterations first.
    for _ in 0..3 {
        step(&mut engine, &clock);
    }
    assert!(engine.has_unfinished_requests());

    clock.set(20.0);
    let outputs = engine.step().unwrap();
    // Every surviving request is reported, finished, in the same pass.
    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(|o| o.finished));
    assert!(!engine.has_unfinished_requests());
    assert_eq!(
        engine.scheduler().block_manager().num_free_device_blocks(),
        16
    );

    // Subsequent iterations short-circuit to empty.
    let outputs = engine.step().unwrap();
    assert!(outputs.is_empty());
}

#[test]
fn test_abort_is_idempotent_and_drops_outputs() {
    let (mut engine, clock) = build_engine(SchedulerConfig::default(), 16, 16, 4);
    engine
        .add_request("keep", (0..8).collect(), SamplingParams::with_max_tokens(3), 0)
        .unwrap();
    engine
        .add_request("kill", (0..8).collect(), SamplingParams::with_max_tokens(50), 1)
        .unwrap();

    step(&mut engine, &clock);
    engine.abort_request(&["kill".to_string(), "kill".to_string()]);
    engine.abort_request(&["kill".to_string()]);
    assert!(engine.scheduler().get_group("kill").is_none());

    while engine.has_unfinished_requests() {
        let outputs = step(&mut engine, &clock);
        assert!(outputs.iter().all(|o| o.request_id != "kill"));
    }
    assert_eq!(
        engine.scheduler().block_manager().num_free_device_blocks(),
        16
    );
}

#[test]
fn test_duplicate_request_id_is_rejected() {
    let (mut engine, _clock) = build_engine(SchedulerConfig::default(), 16, 16, 4);
    engine
        .add_request("r1", vec![1, 2], SamplingParams::default(), 0)
        .unwrap();
    assert!(engine
        .add_request("r1", vec![3, 4], SamplingParams::default(), 1)
        .is_err());
}

#[test]
fn test_identical_runs_produce_identical_token_streams() {
    let run = || {
        let (mut engine, clock) = build_engine(SchedulerConfig::default(), 4, 8, 8);
        for i in 0..4u64 {
            engine
                .add_request(
                    format!("r{i}"),
                    (0..10 + i as u32).collect(),
                    SamplingParams::with_max_tokens(6),
                    i,
                )
                .unwrap();
        }
        let mut stream: Vec<(String, Vec<u32>)> = Vec::new();
        for _ in 0..200 {
            for out in step(&mut engine, &clock) {
                if out.finished {
                    stream.push((out.request_id.clone(), out.outputs[0].token_ids.clone()));
                }
            }
            if !engine.has_unfinished_requests() {
                break;
            }
        }
        stream
    };
    assert_eq!(run(), run());
}

#[test]
fn test_prefix_caching_reuses_computed_prompt_blocks() {
    let cache = CacheConfig {
        block_size: 4,
        num_device_blocks: 16,
        num_host_blocks: 8,
        watermark: 0.0,
        enable_prefix_caching: true,
    };
    let executor = Box::new(SimulatedExecutor::new(3, 32000, EOS, 0.0));
    let clock = ManualClock::new(0.0);
    let mut engine = Engine::new(SchedulerConfig::default(), &cache, executor)
        .with_eos_token(EOS)
        .with_clock(Box::new(clock.clone()));

    // Four exactly-full prompt blocks.
    let prompt: Vec<u32> = (100..116).collect();
    engine
        .add_request("a", prompt.clone(), SamplingParams::with_max_tokens(2), 0)
        .unwrap();
    step(&mut engine, &clock);
    let table_a: Vec<u32> = engine.scheduler().get_group("a").unwrap().seqs[0]
        .block_table
        .iter()
        .map(|r| r.block)
        .collect();
    while engine.has_unfinished_requests() {
        step(&mut engine, &clock);
    }

    // Same prompt again: the parked blocks come back under their hashes,
    // already marked computed up to the last full prefix block.
    engine
        .add_request("b", prompt, SamplingParams::with_max_tokens(2), 1)
        .unwrap();
    step(&mut engine, &clock);
    let group_b = engine.scheduler().get_group("b").unwrap();
    let table_b: Vec<u32> = group_b.seqs[0]
        .block_table
        .iter()
        .map(|r| r.block)
        .collect();
    assert_eq!(table_a, table_b);
    assert_eq!(engine.scheduler().common_computed_block_ids("b").len(), 3);
}

#[test]
fn test_inbox_submission_round_trip() {
    let (mut engine, clock) = build_engine(SchedulerConfig::default(), 16, 16, 4);
    let handle = engine.handle();
    handle.submit(EngineRequest {
        request_id: "via-inbox".to_string(),
        prompt_token_ids: (0..8).collect(),
        params: SamplingParams::with_max_tokens(2),
        arrival_time_ns: 5_000,
    });

    let mut finished = false;
    for _ in 0..10 {
        for out in step(&mut engine, &clock) {
            if out.request_id == "via-inbox" && out.finished {
                finished = true;
            }
        }
        if !engine.has_unfinished_requests() {
            break;
        }
    }
    assert!(finished);
}
