//! kv-sched demo driver.
//!
//! Runs the scheduling core against a simulated executor with a
//! synthetic workload: a submission task feeds requests through the
//! engine inbox while the main loop steps the engine until the workload
//! drains. Useful for exercising policies and reading the trace CSV.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use uuid::Uuid;

use kv_sched::config::{Cli, Config};
use kv_sched::engine::engine::{Engine, EngineRequest};
use kv_sched::engine::executor::SimulatedExecutor;
use kv_sched::sequence::sampling::SamplingParams;
use kv_sched::trace::TraceRecorder;

const VOCAB_SIZE: u32 = 32000;
const EOS_TOKEN_ID: u32 = 2;

fn arrival_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos() as u64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_sched=debug"
    } else {
        "kv_sched=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-sched v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(path) = cli.trace {
        config.trace.enabled = true;
        config.trace.path = path;
    }

    info!(
        block_size = config.cache.block_size,
        device_blocks = config.cache.num_device_blocks,
        host_blocks = config.cache.num_host_blocks,
        prefix_caching = config.cache.enable_prefix_caching,
        "cache configuration"
    );
    info!(
        policy = ?config.scheduler.policy,
        chunked_prefill = config.scheduler.enable_chunked_prefill,
        token_budget = config.scheduler.max_num_batched_tokens,
        max_seqs = config.scheduler.max_num_seqs,
        "scheduler configuration"
    );

    let executor = Box::new(SimulatedExecutor::new(
        config.workload.seed,
        VOCAB_SIZE,
        EOS_TOKEN_ID,
        0.02,
    ));
    let mut engine = Engine::new(config.scheduler.clone(), &config.cache, executor)
        .with_eos_token(EOS_TOKEN_ID);
    if config.trace.enabled {
        engine = engine.with_trace(TraceRecorder::create(&config.trace.path)?);
        info!(path = %config.trace.path.display(), "trace enabled");
    }

    // Submit the synthetic workload through the inbox from a side task;
    // the engine only sees it at iteration boundaries.
    let handle = engine.handle();
    let workload = config.workload.clone();
    let submitter = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(workload.seed);
        for _ in 0..workload.num_requests {
            let prompt_len = rng.gen_range(workload.prompt_len_min..=workload.prompt_len_max);
            let max_tokens = rng.gen_range(workload.max_tokens_min..=workload.max_tokens_max);
            let prompt_token_ids = (0..prompt_len)
                .map(|_| rng.gen_range(3..VOCAB_SIZE))
                .collect();
            handle.submit(EngineRequest {
                request_id: Uuid::new_v4().to_string(),
                prompt_token_ids,
                params: SamplingParams::with_max_tokens(max_tokens),
                arrival_time_ns: arrival_ns(),
            });
            tokio::time::sleep(Duration::from_millis(workload.arrival_interval_ms)).await;
        }
        info!(count = workload.num_requests, "workload submitted");
    });

    let mut completed = 0usize;
    let mut generated_tokens = 0usize;
    loop {
        let outputs = engine.step()?;
        for output in outputs {
            if output.finished {
                completed += 1;
                generated_tokens += output.outputs.iter().map(|o| o.token_ids.len()).sum::<usize>();
            }
        }
        if submitter.is_finished() && !engine.has_unfinished_requests() {
            break;
        }
        if !engine.has_unfinished_requests() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    engine.finish();

    let stats = engine.scheduler().stats().clone();
    info!(
        completed,
        generated_tokens,
        iterations = stats.iterations,
        preemptions = stats.cumulative_preemptions,
        swapped_out_blocks = stats.total_swap_out_blocks,
        swapped_in_blocks = stats.total_swap_in_blocks,
        "workload complete"
    );

    Ok(())
}
