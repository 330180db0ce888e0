//! Runtime configuration for kv-sched.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. The scheduler and block manager consume these structs
//! directly; the CLI below belongs to the demo binary only.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::sched::policy::Policy;

/// Command-line arguments for the demo driver.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-sched", about = "Paged KV-cache scheduling engine (synthetic driver)")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the trace CSV output path.
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler behavior.
    pub scheduler: SchedulerConfig,

    /// KV-cache block pools.
    pub cache: CacheConfig,

    /// Synthetic workload shape (demo driver only).
    pub workload: WorkloadConfig,

    /// Per-iteration trace output.
    pub trace: TraceConfig,
}

/// How a preempted victim gives up its device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptionMode {
    /// Copy blocks to the host tier; reversible.
    Swap,
    /// Discard blocks and replay the whole stream as a fresh prefill.
    Recompute,
}

/// Whether swap-out eviction moves whole groups or block units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapMode {
    Full,
    Partial,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max aggregate tokens batched per iteration.
    pub max_num_batched_tokens: usize,

    /// Max sequences active in one iteration.
    pub max_num_seqs: usize,

    /// Model context length; prompts beyond it are rejected.
    pub max_model_len: usize,

    /// Queue ordering policy.
    pub policy: Policy,

    /// Allow prefills to be split across iterations and co-batched with
    /// decodes.
    pub enable_chunked_prefill: bool,

    /// Forced preemption mode; `None` picks per victim (recompute for
    /// single-sequence groups, swap otherwise).
    pub preemption_mode: Option<PreemptionMode>,

    /// Full- or partial-group swap out under memory pressure.
    pub swap_out_mode: SwapMode,

    /// Fraction of a victim's blocks forming one partial swap-out unit.
    pub swap_out_partial_rate: f64,

    /// Extra slots reserved per decode for speculative execution.
    pub num_lookahead_slots: usize,

    /// Delay prompt scheduling until the waiting queue had time to fill:
    /// new prefills wait `delay_factor * last_prompt_latency` seconds
    /// after the earliest arrival. Zero disables the gate.
    pub delay_factor: f64,

    /// Wall-clock deadline in seconds; on crossing it, all queues finish
    /// with an empty plan.
    pub deadline: Option<f64>,

    /// RNG seed for the random policy.
    pub seed: u64,

    /// Skip-join MLFQ: quantum growth ratio between levels.
    pub mlfq_quantum_ratio: u32,

    /// Skip-join MLFQ: quantum of the top level, in tokens.
    pub mlfq_min_quantum: usize,

    /// Skip-join MLFQ: waiting iterations before starvation promotion.
    pub mlfq_starve_limit: u64,

    /// Highest EOS vocabulary rank the tradeoff policy considers; defaults
    /// to the vocabulary size.
    pub max_eos_rank: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 2048,
            max_num_seqs: 64,
            max_model_len: 4096,
            policy: Policy::Fcfs,
            enable_chunked_prefill: false,
            preemption_mode: None,
            swap_out_mode: SwapMode::Full,
            swap_out_partial_rate: 0.5,
            num_lookahead_slots: 0,
            delay_factor: 0.0,
            deadline: None,
            seed: 0,
            mlfq_quantum_ratio: 2,
            mlfq_min_quantum: 2,
            mlfq_starve_limit: 5,
            max_eos_rank: 32000.0,
        }
    }
}

/// Block pool sizing for both tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per block.
    pub block_size: usize,

    /// Device-tier pool size in blocks.
    pub num_device_blocks: usize,

    /// Host-tier pool size in blocks.
    pub num_host_blocks: usize,

    /// Fraction of device blocks kept free as an admission reserve.
    pub watermark: f64,

    /// Reuse computed blocks across requests sharing a prompt prefix.
    pub enable_prefix_caching: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_device_blocks: 512,
            num_host_blocks: 256,
            watermark: 0.01,
            enable_prefix_caching: false,
        }
    }
}

impl CacheConfig {
    /// The admission reserve expressed in blocks.
    pub fn watermark_blocks(&self) -> usize {
        (self.watermark * self.num_device_blocks as f64) as usize
    }
}

/// Shape of the synthetic workload the demo driver submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub num_requests: usize,
    pub prompt_len_min: usize,
    pub prompt_len_max: usize,
    pub max_tokens_min: usize,
    pub max_tokens_max: usize,

    /// Mean gap between request arrivals, in milliseconds.
    pub arrival_interval_ms: u64,

    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_requests: 64,
            prompt_len_min: 32,
            prompt_len_max: 512,
            max_tokens_min: 16,
            max_tokens_max: 256,
            arrival_interval_ms: 5,
            seed: 0,
        }
    }
}

/// Per-iteration CSV trace output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("kv-sched-trace.csv"),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
