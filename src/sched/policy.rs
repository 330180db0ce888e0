//! Queue-ordering policies.
//!
//! Every policy reduces to a score per sequence group (higher runs
//! earlier); ties break by arrival order. The scheduler re-sorts the
//! relevant queue immediately before consuming it. Policies read public
//! group state and may update policy-owned bookkeeping on the group
//! (MLFQ level, cached priority rate) but never touch the allocators.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::sequence::group::SequenceGroup;
use crate::sequence::EOS_ESTIMATION_WINDOW;

/// Which queue a sort call is ordering; the tradeoff policy scores
/// waiting and running requests differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Waiting,
    Running,
    Swapped,
}

/// The closed set of scheduling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// First come, first served.
    Fcfs,
    /// Uniformly random order (seeded).
    Random,
    /// Shortest job first, by requested max_tokens.
    Sjf,
    /// Shortest remaining job first.
    Srjf,
    /// Least attained service: fewest generated tokens first.
    Las,
    /// Longest job first, discounted by squared waiting iterations.
    Ljf,
    /// Longest-waiting first.
    Wtf,
    /// Most uncomputed tokens first.
    Utf,
    /// Skip-join multi-level feedback queue.
    #[serde(rename = "sjmlfq")]
    SkipJoinMlfq,
    /// Gittins-style termination-probability scheduling.
    Infer,
    /// Latency/throughput tradeoff scoring.
    #[serde(rename = "tfittradeoff")]
    TfitTradeoff,
}

/// Policy tuning pulled out of the scheduler config.
#[derive(Debug, Clone, Copy)]
pub struct PolicyParams {
    pub mlfq_quantum_ratio: u32,
    pub mlfq_min_quantum: usize,
    pub mlfq_starve_limit: u64,
    pub max_eos_rank: f64,
}

impl PolicyParams {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            mlfq_quantum_ratio: config.mlfq_quantum_ratio,
            mlfq_min_quantum: config.mlfq_min_quantum,
            mlfq_starve_limit: config.mlfq_starve_limit,
            max_eos_rank: config.max_eos_rank,
        }
    }
}

impl Policy {
    /// Whether the waiting queue is policy-ordered rather than consumed
    /// in arrival order.
    pub fn sorts_waiting_queue(&self) -> bool {
        matches!(self, Policy::TfitTradeoff)
    }
}

/// Sort `queue` in place so that the highest-priority group is at the
/// front. Stable; equal scores keep arrival order.
pub fn sort_by_priority(
    policy: Policy,
    params: &PolicyParams,
    kind: QueueKind,
    now: f64,
    queue: &mut VecDeque<String>,
    groups: &mut HashMap<String, SequenceGroup>,
    rng: &mut StdRng,
) {
    if queue.len() < 2 {
        return;
    }

    // The tradeoff policy scores signal-less groups by the queue average.
    let avg_priority_rate = if policy == Policy::TfitTradeoff {
        let rates: Vec<f64> = queue
            .iter()
            .filter_map(|id| groups.get(id))
            .map(|g| g.priority_rate)
            .filter(|&r| r > 0.0)
            .collect();
        if rates.is_empty() {
            1.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        }
    } else {
        1.0
    };

    let mut keyed: Vec<(f64, f64, String)> = Vec::with_capacity(queue.len());
    for id in queue.iter() {
        let group = groups.get_mut(id).expect("queued group missing");
        let score = score_group(policy, params, kind, now, avg_priority_rate, group, rng);
        keyed.push((score, group.metrics.arrival_time, id.clone()));
    }
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.total_cmp(&b.1)));

    queue.clear();
    queue.extend(keyed.into_iter().map(|(_, _, id)| id));
}

fn score_group(
    policy: Policy,
    params: &PolicyParams,
    kind: QueueKind,
    now: f64,
    avg_priority_rate: f64,
    group: &mut SequenceGroup,
    rng: &mut StdRng,
) -> f64 {
    let waiting = group.metrics.waiting_iter_count as f64;
    match policy {
        Policy::Fcfs => now - group.metrics.arrival_time,
        Policy::Random => rng.gen::<f64>(),
        Policy::Sjf => -(group.max_tokens() as f64),
        Policy::Srjf => -(group.max_tokens() as f64 - group.decode_len() as f64),
        Policy::Las => -(group.decode_len() as f64),
        Policy::Ljf => group.seq_len() as f64 - waiting * waiting,
        Policy::Wtf => waiting,
        Policy::Utf => group.num_uncomputed_tokens() as f64,
        Policy::SkipJoinMlfq => mlfq_score(params, now, group),
        Policy::Infer => gittins_score(group),
        Policy::TfitTradeoff => tradeoff_score(params, kind, avg_priority_rate, group),
    }
}

/// Skip-join MLFQ: a request joins at the shallowest level whose quantum
/// covers its prompt, demotes when it overstays the level quantum, and
/// promotes back to the top once it starves.
fn mlfq_score(params: &PolicyParams, now: f64, group: &mut SequenceGroup) -> f64 {
    let level = match group.mlfq_level {
        None => {
            let mut level = 1u32;
            let mut quantum = params.mlfq_min_quantum;
            while quantum <= group.prompt_len() {
                level += 1;
                quantum *= params.mlfq_quantum_ratio as usize;
            }
            level
        }
        Some(mut level) => {
            if group.metrics.waiting_iter_count >= params.mlfq_starve_limit && !group.mlfq_promoted
            {
                group.mlfq_promoted = true;
                level = 1;
            } else if let Some(first) = group.metrics.first_scheduled_time {
                let quantum = params.mlfq_min_quantum as f64
                    * (params.mlfq_quantum_ratio as f64).powi(level as i32 - 1);
                if now - first > quantum && !group.mlfq_promoted {
                    level += 1;
                }
            }
            level
        }
    };
    group.mlfq_level = Some(level);
    -(level as f64)
}

/// Gittins-style index: probability the request terminates within the
/// estimation horizon divided by its expected remaining length, boosted
/// for long-waiting requests.
fn gittins_score(group: &SequenceGroup) -> f64 {
    let mut max_eos_logprob: Option<f64> = None;
    for seq in &group.seqs {
        match seq.eos_logprob_window() {
            Some(window) => {
                for &lp in window {
                    max_eos_logprob = Some(max_eos_logprob.map_or(lp, |m: f64| m.max(lp)));
                }
            }
            // No trustworthy signal yet: fall back to a length prior.
            None => return 2000.0 - group.seq_len() as f64,
        }
    }
    let Some(max_lp) = max_eos_logprob else {
        return 2000.0 - group.seq_len() as f64;
    };

    let n = EOS_ESTIMATION_WINDOW as f64;
    let p = max_lp.exp().clamp(1e-9, 1.0 - 1e-9);
    let v = 1.0 - p;
    let p_terminate = 1.0 - v.powf(n);
    let expected_remaining = v * ((1.0 + n * v.powf(n + 1.0) - (n + 1.0) * v.powf(n)) / (p * p));
    let gittins = p_terminate / expected_remaining.max(1e-9);

    let waiting = group.metrics.waiting_iter_count as f64;
    let boost = waiting * waiting * (group.decode_len() as f64).sqrt();
    gittins * (1.0 + boost)
}

/// Tradeoff policy: running requests are ranked by how close their EOS
/// rank sits to the top of the vocabulary, weighted by relative length;
/// waiting (and swapped) requests fold their waiting iterations into the
/// numerator so starving requests climb.
fn tradeoff_score(
    params: &PolicyParams,
    kind: QueueKind,
    avg_priority_rate: f64,
    group: &mut SequenceGroup,
) -> f64 {
    let mut ranks: Vec<i64> = Vec::new();
    for seq in &group.seqs {
        match seq.eos_rank_window() {
            Some(window) => ranks.extend(window.iter().copied()),
            None => ranks.push(-1),
        }
    }
    let min_rank = ranks.iter().copied().min().unwrap_or(-1);
    let max_rank = if ranks.len() < 10 {
        params.max_eos_rank
    } else {
        let tail = &ranks[10..];
        let mean = tail.iter().map(|&r| r as f64).sum::<f64>() / tail.len() as f64;
        if mean > 0.0 {
            mean
        } else {
            params.max_eos_rank
        }
    };
    let max_len = group.max_tokens().max(1) as f64;

    match kind {
        QueueKind::Running => {
            if min_rank > 0 {
                let rate = (max_rank - min_rank as f64) / max_rank;
                group.priority_rate = rate;
                rate * group.seq_len() as f64 / max_len
            } else {
                group.seq_len() as f64 / max_len
            }
        }
        QueueKind::Waiting | QueueKind::Swapped => {
            let numerator = (group.seq_len() as f64
                + group.metrics.waiting_iter_count as f64)
                / max_len;
            if min_rank > 0 {
                let rate = (max_rank - min_rank as f64) / max_rank;
                group.priority_rate = rate;
                rate * numerator
            } else {
                avg_priority_rate * numerator
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::sampling::SamplingParams;
    use crate::sequence::{Logprob, Sequence};
    use rand::SeedableRng;

    fn make_group(id: &str, arrival: f64, prompt_len: usize, max_tokens: usize) -> SequenceGroup {
        let seq = Sequence::new(0, (0..prompt_len as u32).collect(), 16, Some(2));
        SequenceGroup::new(
            id,
            seq,
            SamplingParams::with_max_tokens(max_tokens),
            arrival,
        )
    }

    fn sort(
        policy: Policy,
        kind: QueueKind,
        groups: &mut HashMap<String, SequenceGroup>,
        ids: &[&str],
    ) -> Vec<String> {
        let params = PolicyParams::from_config(&SchedulerConfig::default());
        let mut queue: VecDeque<String> = ids.iter().map(|s| s.to_string()).collect();
        let mut rng = StdRng::seed_from_u64(7);
        sort_by_priority(policy, &params, kind, 100.0, &mut queue, groups, &mut rng);
        queue.into_iter().collect()
    }

    #[test]
    fn test_fcfs_orders_by_arrival() {
        let mut groups = HashMap::new();
        groups.insert("a".into(), make_group("a", 3.0, 8, 16));
        groups.insert("b".into(), make_group("b", 1.0, 8, 16));
        groups.insert("c".into(), make_group("c", 2.0, 8, 16));
        let order = sort(Policy::Fcfs, QueueKind::Waiting, &mut groups, &["a", "b", "c"]);
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_sjf_prefers_short_jobs() {
        let mut groups = HashMap::new();
        groups.insert("long".into(), make_group("long", 0.0, 8, 512));
        groups.insert("short".into(), make_group("short", 1.0, 8, 8));
        let order = sort(Policy::Sjf, QueueKind::Waiting, &mut groups, &["long", "short"]);
        assert_eq!(order, vec!["short", "long"]);
    }

    #[test]
    fn test_ties_break_by_arrival() {
        let mut groups = HashMap::new();
        groups.insert("late".into(), make_group("late", 5.0, 8, 16));
        groups.insert("early".into(), make_group("early", 1.0, 8, 16));
        let order = sort(Policy::Sjf, QueueKind::Waiting, &mut groups, &["late", "early"]);
        assert_eq!(order, vec!["early", "late"]);
    }

    #[test]
    fn test_wtf_prefers_starving() {
        let mut groups = HashMap::new();
        groups.insert("fresh".into(), make_group("fresh", 0.0, 8, 16));
        let mut starving = make_group("starving", 1.0, 8, 16);
        starving.metrics.waiting_iter_count = 9;
        groups.insert("starving".into(), starving);
        let order = sort(Policy::Wtf, QueueKind::Waiting, &mut groups, &["fresh", "starving"]);
        assert_eq!(order, vec!["starving", "fresh"]);
    }

    #[test]
    fn test_random_is_seed_deterministic() {
        let mut groups_a = HashMap::new();
        let mut groups_b = HashMap::new();
        for id in ["a", "b", "c", "d"] {
            groups_a.insert(id.into(), make_group(id, 0.0, 8, 16));
            groups_b.insert(id.into(), make_group(id, 0.0, 8, 16));
        }
        let order_a = sort(Policy::Random, QueueKind::Waiting, &mut groups_a, &["a", "b", "c", "d"]);
        let order_b = sort(Policy::Random, QueueKind::Waiting, &mut groups_b, &["a", "b", "c", "d"]);
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn test_mlfq_initial_level_tracks_prompt_len() {
        let params = PolicyParams::from_config(&SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        // quantum ladder: 2, 4, 8, 16, ...
        let mut short = make_group("s", 0.0, 1, 16);
        let mut long = make_group("l", 0.0, 100, 16);
        let s = score_group(Policy::SkipJoinMlfq, &params, QueueKind::Waiting, 0.0, 1.0, &mut short, &mut rng);
        let l = score_group(Policy::SkipJoinMlfq, &params, QueueKind::Waiting, 0.0, 1.0, &mut long, &mut rng);
        assert!(s > l);
        assert_eq!(short.mlfq_level, Some(1));
        assert!(long.mlfq_level.unwrap() > 5);
    }

    #[test]
    fn test_mlfq_starvation_promotes_to_top() {
        let params = PolicyParams::from_config(&SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let mut group = make_group("g", 0.0, 100, 16);
        score_group(Policy::SkipJoinMlfq, &params, QueueKind::Waiting, 0.0, 1.0, &mut group, &mut rng);
        assert!(group.mlfq_level.unwrap() > 1);
        group.metrics.waiting_iter_count = 5;
        score_group(Policy::SkipJoinMlfq, &params, QueueKind::Waiting, 0.0, 1.0, &mut group, &mut rng);
        assert_eq!(group.mlfq_level, Some(1));
        assert!(group.mlfq_promoted);
    }

    #[test]
    fn test_infer_falls_back_without_signal() {
        let params = PolicyParams::from_config(&SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let mut group = make_group("g", 0.0, 10, 16);
        let score = score_group(Policy::Infer, &params, QueueKind::Running, 0.0, 1.0, &mut group, &mut rng);
        assert_eq!(score, 2000.0 - 10.0);
    }

    #[test]
    fn test_infer_ranks_likely_terminators_first() {
        let params = PolicyParams::from_config(&SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let mut near = make_group("near", 0.0, 4, 64);
        let mut far = make_group("far", 0.0, 4, 64);
        for i in 0..EOS_ESTIMATION_WINDOW {
            let tok = 50 + i as u32;
            for (group, eos_lp) in [(&mut near, -0.2f64), (&mut far, -9.0f64)] {
                let mut lps = HashMap::new();
                lps.insert(tok, Logprob { logprob: -0.5, rank: Some(1) });
                lps.insert(2, Logprob { logprob: eos_lp, rank: Some(3) });
                group.seqs[0].append_token_id(tok, &lps);
            }
        }
        let near_score = score_group(Policy::Infer, &params, QueueKind::Running, 0.0, 1.0, &mut near, &mut rng);
        let far_score = score_group(Policy::Infer, &params, QueueKind::Running, 0.0, 1.0, &mut far, &mut rng);
        assert!(near_score > far_score);
    }

    #[test]
    fn test_tradeoff_waiting_bias() {
        let params = PolicyParams::from_config(&SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let mut fresh = make_group("fresh", 0.0, 32, 64);
        let mut starving = make_group("starving", 0.0, 32, 64);
        starving.metrics.waiting_iter_count = 40;
        let f = score_group(Policy::TfitTradeoff, &params, QueueKind::Waiting, 0.0, 1.0, &mut fresh, &mut rng);
        let s = score_group(Policy::TfitTradeoff, &params, QueueKind::Waiting, 0.0, 1.0, &mut starving, &mut rng);
        assert!(s > f);
    }
}
