//! Target selection strategies.
//!
//! The selector is a pure function of its inputs: the candidate list, the
//! strategy, previous attempts, a metrics snapshot and a random source.
//! Determinism holds for every strategy except `random`, which consumes the
//! caller's RNG.

use config::SelectorStrategy;
use rand::Rng;

use crate::{metrics::StatsSnapshot, router::TargetCandidate};

/// Inputs beyond the candidates themselves.
pub struct SelectionContext<'a> {
    /// Strategy from the alias configuration.
    pub strategy: SelectorStrategy,
    /// Candidate indices already attempted, for in-order rotation.
    pub previous_attempts: &'a [usize],
    /// Rolling-window provider statistics.
    pub stats: &'a StatsSnapshot,
}

/// Pick one candidate, or `None` when the list is empty.
pub fn select<'a, R>(
    candidates: &'a [TargetCandidate],
    context: &SelectionContext<'_>,
    rng: &mut R,
) -> Option<&'a TargetCandidate>
where
    R: Rng + ?Sized,
{
    if candidates.is_empty() {
        return None;
    }

    let picked = match context.strategy {
        SelectorStrategy::Random => weighted_random(candidates, rng),
        SelectorStrategy::InOrder => in_order(candidates, context.previous_attempts),
        SelectorStrategy::Cost => {
            by_key_ascending(candidates, |candidate| candidate.cost_per_mtok)
        }
        SelectorStrategy::Latency => by_key_ascending(candidates, |candidate| {
            context.stats.provider(&candidate.provider).and_then(|stats| stats.avg_ttft_ms)
        }),
        SelectorStrategy::Performance => by_key_descending(candidates, |candidate| {
            context
                .stats
                .provider(&candidate.provider)
                .and_then(|stats| stats.tokens_per_second)
        }),
        SelectorStrategy::Usage => candidates.iter().min_by_key(|candidate| {
            context
                .stats
                .provider(&candidate.provider)
                .map(|stats| stats.request_count)
                .unwrap_or(0)
        }),
    };

    picked.or_else(|| candidates.first())
}

fn weighted_random<'a, R>(candidates: &'a [TargetCandidate], rng: &mut R) -> Option<&'a TargetCandidate>
where
    R: Rng + ?Sized,
{
    let total: f64 = candidates.iter().map(|candidate| candidate.weight.max(0.0)).sum();

    if total <= 0.0 {
        let index = rng.random_range(0..candidates.len());
        return candidates.get(index);
    }

    let mut roll = rng.random_range(0.0..total);

    for candidate in candidates {
        let weight = candidate.weight.max(0.0);
        if roll < weight {
            return Some(candidate);
        }
        roll -= weight;
    }

    candidates.last()
}

fn in_order<'a>(candidates: &'a [TargetCandidate], previous_attempts: &[usize]) -> Option<&'a TargetCandidate> {
    candidates
        .iter()
        .find(|candidate| !previous_attempts.contains(&candidate.index))
        .or_else(|| candidates.first())
}

/// Lowest key wins; `None` keys sort last; ties keep configuration order.
fn by_key_ascending<F>(candidates: &[TargetCandidate], key: F) -> Option<&TargetCandidate>
where
    F: Fn(&TargetCandidate) -> Option<f64>,
{
    let mut best: Option<(&TargetCandidate, Option<f64>)> = None;

    for candidate in candidates {
        let value = key(candidate);

        best = match best {
            None => Some((candidate, value)),
            Some((_, None)) if value.is_some() => Some((candidate, value)),
            Some((_, Some(current))) if value.is_some_and(|v| v < current) => Some((candidate, value)),
            other => other,
        };
    }

    best.map(|(candidate, _)| candidate)
}

/// Highest key wins; `None` keys sort last; ties keep configuration order.
fn by_key_descending<F>(candidates: &[TargetCandidate], key: F) -> Option<&TargetCandidate>
where
    F: Fn(&TargetCandidate) -> Option<f64>,
{
    let mut best: Option<(&TargetCandidate, Option<f64>)> = None;

    for candidate in candidates {
        let value = key(candidate);

        best = match best {
            None => Some((candidate, value)),
            Some((_, None)) if value.is_some() => Some((candidate, value)),
            Some((_, Some(current))) if value.is_some_and(|v| v > current) => Some((candidate, value)),
            other => other,
        };
    }

    best.map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dialect::DialectTag, metrics::MetricsCollector};
    use rand::{SeedableRng, rngs::StdRng};
    use std::time::Duration;

    fn candidate(index: usize, provider: &str, weight: f64, cost: Option<f64>) -> TargetCandidate {
        TargetCandidate {
            index,
            provider: provider.to_string(),
            model: format!("model-{index}"),
            dialect: DialectTag::Chat,
            weight,
            cost_per_mtok: cost,
            account_id: None,
        }
    }

    fn empty_stats() -> StatsSnapshot {
        MetricsCollector::new(Duration::from_secs(300)).snapshot()
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let stats = empty_stats();
        let context = SelectionContext {
            strategy: SelectorStrategy::Random,
            previous_attempts: &[],
            stats: &stats,
        };

        let mut rng = StdRng::seed_from_u64(1);
        assert!(select(&[], &context, &mut rng).is_none());
    }

    #[test]
    fn weighted_random_converges_to_weights() {
        let candidates = vec![
            candidate(0, "a", 3.0, None),
            candidate(1, "b", 1.0, None),
        ];
        let stats = empty_stats();
        let context = SelectionContext {
            strategy: SelectorStrategy::Random,
            previous_attempts: &[],
            stats: &stats,
        };

        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0u32; 2];

        for _ in 0..10_000 {
            let picked = select(&candidates, &context, &mut rng).unwrap();
            counts[picked.index] += 1;
        }

        let share_a = counts[0] as f64 / 10_000.0;
        assert!((share_a - 0.75).abs() < 0.05, "share was {share_a}");
    }

    #[test]
    fn in_order_skips_previous_attempts() {
        let candidates = vec![
            candidate(0, "a", 1.0, None),
            candidate(1, "b", 1.0, None),
            candidate(2, "c", 1.0, None),
        ];
        let stats = empty_stats();
        let mut rng = StdRng::seed_from_u64(1);

        let context = SelectionContext {
            strategy: SelectorStrategy::InOrder,
            previous_attempts: &[0, 1],
            stats: &stats,
        };
        assert_eq!(select(&candidates, &context, &mut rng).unwrap().index, 2);

        // All attempted wraps back to the first.
        let context = SelectionContext {
            strategy: SelectorStrategy::InOrder,
            previous_attempts: &[0, 1, 2],
            stats: &stats,
        };
        assert_eq!(select(&candidates, &context, &mut rng).unwrap().index, 0);
    }

    #[test]
    fn cost_picks_cheapest_with_ties_by_order() {
        let candidates = vec![
            candidate(0, "a", 1.0, Some(12.0)),
            candidate(1, "b", 1.0, Some(3.0)),
            candidate(2, "c", 1.0, Some(3.0)),
            candidate(3, "d", 1.0, None),
        ];
        let stats = empty_stats();
        let mut rng = StdRng::seed_from_u64(1);

        let context = SelectionContext {
            strategy: SelectorStrategy::Cost,
            previous_attempts: &[],
            stats: &stats,
        };

        assert_eq!(select(&candidates, &context, &mut rng).unwrap().index, 1);
    }

    #[test]
    fn latency_prefers_observed_fast_providers() {
        let collector = MetricsCollector::new(Duration::from_secs(300));
        collector.record_first_token("fast", crate::tap::TapRole::Provider, 100.0);
        collector.record_first_token("slow", crate::tap::TapRole::Provider, 900.0);
        let stats = collector.snapshot();

        let candidates = vec![
            candidate(0, "unobserved", 1.0, None),
            candidate(1, "slow", 1.0, None),
            candidate(2, "fast", 1.0, None),
        ];
        let mut rng = StdRng::seed_from_u64(1);

        let context = SelectionContext {
            strategy: SelectorStrategy::Latency,
            previous_attempts: &[],
            stats: &stats,
        };

        assert_eq!(select(&candidates, &context, &mut rng).unwrap().provider, "fast");
    }

    #[test]
    fn performance_prefers_highest_throughput() {
        let collector = MetricsCollector::new(Duration::from_secs(300));
        collector.record_success("slow", 1_000.0, 10, 100, 0.0);
        collector.record_success("fast", 1_000.0, 10, 900, 0.0);
        let stats = collector.snapshot();

        let candidates = vec![candidate(0, "slow", 1.0, None), candidate(1, "fast", 1.0, None)];
        let mut rng = StdRng::seed_from_u64(1);

        let context = SelectionContext {
            strategy: SelectorStrategy::Performance,
            previous_attempts: &[],
            stats: &stats,
        };

        assert_eq!(select(&candidates, &context, &mut rng).unwrap().provider, "fast");
    }

    #[test]
    fn usage_prefers_least_recently_used() {
        let collector = MetricsCollector::new(Duration::from_secs(300));
        collector.record_start("busy");
        collector.record_start("busy");
        collector.record_start("idle");
        let stats = collector.snapshot();

        let candidates = vec![candidate(0, "busy", 1.0, None), candidate(1, "idle", 1.0, None)];
        let mut rng = StdRng::seed_from_u64(1);

        let context = SelectionContext {
            strategy: SelectorStrategy::Usage,
            previous_attempts: &[],
            stats: &stats,
        };

        assert_eq!(select(&candidates, &context, &mut rng).unwrap().provider, "idle");
    }
}
