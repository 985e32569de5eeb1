//! Ranking Engine — periodic leaderboard snapshots over performance records.
//!
//! At each ranking period boundary every agent gets a composite score from
//! its cohort-normalized performance dimensions, a fully deterministic rank
//! (ties broken by lower drawdown, then agent id), deltas against the
//! previous snapshot, and a percentile tier. Output is append-only.

pub mod rotation;

pub use rotation::{RotationEngine, RotationState};

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::RankingConfig;
use crate::domain::{PerformanceRecord, PerformanceTier, RankingEntry};

pub struct RankingEngine {
    config: RankingConfig,
}

impl RankingEngine {
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    /// Rank the cohort for one period.
    ///
    /// `previous` is the immediately preceding snapshot; when absent, rank
    /// and score changes are zero and `has_previous` is false (no null
    /// propagation downstream).
    pub fn rank(
        &self,
        period: &str,
        records: &[PerformanceRecord],
        previous: &[RankingEntry],
    ) -> Vec<RankingEntry> {
        if records.is_empty() {
            return Vec::new();
        }

        let scores = self.composite_scores(records);

        // Deterministic order: score desc, then lower drawdown, then agent id
        let mut ordered: Vec<&PerformanceRecord> = records.iter().collect();
        ordered.sort_by(|a, b| {
            scores[&b.agent_id]
                .partial_cmp(&scores[&a.agent_id])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.max_drawdown
                        .partial_cmp(&b.max_drawdown)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let n = ordered.len();
        let prev_by_agent: BTreeMap<&str, &RankingEntry> = previous
            .iter()
            .map(|e| (e.agent_id.as_str(), e))
            .collect();

        ordered
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                let rank = idx as u32 + 1;
                let score = scores[&record.agent_id];
                let percentile = 100.0 * (n - idx - 1) as f64 / n as f64;
                let tier = PerformanceTier::from_percentile(percentile);

                let (score_change, rank_change, has_previous) =
                    match prev_by_agent.get(record.agent_id.as_str()) {
                        Some(prev) => (
                            score - prev.score,
                            prev.rank as i32 - rank as i32,
                            true,
                        ),
                        None => (0.0, 0, false),
                    };

                debug!(
                    period,
                    agent_id = %record.agent_id,
                    rank,
                    score,
                    tier = %tier,
                    "ranked agent"
                );

                RankingEntry {
                    period: period.to_string(),
                    agent_id: record.agent_id.clone(),
                    rank,
                    score,
                    score_change,
                    rank_change,
                    has_previous,
                    performance_tier: tier,
                    is_active: true,
                }
            })
            .collect()
    }

    /// Composite score per agent: weighted sum of cohort-normalized
    /// dimensions, drawdown inverted so lower is better.
    fn composite_scores(&self, records: &[PerformanceRecord]) -> BTreeMap<String, f64> {
        let accuracy = normalize(records, |r| r.accuracy);
        let sharpe = normalize(records, |r| r.sharpe);
        let drawdown = normalize(records, |r| r.max_drawdown);
        let win_rate = normalize(records, |r| r.win_rate);
        let consistency = normalize(records, |r| r.consistency_score);

        records
            .iter()
            .map(|r| {
                let id = r.agent_id.clone();
                let score = self.config.accuracy * accuracy[&r.agent_id]
                    + self.config.sharpe * sharpe[&r.agent_id]
                    + self.config.drawdown * (1.0 - drawdown[&r.agent_id])
                    + self.config.win_rate * win_rate[&r.agent_id]
                    + self.config.consistency * consistency[&r.agent_id];
                (id, score)
            })
            .collect()
    }
}

/// Cohort min-max normalization of one dimension into [0, 1]. A degenerate
/// cohort (all equal, or a single agent) normalizes to the neutral 0.5.
fn normalize<F: Fn(&PerformanceRecord) -> f64>(
    records: &[PerformanceRecord],
    dim: F,
) -> BTreeMap<String, f64> {
    let values: Vec<f64> = records.iter().map(&dim).collect();
    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    let min = values.iter().cloned().fold(f64::MAX, f64::min);

    records
        .iter()
        .map(|r| {
            let v = dim(r);
            let normalized = if max > min { (v - min) / (max - min) } else { 0.5 };
            (r.agent_id.clone(), normalized)
        })
        .collect()
}
