//! Weight Calculator — turns performance, regime fit, and recency into a
//! normalized per-agent weight set.
//!
//! Weights are a convex combination of cohort-normalized scores, damped in
//! elevated volatility for agents with unstable votes, then renormalized to
//! sum to exactly 1. Cold-start agents are pinned at the 1/N prior so a new
//! agent is never permanently excluded. All iteration is over sorted keys:
//! identical inputs produce bit-identical output.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::WeightConfig;
use crate::domain::{AgentWeight, CalculationMethod, PerformanceRecord, RegimeState};
use crate::error::MetablendError;
use crate::tracker::TrackerSnapshot;

/// Signal-vote variance above which an agent counts as unstable in
/// high/extreme volatility.
const UNSTABLE_VARIANCE: f64 = 1.0;

pub struct WeightCalculator {
    config: WeightConfig,
}

impl WeightCalculator {
    pub fn new(config: WeightConfig) -> Self {
        Self { config }
    }

    /// Compute the weight set for one blending cycle.
    ///
    /// Never fails: a non-positive raw mass is recovered internally via the
    /// equal-weight fallback (logged, not surfaced). An empty candidate list
    /// yields an empty map.
    pub fn compute_weights(
        &self,
        regime: &RegimeState,
        candidates: &[String],
        tracker: &TrackerSnapshot,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, AgentWeight> {
        // Sorted, deduplicated cohort for deterministic iteration
        let cohort: Vec<String> = candidates
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let n = cohort.len();
        if n == 0 {
            return BTreeMap::new();
        }

        // Split cohort into scored agents and cold-start agents
        let mut records: BTreeMap<String, PerformanceRecord> = BTreeMap::new();
        let mut cold: Vec<String> = Vec::new();
        for agent_id in &cohort {
            match tracker.performance(agent_id, now) {
                Ok(record) => {
                    records.insert(agent_id.clone(), record);
                }
                Err(MetablendError::InsufficientHistory { samples, required, .. }) => {
                    debug!(
                        agent_id = %agent_id,
                        samples,
                        required,
                        "cold-start agent, assigning 1/N prior"
                    );
                    cold.push(agent_id.clone());
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "performance read failed, treating as cold start");
                    cold.push(agent_id.clone());
                }
            }
        }

        let perf_scores = normalize_performance(&records);
        let cohort_regime_avg = self.cohort_regime_average(&records, regime, tracker, now);

        // Raw combined score per scored agent
        let mut components: BTreeMap<String, (f64, f64, f64, f64)> = BTreeMap::new();
        let mut raw: BTreeMap<String, f64> = BTreeMap::new();
        for (agent_id, _record) in &records {
            let performance_score = perf_scores[agent_id];
            let regime_score = tracker
                .regime_accuracy(agent_id, regime.regime_type, now)
                .unwrap_or(cohort_regime_avg);
            let recency_score = self.recency_score(tracker, agent_id, now);
            let volatility_adjustment =
                self.volatility_adjustment(tracker, agent_id, regime, regime_score);

            let combined = (self.config.performance * performance_score
                + self.config.regime * regime_score
                + self.config.recency * recency_score)
                * volatility_adjustment;

            components.insert(
                agent_id.clone(),
                (performance_score, regime_score, recency_score, volatility_adjustment),
            );
            raw.insert(agent_id.clone(), combined.max(0.0));
        }

        let prior = 1.0 / n as f64;
        let raw_sum: f64 = raw.values().sum();
        let scored_mass = 1.0 - prior * cold.len() as f64;

        let mut out = BTreeMap::new();

        if !records.is_empty() && raw_sum <= 0.0 {
            // Normalization failure: every raw score collapsed to zero.
            // Recovered here with equal weighting, never surfaced.
            warn!(
                regime = %regime.regime_type,
                cohort = n,
                "non-positive raw weight mass, falling back to equal weighting"
            );
            for agent_id in &cohort {
                out.insert(
                    agent_id.clone(),
                    AgentWeight {
                        agent_id: agent_id.clone(),
                        regime_type: regime.regime_type,
                        performance_score: 0.0,
                        regime_score: 0.0,
                        recency_score: 0.0,
                        volatility_adjustment: 1.0,
                        final_weight: prior,
                        calculation_method: CalculationMethod::EqualFallback,
                        computed_at: now,
                    },
                );
            }
            return out;
        }

        for agent_id in &cold {
            out.insert(
                agent_id.clone(),
                AgentWeight {
                    agent_id: agent_id.clone(),
                    regime_type: regime.regime_type,
                    performance_score: 0.0,
                    regime_score: cohort_regime_avg,
                    recency_score: 0.0,
                    volatility_adjustment: 1.0,
                    final_weight: prior,
                    calculation_method: CalculationMethod::ColdStartPrior,
                    computed_at: now,
                },
            );
        }

        for (agent_id, combined) in &raw {
            let (performance_score, regime_score, recency_score, volatility_adjustment) =
                components[agent_id];
            let final_weight = scored_mass * combined / raw_sum;
            out.insert(
                agent_id.clone(),
                AgentWeight {
                    agent_id: agent_id.clone(),
                    regime_type: regime.regime_type,
                    performance_score,
                    regime_score,
                    recency_score,
                    volatility_adjustment,
                    final_weight,
                    calculation_method: CalculationMethod::RegimeWeighted,
                    computed_at: now,
                },
            );
        }

        out
    }

    /// Decay on time since the agent's last evaluated outcome.
    fn recency_score(
        &self,
        tracker: &TrackerSnapshot,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> f64 {
        match tracker.last_outcome_at(agent_id) {
            Some(last) => {
                let age_hours = (now - last).num_seconds().max(0) as f64 / 3600.0;
                0.5_f64.powf(age_hours / self.config.recency_half_life_hours)
            }
            None => 0.0,
        }
    }

    /// Down-weight agents whose vote variance spikes in high/extreme
    /// volatility, unless their history in this regime is strong.
    fn volatility_adjustment(
        &self,
        tracker: &TrackerSnapshot,
        agent_id: &str,
        regime: &RegimeState,
        regime_score: f64,
    ) -> f64 {
        if !regime.volatility_level.is_elevated() {
            return 1.0;
        }
        let variance = tracker.signal_variance(agent_id).unwrap_or(0.0);
        if variance > UNSTABLE_VARIANCE && regime_score < self.config.strong_regime_score {
            self.config.volatility_damping
        } else {
            1.0
        }
    }

    /// Cohort average regime accuracy; the default for agents with no
    /// history in the current regime. Falls back to the neutral 0.5 when
    /// nobody has regime history yet.
    fn cohort_regime_average(
        &self,
        records: &BTreeMap<String, PerformanceRecord>,
        regime: &RegimeState,
        tracker: &TrackerSnapshot,
        now: DateTime<Utc>,
    ) -> f64 {
        let scores: Vec<f64> = records
            .keys()
            .filter_map(|id| tracker.regime_accuracy(id, regime.regime_type, now))
            .collect();
        if scores.is_empty() {
            0.5
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }
}

/// Cohort min-max normalization of a per-record composite. A cohort of one,
/// or a cohort with identical composites, normalizes to the neutral 0.5.
fn normalize_performance(records: &BTreeMap<String, PerformanceRecord>) -> BTreeMap<String, f64> {
    let composites: BTreeMap<String, f64> = records
        .iter()
        .map(|(id, r)| (id.clone(), performance_composite(r)))
        .collect();

    let max = composites.values().cloned().fold(f64::MIN, f64::max);
    let min = composites.values().cloned().fold(f64::MAX, f64::min);

    composites
        .into_iter()
        .map(|(id, c)| {
            let normalized = if max > min { (c - min) / (max - min) } else { 0.5 };
            (id, normalized)
        })
        .collect()
}

/// Single-number summary of a performance record before cohort
/// normalization. Sharpe is squashed through a logistic so one hot streak
/// cannot dominate the bounded metrics.
fn performance_composite(record: &PerformanceRecord) -> f64 {
    let sharpe_squashed = 1.0 / (1.0 + (-record.sharpe).exp());
    0.4 * record.accuracy
        + 0.2 * record.win_rate
        + 0.2 * record.consistency_score
        + 0.2 * sharpe_squashed
}
