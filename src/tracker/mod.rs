//! Performance Tracker — rolling, decay-weighted metrics per agent.
//!
//! Ingests outcome feedback (predicted vs realized) and maintains an
//! append-only outcome log per agent, pruned to the evaluation window.
//! All metrics are computed with exponential time decay so recent outcomes
//! dominate. Reads for a blending cycle go through [`PerformanceTracker::snapshot`]
//! so concurrent writers never partially affect an in-progress computation.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::debug;

use crate::config::EvaluationConfig;
use crate::domain::{
    EvaluationWindow, Outcome, PerformanceRecord, RealizedDirection, RegimeType,
};
use crate::error::{MetablendError, Result};

/// Per-agent outcome history, pruned to the evaluation window.
#[derive(Debug, Clone, Default)]
struct AgentHistory {
    /// Chronologically ordered outcomes inside the window
    outcomes: VecDeque<Outcome>,
    /// Prediction ids already recorded (dedup guard)
    seen: HashSet<String>,
    last_outcome_at: Option<DateTime<Utc>>,
}

impl AgentHistory {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self
            .outcomes
            .front()
            .is_some_and(|front| front.timestamp < cutoff)
        {
            if let Some(dropped) = self.outcomes.pop_front() {
                self.seen.remove(&dropped.prediction_id);
            }
        }
    }
}

/// Tracks realized performance for every observed agent.
///
/// Cloning yields an immutable snapshot; the weight calculator and blender
/// only ever read from a snapshot taken at cycle start.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    config: EvaluationConfig,
    agents: BTreeMap<String, AgentHistory>,
}

/// Immutable view of the tracker taken at cycle start.
pub type TrackerSnapshot = PerformanceTracker;

impl PerformanceTracker {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            agents: BTreeMap::new(),
        }
    }

    /// Record a realized outcome for an agent's prediction.
    ///
    /// Idempotent per (agent, prediction_id): a replayed outcome is a silent
    /// no-op. Registers the agent as observed on first contact.
    pub fn record_outcome(&mut self, outcome: Outcome) {
        let history = self.agents.entry(outcome.agent_id.clone()).or_default();

        if history.seen.contains(&outcome.prediction_id) {
            debug!(
                agent_id = %outcome.agent_id,
                prediction_id = %outcome.prediction_id,
                "duplicate outcome ignored"
            );
            return;
        }

        let cutoff = outcome.timestamp - chrono::Duration::days(self.config.window_days);
        history.prune(cutoff);

        history.seen.insert(outcome.prediction_id.clone());
        history.last_outcome_at = Some(
            history
                .last_outcome_at
                .map_or(outcome.timestamp, |t| t.max(outcome.timestamp)),
        );

        // Keep the log chronologically ordered even if feedback arrives late
        let pos = history
            .outcomes
            .iter()
            .rposition(|o| o.timestamp <= outcome.timestamp)
            .map(|p| p + 1)
            .unwrap_or(0);
        history.outcomes.insert(pos, outcome);
    }

    /// Whether the tracker has ever observed this agent.
    pub fn is_known(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All observed agent ids, sorted.
    pub fn observed_agents(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// When the agent last had an outcome evaluated.
    pub fn last_outcome_at(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.agents.get(agent_id).and_then(|h| h.last_outcome_at)
    }

    /// Take an immutable snapshot for a blending/ranking cycle.
    pub fn snapshot(&self) -> TrackerSnapshot {
        self.clone()
    }

    /// Compute the decayed performance record for one agent.
    ///
    /// Returns `InsufficientHistory` when the agent has fewer outcomes than
    /// the configured minimum; callers treat this as a recoverable cold-start
    /// signal, not a failure.
    pub fn performance(&self, agent_id: &str, now: DateTime<Utc>) -> Result<PerformanceRecord> {
        let history = self.agents.get(agent_id);
        let outcomes: Vec<&Outcome> = history
            .map(|h| {
                let cutoff = now - chrono::Duration::days(self.config.window_days);
                h.outcomes.iter().filter(|o| o.timestamp >= cutoff).collect()
            })
            .unwrap_or_default();

        if outcomes.len() < self.config.min_samples {
            return Err(MetablendError::InsufficientHistory {
                agent_id: agent_id.to_string(),
                samples: outcomes.len(),
                required: self.config.min_samples,
            });
        }

        let weights: Vec<f64> = outcomes
            .iter()
            .map(|o| self.decay_weight(o.timestamp, now))
            .collect();
        let total_weight: f64 = weights.iter().sum();
        if total_weight <= 0.0 {
            return Err(MetablendError::InsufficientHistory {
                agent_id: agent_id.to_string(),
                samples: 0,
                required: self.config.min_samples,
            });
        }

        let mut correct = 0.0;
        let mut buy_predicted = 0.0;
        let mut buy_predicted_up = 0.0;
        let mut actual_up = 0.0;
        let mut wins = 0.0;
        let mut gross_win = 0.0;
        let mut gross_loss = 0.0;
        let mut ret_sum = 0.0;

        for (o, w) in outcomes.iter().zip(&weights) {
            if o.is_correct() {
                correct += w;
            }
            if o.predicted.is_buy_side() {
                buy_predicted += w;
                if o.actual == RealizedDirection::Up {
                    buy_predicted_up += w;
                }
            }
            if o.actual == RealizedDirection::Up {
                actual_up += w;
            }
            if o.realized_return > 0.0 {
                wins += w;
                gross_win += w * o.realized_return;
            } else {
                gross_loss += w * o.realized_return.abs();
            }
            ret_sum += w * o.realized_return;
        }

        let accuracy = correct / total_weight;
        let precision = if buy_predicted > 0.0 {
            buy_predicted_up / buy_predicted
        } else {
            0.0
        };
        let recall = if actual_up > 0.0 {
            buy_predicted_up / actual_up
        } else {
            0.0
        };
        let win_rate = wins / total_weight;
        let profit_factor = if gross_loss > 0.0 {
            (gross_win / gross_loss).min(MAX_PROFIT_FACTOR)
        } else if gross_win > 0.0 {
            MAX_PROFIT_FACTOR
        } else {
            0.0
        };

        let mean_ret = ret_sum / total_weight;
        let var: f64 = outcomes
            .iter()
            .zip(&weights)
            .map(|(o, w)| w * (o.realized_return - mean_ret).powi(2))
            .sum::<f64>()
            / total_weight;
        let std_ret = var.sqrt();

        let annualizer = self.config.periods_per_year.sqrt();
        let sharpe = if std_ret > 0.0 {
            mean_ret / std_ret * annualizer
        } else {
            0.0
        };

        let downside_var: f64 = outcomes
            .iter()
            .zip(&weights)
            .map(|(o, w)| w * o.realized_return.min(0.0).powi(2))
            .sum::<f64>()
            / total_weight;
        let downside_dev = downside_var.sqrt();
        let sortino = if downside_dev > 0.0 {
            mean_ret / downside_dev * annualizer
        } else {
            0.0
        };

        let max_drawdown = compute_max_drawdown(&outcomes);
        let consistency_score = 1.0 / (1.0 + std_ret * CONSISTENCY_SCALE);
        let regime_adaptability = self.regime_adaptability(&outcomes, &weights);

        let last_outcome_at = outcomes
            .iter()
            .map(|o| o.timestamp)
            .max()
            .unwrap_or(now);

        Ok(PerformanceRecord {
            agent_id: agent_id.to_string(),
            window: EvaluationWindow::days(self.config.window_days),
            accuracy,
            precision,
            recall,
            sharpe,
            sortino,
            max_drawdown,
            win_rate,
            profit_factor,
            consistency_score,
            regime_adaptability,
            sample_count: outcomes.len(),
            decayed_samples: total_weight,
            last_outcome_at,
            computed_at: now,
        })
    }

    /// Agent's decayed accuracy within one regime, if any outcome was tagged
    /// with it. Feeds the weight calculator's regime_score.
    pub fn regime_accuracy(
        &self,
        agent_id: &str,
        regime: RegimeType,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let history = self.agents.get(agent_id)?;
        let mut weight_sum = 0.0;
        let mut correct = 0.0;
        for o in history.outcomes.iter().filter(|o| o.regime == Some(regime)) {
            let w = self.decay_weight(o.timestamp, now);
            weight_sum += w;
            if o.is_correct() {
                correct += w;
            }
        }
        if weight_sum > 0.0 {
            Some(correct / weight_sum)
        } else {
            None
        }
    }

    /// Variance of the agent's directional votes inside the window.
    /// High variance in elevated volatility triggers down-weighting.
    pub fn signal_variance(&self, agent_id: &str) -> Option<f64> {
        let history = self.agents.get(agent_id)?;
        if history.outcomes.len() < 2 {
            return None;
        }
        let votes: Vec<f64> = history
            .outcomes
            .iter()
            .map(|o| o.predicted.directional_value())
            .collect();
        let mean = votes.iter().sum::<f64>() / votes.len() as f64;
        let var = votes.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / votes.len() as f64;
        Some(var)
    }

    fn decay_weight(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_hours = (now - at).num_seconds().max(0) as f64 / 3600.0;
        0.5_f64.powf(age_hours / self.config.decay_half_life_hours)
    }

    /// 1 minus the spread of per-regime accuracy. An agent that holds skill
    /// across regimes scores high; one that only works in one regime scores
    /// low. Fewer than two observed regimes gives the neutral 0.5.
    fn regime_adaptability(&self, outcomes: &[&Outcome], weights: &[f64]) -> f64 {
        let mut per_regime: BTreeMap<RegimeType, (f64, f64)> = BTreeMap::new();
        for (o, w) in outcomes.iter().zip(weights) {
            if let Some(regime) = o.regime {
                let entry = per_regime.entry(regime).or_insert((0.0, 0.0));
                entry.1 += w;
                if o.is_correct() {
                    entry.0 += w;
                }
            }
        }
        let accuracies: Vec<f64> = per_regime
            .values()
            .filter(|(_, total)| *total > 0.0)
            .map(|(correct, total)| correct / total)
            .collect();
        if accuracies.len() < 2 {
            return 0.5;
        }
        let max = accuracies.iter().cloned().fold(f64::MIN, f64::max);
        let min = accuracies.iter().cloned().fold(f64::MAX, f64::min);
        (1.0 - (max - min)).clamp(0.0, 1.0)
    }
}

const MAX_PROFIT_FACTOR: f64 = 10.0;
const CONSISTENCY_SCALE: f64 = 10.0;

/// Worst peak-to-trough loss on the compounded return path, [0, 1].
fn compute_max_drawdown(outcomes: &[&Outcome]) -> f64 {
    let mut equity = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut max_dd = 0.0_f64;
    for o in outcomes {
        equity *= 1.0 + o.realized_return;
        equity = equity.max(0.0);
        peak = peak.max(equity);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak);
        }
    }
    max_dd.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SignalType;
    use chrono::Duration;

    fn tracker() -> PerformanceTracker {
        PerformanceTracker::new(EvaluationConfig {
            window_days: 7,
            decay_half_life_hours: 48.0,
            min_samples: 3,
            periods_per_year: 252.0,
        })
    }

    fn outcome(
        agent: &str,
        pid: &str,
        predicted: SignalType,
        actual: RealizedDirection,
        ret: f64,
        ts: DateTime<Utc>,
    ) -> Outcome {
        Outcome {
            agent_id: agent.to_string(),
            prediction_id: pid.to_string(),
            symbol: "BTC".to_string(),
            predicted,
            actual,
            realized_return: ret,
            confidence: 0.7,
            regime: None,
            timestamp: ts,
        }
    }

    #[test]
    fn test_insufficient_history_below_min_samples() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_outcome(outcome(
            "a",
            "p1",
            SignalType::Buy,
            RealizedDirection::Up,
            0.01,
            now,
        ));

        let err = t.performance("a", now).unwrap_err();
        assert!(matches!(
            err,
            MetablendError::InsufficientHistory { samples: 1, required: 3, .. }
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unknown_agent_is_cold_start() {
        let t = tracker();
        let err = t.performance("ghost", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            MetablendError::InsufficientHistory { samples: 0, .. }
        ));
    }

    #[test]
    fn test_duplicate_outcome_is_noop() {
        let mut t = tracker();
        let now = Utc::now();
        let o = outcome("a", "p1", SignalType::Buy, RealizedDirection::Up, 0.01, now);
        t.record_outcome(o.clone());
        t.record_outcome(o);
        assert_eq!(t.agents["a"].outcomes.len(), 1);
    }

    #[test]
    fn test_accuracy_and_win_rate() {
        let mut t = tracker();
        let now = Utc::now();
        // 3 correct winners, 1 wrong loser, all recent so decay is ~uniform
        for (i, (pred, actual, ret)) in [
            (SignalType::Buy, RealizedDirection::Up, 0.02),
            (SignalType::Sell, RealizedDirection::Down, 0.01),
            (SignalType::StrongBuy, RealizedDirection::Up, 0.03),
            (SignalType::Buy, RealizedDirection::Down, -0.02),
        ]
        .into_iter()
        .enumerate()
        {
            t.record_outcome(outcome(
                "a",
                &format!("p{i}"),
                pred,
                actual,
                ret,
                now - Duration::minutes(4 - i as i64),
            ));
        }

        let record = t.performance("a", now).unwrap();
        assert!((record.accuracy - 0.75).abs() < 0.01);
        assert!((record.win_rate - 0.75).abs() < 0.01);
        assert_eq!(record.sample_count, 4);
        assert!(record.accuracy >= 0.0 && record.accuracy <= 1.0);
        assert!(record.max_drawdown >= 0.0 && record.max_drawdown <= 1.0);
        assert!(record.consistency_score >= 0.0 && record.consistency_score <= 1.0);
    }

    #[test]
    fn test_decay_favors_recent_outcomes() {
        let mut t = tracker();
        let now = Utc::now();
        // Old outcomes all wrong, recent all right; decayed accuracy should
        // land well above the raw 0.5
        for i in 0..3 {
            t.record_outcome(outcome(
                "a",
                &format!("old{i}"),
                SignalType::Buy,
                RealizedDirection::Down,
                -0.01,
                now - Duration::days(6),
            ));
        }
        for i in 0..3 {
            t.record_outcome(outcome(
                "a",
                &format!("new{i}"),
                SignalType::Buy,
                RealizedDirection::Up,
                0.01,
                now - Duration::hours(1),
            ));
        }

        let record = t.performance("a", now).unwrap();
        assert!(record.accuracy > 0.6, "accuracy = {}", record.accuracy);
    }

    #[test]
    fn test_window_pruning() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_outcome(outcome(
            "a",
            "stale",
            SignalType::Buy,
            RealizedDirection::Up,
            0.01,
            now - Duration::days(30),
        ));
        // A fresh outcome prunes everything older than the window
        t.record_outcome(outcome(
            "a",
            "fresh",
            SignalType::Buy,
            RealizedDirection::Up,
            0.01,
            now,
        ));
        assert_eq!(t.agents["a"].outcomes.len(), 1);
        assert_eq!(t.agents["a"].outcomes[0].prediction_id, "fresh");
    }

    #[test]
    fn test_regime_accuracy() {
        let mut t = tracker();
        let now = Utc::now();
        for (i, (regime, actual)) in [
            (RegimeType::Bull, RealizedDirection::Up),
            (RegimeType::Bull, RealizedDirection::Up),
            (RegimeType::Volatile, RealizedDirection::Down),
        ]
        .into_iter()
        .enumerate()
        {
            let mut o = outcome(
                "a",
                &format!("p{i}"),
                SignalType::Buy,
                actual,
                0.01,
                now - Duration::minutes(i as i64),
            );
            o.regime = Some(regime);
            t.record_outcome(o);
        }

        let bull = t.regime_accuracy("a", RegimeType::Bull, now).unwrap();
        assert!((bull - 1.0).abs() < 1e-9);
        let volatile = t.regime_accuracy("a", RegimeType::Volatile, now).unwrap();
        assert!(volatile.abs() < 1e-9);
        assert!(t.regime_accuracy("a", RegimeType::Bear, now).is_none());
    }

    #[test]
    fn test_max_drawdown_path() {
        let mut t = tracker();
        let now = Utc::now();
        // +10%, -20%, +5%: peak 1.10, trough 0.88 => dd = 0.2
        for (i, ret) in [0.10, -0.20, 0.05].into_iter().enumerate() {
            t.record_outcome(outcome(
                "a",
                &format!("p{i}"),
                SignalType::Buy,
                if ret > 0.0 {
                    RealizedDirection::Up
                } else {
                    RealizedDirection::Down
                },
                ret,
                now - Duration::minutes(10 - i as i64),
            ));
        }
        let record = t.performance("a", now).unwrap();
        assert!((record.max_drawdown - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_isolated_from_writes() {
        let mut t = tracker();
        let now = Utc::now();
        for i in 0..3 {
            t.record_outcome(outcome(
                "a",
                &format!("p{i}"),
                SignalType::Buy,
                RealizedDirection::Up,
                0.01,
                now - Duration::minutes(i),
            ));
        }
        let snap = t.snapshot();
        // Writes after the snapshot do not leak into it
        t.record_outcome(outcome(
            "a",
            "late",
            SignalType::Sell,
            RealizedDirection::Down,
            0.01,
            now,
        ));
        assert_eq!(snap.agents["a"].outcomes.len(), 3);
        assert_eq!(t.agents["a"].outcomes.len(), 4);
    }
}
