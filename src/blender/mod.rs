//! Signal Blender — combines per-agent signals into one ensemble signal.
//!
//! Missing agents are a normal condition: weights are renormalized over the
//! agents that actually delivered a signal this cycle. The blend is a pure,
//! idempotent function of its inputs.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::BlendConfig;
use crate::domain::{AgentSignal, AgentWeight, EnsembleSignal, RegimeState, SignalType};
use crate::error::{MetablendError, Result};

pub struct SignalBlender {
    config: BlendConfig,
}

impl SignalBlender {
    pub fn new(config: BlendConfig) -> Self {
        Self { config }
    }

    /// Blend the signals available this cycle under the given weight set.
    ///
    /// Returns `DataUnavailable` when no weighted agent delivered a signal;
    /// the caller degrades to the last persisted ensemble rather than
    /// emitting an empty one.
    pub fn blend(
        &self,
        symbol: &str,
        signals: &[AgentSignal],
        weights: &BTreeMap<String, AgentWeight>,
        regime: &RegimeState,
        period: &str,
        now: DateTime<Utc>,
    ) -> Result<EnsembleSignal> {
        // One signal per agent: the latest wins, and only weighted agents count
        let mut by_agent: BTreeMap<&str, &AgentSignal> = BTreeMap::new();
        for signal in signals.iter().filter(|s| s.symbol == symbol) {
            if !weights.contains_key(&signal.agent_id) {
                debug!(agent_id = %signal.agent_id, "signal from unweighted agent ignored");
                continue;
            }
            by_agent
                .entry(&signal.agent_id)
                .and_modify(|existing| {
                    if signal.timestamp > existing.timestamp {
                        *existing = signal;
                    }
                })
                .or_insert(signal);
        }

        if by_agent.is_empty() {
            return Err(MetablendError::DataUnavailable(format!(
                "no weighted agent delivered a signal for {symbol}"
            )));
        }

        // Renormalize over the contributors (missing-data tolerance)
        let present_mass: f64 = by_agent
            .keys()
            .map(|id| weights[*id].final_weight)
            .sum();
        if present_mass <= 0.0 {
            return Err(MetablendError::DataUnavailable(format!(
                "contributing agents carry zero weight for {symbol}"
            )));
        }

        let used_weights: BTreeMap<String, f64> = by_agent
            .keys()
            .map(|id| (id.to_string(), weights[*id].final_weight / present_mass))
            .collect();

        let blended_score: f64 = by_agent
            .iter()
            .map(|(id, s)| used_weights[*id] * s.signal_type.directional_value())
            .sum();

        let signal_type = SignalType::from_score(
            blended_score,
            self.config.signal_threshold,
            self.config.strong_threshold,
        );

        let agreement = self.agreement(&by_agent, &used_weights, blended_score);
        let weighted_confidence: f64 = by_agent
            .iter()
            .map(|(id, s)| used_weights[*id] * s.confidence)
            .sum();
        let confidence = (weighted_confidence * agreement).clamp(0.0, 1.0);

        let reasoning = self.reasoning(&by_agent, &used_weights, signal_type, blended_score);
        let contributing_agents: Vec<String> =
            by_agent.keys().map(|id| id.to_string()).collect();

        Ok(EnsembleSignal {
            symbol: symbol.to_string(),
            signal_type,
            confidence,
            blended_score,
            contributing_agents,
            agent_weights: used_weights,
            reasoning,
            regime: regime.regime_type,
            period: period.to_string(),
            created_at: now,
        })
    }

    /// Inverse weighted dispersion of the directional votes, [0, 1].
    /// Unanimous contributors score 1; a split board drags confidence down
    /// even when the blended score itself is large.
    fn agreement(
        &self,
        by_agent: &BTreeMap<&str, &AgentSignal>,
        used_weights: &BTreeMap<String, f64>,
        blended_score: f64,
    ) -> f64 {
        // Max possible spread: strong_sell (-2) to strong_buy (+2)
        const MAX_SPREAD: f64 = 4.0;
        let dispersion: f64 = by_agent
            .iter()
            .map(|(id, s)| {
                used_weights[*id] * (s.signal_type.directional_value() - blended_score).abs()
            })
            .sum();
        (1.0 - dispersion / MAX_SPREAD).clamp(0.0, 1.0)
    }

    /// Short explanation naming the top-weighted contributors and their votes.
    fn reasoning(
        &self,
        by_agent: &BTreeMap<&str, &AgentSignal>,
        used_weights: &BTreeMap<String, f64>,
        signal_type: SignalType,
        blended_score: f64,
    ) -> String {
        let mut ranked: Vec<(&str, f64)> = used_weights
            .iter()
            .map(|(id, w)| (id.as_str(), *w))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        let top: Vec<String> = ranked
            .iter()
            .take(self.config.reasoning_top_n)
            .map(|(id, w)| {
                let signal = by_agent[id];
                format!(
                    "{id} (w={w:.2}, {}@{:.2})",
                    signal.signal_type, signal.confidence
                )
            })
            .collect();

        format!(
            "{signal_type} at score {blended_score:.3} from {} agents; top contributors: {}",
            by_agent.len(),
            top.join(", ")
        )
    }
}
