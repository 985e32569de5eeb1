use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::regime::RegimeType;
use crate::error::MetablendError;

/// Directional signal emitted by an agent or the blender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    StrongSell,
    Sell,
    Hold,
    Buy,
    StrongBuy,
}

impl SignalType {
    /// Vote value used in blending: strong_sell=-2 .. strong_buy=+2
    pub fn directional_value(&self) -> f64 {
        match self {
            SignalType::StrongSell => -2.0,
            SignalType::Sell => -1.0,
            SignalType::Hold => 0.0,
            SignalType::Buy => 1.0,
            SignalType::StrongBuy => 2.0,
        }
    }

    /// Map a blended score back to a signal via the configured thresholds.
    /// The strong boundary is strict: a unanimous plain-buy board (score
    /// exactly at the extreme threshold) stays a regular buy.
    pub fn from_score(score: f64, threshold: f64, strong_threshold: f64) -> Self {
        if score > strong_threshold {
            SignalType::StrongBuy
        } else if score >= threshold {
            SignalType::Buy
        } else if score < -strong_threshold {
            SignalType::StrongSell
        } else if score <= -threshold {
            SignalType::Sell
        } else {
            SignalType::Hold
        }
    }

    pub fn is_buy_side(&self) -> bool {
        matches!(self, SignalType::Buy | SignalType::StrongBuy)
    }

    pub fn is_sell_side(&self) -> bool {
        matches!(self, SignalType::Sell | SignalType::StrongSell)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalType::StrongSell => "strong_sell",
            SignalType::Sell => "sell",
            SignalType::Hold => "hold",
            SignalType::Buy => "buy",
            SignalType::StrongBuy => "strong_buy",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SignalType {
    type Err = MetablendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strong_sell" => Ok(SignalType::StrongSell),
            "sell" => Ok(SignalType::Sell),
            "hold" => Ok(SignalType::Hold),
            "buy" => Ok(SignalType::Buy),
            "strong_buy" => Ok(SignalType::StrongBuy),
            other => Err(MetablendError::Configuration(format!(
                "unknown signal type: {other}"
            ))),
        }
    }
}

/// A single agent's prediction for a symbol. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSignal {
    pub agent_id: String,
    pub symbol: String,
    pub signal_type: SignalType,
    /// Agent's own confidence in the call, [0, 1]
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    /// Regime the agent believed it was operating in, if it tagged one
    pub regime_tag: Option<RegimeType>,
}

impl AgentSignal {
    pub fn new(
        agent_id: impl Into<String>,
        symbol: impl Into<String>,
        signal_type: SignalType,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            symbol: symbol.into(),
            signal_type,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp,
            regime_tag: None,
        }
    }
}

/// Blended output signal for one symbol and one period. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSignal {
    pub symbol: String,
    pub signal_type: SignalType,
    /// Agreement-adjusted confidence, [0, 1]
    pub confidence: f64,
    /// Weighted directional score, practically in [-2, 2]
    pub blended_score: f64,
    /// Agents that delivered a signal this cycle, sorted
    pub contributing_agents: Vec<String>,
    /// Weights actually used after renormalization over contributors
    pub agent_weights: BTreeMap<String, f64>,
    /// Human-readable summary naming the top contributors
    pub reasoning: String,
    pub regime: RegimeType,
    /// Period identifier of the blending cycle that produced this signal
    pub period: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directional_values() {
        assert_eq!(SignalType::StrongSell.directional_value(), -2.0);
        assert_eq!(SignalType::Sell.directional_value(), -1.0);
        assert_eq!(SignalType::Hold.directional_value(), 0.0);
        assert_eq!(SignalType::Buy.directional_value(), 1.0);
        assert_eq!(SignalType::StrongBuy.directional_value(), 2.0);
    }

    #[test]
    fn test_from_score_thresholds() {
        assert_eq!(SignalType::from_score(1.3, 0.25, 1.0), SignalType::StrongBuy);
        assert_eq!(SignalType::from_score(0.4, 0.25, 1.0), SignalType::Buy);
        assert_eq!(SignalType::from_score(0.1, 0.25, 1.0), SignalType::Hold);
        assert_eq!(SignalType::from_score(-0.1, 0.25, 1.0), SignalType::Hold);
        assert_eq!(SignalType::from_score(-0.3, 0.25, 1.0), SignalType::Sell);
        assert_eq!(
            SignalType::from_score(-1.1, 0.25, 1.0),
            SignalType::StrongSell
        );
    }

    #[test]
    fn test_strong_boundary_is_strict() {
        // A unanimous board of plain votes sits exactly on the extreme
        // threshold and must not escalate
        assert_eq!(SignalType::from_score(1.0, 0.25, 1.0), SignalType::Buy);
        assert_eq!(SignalType::from_score(-1.0, 0.25, 1.0), SignalType::Sell);
        assert_eq!(
            SignalType::from_score(1.0 + 1e-9, 0.25, 1.0),
            SignalType::StrongBuy
        );
        assert_eq!(
            SignalType::from_score(-(1.0 + 1e-9), 0.25, 1.0),
            SignalType::StrongSell
        );
    }

    #[test]
    fn test_roundtrip_str() {
        for s in ["strong_sell", "sell", "hold", "buy", "strong_buy"] {
            let parsed: SignalType = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("moon".parse::<SignalType>().is_err());
    }

    #[test]
    fn test_confidence_clamped() {
        let sig = AgentSignal::new("a", "BTC", SignalType::Buy, 1.7, Utc::now());
        assert_eq!(sig.confidence, 1.0);
    }
}
