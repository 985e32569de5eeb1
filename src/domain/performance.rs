use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::regime::RegimeType;
use super::signal::SignalType;

/// Realized market direction for an evaluated prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealizedDirection {
    Up,
    Down,
    Flat,
}

impl fmt::Display for RealizedDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RealizedDirection::Up => "up",
            RealizedDirection::Down => "down",
            RealizedDirection::Flat => "flat",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RealizedDirection {
    type Err = crate::error::MetablendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(RealizedDirection::Up),
            "down" => Ok(RealizedDirection::Down),
            "flat" => Ok(RealizedDirection::Flat),
            other => Err(crate::error::MetablendError::Configuration(format!(
                "unknown realized direction: {other}"
            ))),
        }
    }
}

/// Outcome feedback for a single prediction: what the agent called vs what
/// the market did. The (agent_id, prediction_id) pair is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub agent_id: String,
    pub prediction_id: String,
    pub symbol: String,
    pub predicted: SignalType,
    pub actual: RealizedDirection,
    /// Fractional return realized by following the prediction
    pub realized_return: f64,
    /// Confidence the agent attached to the prediction
    pub confidence: f64,
    /// Regime in effect when the prediction was made
    pub regime: Option<RegimeType>,
    pub timestamp: DateTime<Utc>,
}

impl Outcome {
    /// A hold call is correct on a flat market; directional calls must match
    /// the realized direction.
    pub fn is_correct(&self) -> bool {
        match self.actual {
            RealizedDirection::Up => self.predicted.is_buy_side(),
            RealizedDirection::Down => self.predicted.is_sell_side(),
            RealizedDirection::Flat => self.predicted == SignalType::Hold,
        }
    }
}

/// Evaluation window a performance record covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub days: i64,
}

impl EvaluationWindow {
    pub fn days(days: i64) -> Self {
        Self { days }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(self.days)
    }
}

impl fmt::Display for EvaluationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d", self.days)
    }
}

/// Rolling, decay-weighted performance metrics for one agent over one window.
///
/// Append-only time series: a newer window supersedes, never mutates, the
/// previous record. Owned exclusively by the performance tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub agent_id: String,
    pub window: EvaluationWindow,
    /// Decay-weighted share of correct calls, [0, 1]
    pub accuracy: f64,
    /// Buy-side precision, [0, 1]
    pub precision: f64,
    /// Buy-side recall, [0, 1]
    pub recall: f64,
    /// Annualized; can be negative
    pub sharpe: f64,
    /// Annualized, downside deviation denominator; can be negative
    pub sortino: f64,
    /// Worst peak-to-trough loss on the cumulative return path, [0, 1]
    pub max_drawdown: f64,
    /// Share of outcomes with positive realized return, [0, 1]
    pub win_rate: f64,
    /// Gross wins over gross losses, >= 0
    pub profit_factor: f64,
    /// Inverse return dispersion mapped to [0, 1]
    pub consistency_score: f64,
    /// How evenly skill holds across regimes, [0, 1]
    pub regime_adaptability: f64,
    /// Raw outcome count inside the window
    pub sample_count: usize,
    /// Decay-weighted effective sample mass
    pub decayed_samples: f64,
    pub last_outcome_at: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(predicted: SignalType, actual: RealizedDirection) -> Outcome {
        Outcome {
            agent_id: "a".to_string(),
            prediction_id: "p1".to_string(),
            symbol: "BTC".to_string(),
            predicted,
            actual,
            realized_return: 0.0,
            confidence: 0.5,
            regime: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_correctness_rules() {
        assert!(outcome(SignalType::Buy, RealizedDirection::Up).is_correct());
        assert!(outcome(SignalType::StrongBuy, RealizedDirection::Up).is_correct());
        assert!(outcome(SignalType::Sell, RealizedDirection::Down).is_correct());
        assert!(outcome(SignalType::Hold, RealizedDirection::Flat).is_correct());
        assert!(!outcome(SignalType::Buy, RealizedDirection::Down).is_correct());
        assert!(!outcome(SignalType::Hold, RealizedDirection::Up).is_correct());
        assert!(!outcome(SignalType::Sell, RealizedDirection::Flat).is_correct());
    }
}
