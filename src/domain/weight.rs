use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::regime::RegimeType;
use crate::error::MetablendError;

/// How an agent's final weight was produced. Closed set; a malformed value
/// read back from storage is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationMethod {
    /// Convex combination of performance, regime fit, and recency
    RegimeWeighted,
    /// Cold-start agent pinned to the 1/N prior
    ColdStartPrior,
    /// Equal-weight fallback after a failed normalization
    EqualFallback,
}

impl fmt::Display for CalculationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalculationMethod::RegimeWeighted => "regime_weighted",
            CalculationMethod::ColdStartPrior => "cold_start_prior",
            CalculationMethod::EqualFallback => "equal_fallback",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CalculationMethod {
    type Err = MetablendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regime_weighted" => Ok(CalculationMethod::RegimeWeighted),
            "cold_start_prior" => Ok(CalculationMethod::ColdStartPrior),
            "equal_fallback" => Ok(CalculationMethod::EqualFallback),
            other => Err(MetablendError::Configuration(format!(
                "malformed calculation_method: {other}"
            ))),
        }
    }
}

/// One agent's weight for one computation cycle. Never mutated after
/// creation; versioned by `computed_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentWeight {
    pub agent_id: String,
    pub regime_type: RegimeType,
    /// Cohort-normalized composite of the agent's performance record, [0, 1]
    pub performance_score: f64,
    /// Agent's historical accuracy within the current regime, [0, 1]
    pub regime_score: f64,
    /// Decay on time since the agent's last evaluated outcome, [0, 1]
    pub recency_score: f64,
    /// Multiplier (<= 1) applied in elevated volatility
    pub volatility_adjustment: f64,
    /// Normalized share, [0, 1]; sums to 1 across the cohort
    pub final_weight: f64,
    pub calculation_method: CalculationMethod,
    pub computed_at: DateTime<Utc>,
}
