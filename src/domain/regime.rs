use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MetablendError;

/// Closed set of market regimes the engine tracks.
///
/// Free-text regime strings are rejected at the classifier boundary; anything
/// persisted passes through this enum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RegimeType {
    Bull,
    Bear,
    Neutral,
    Volatile,
    Trending,
}

impl RegimeType {
    pub const ALL: [RegimeType; 5] = [
        RegimeType::Bull,
        RegimeType::Bear,
        RegimeType::Neutral,
        RegimeType::Volatile,
        RegimeType::Trending,
    ];
}

impl fmt::Display for RegimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegimeType::Bull => "bull",
            RegimeType::Bear => "bear",
            RegimeType::Neutral => "neutral",
            RegimeType::Volatile => "volatile",
            RegimeType::Trending => "trending",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RegimeType {
    type Err = MetablendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bull" => Ok(RegimeType::Bull),
            "bear" => Ok(RegimeType::Bear),
            "neutral" => Ok(RegimeType::Neutral),
            "volatile" => Ok(RegimeType::Volatile),
            "trending" => Ok(RegimeType::Trending),
            other => Err(MetablendError::Configuration(format!(
                "unknown regime type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityLevel {
    Low,
    Medium,
    High,
    Extreme,
}

impl VolatilityLevel {
    /// High and extreme volatility trigger down-weighting of unstable agents.
    pub fn is_elevated(&self) -> bool {
        matches!(self, VolatilityLevel::High | VolatilityLevel::Extreme)
    }
}

impl fmt::Display for VolatilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolatilityLevel::Low => "low",
            VolatilityLevel::Medium => "medium",
            VolatilityLevel::High => "high",
            VolatilityLevel::Extreme => "extreme",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
    Mixed,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrendDirection::Bullish => "bullish",
            TrendDirection::Bearish => "bearish",
            TrendDirection::Neutral => "neutral",
            TrendDirection::Mixed => "mixed",
        };
        write!(f, "{s}")
    }
}

/// Classified market state. The latest instance is authoritative; history is
/// retained for audit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime_type: RegimeType,
    /// Distance from the nearest bucket boundary, [0, 1]
    pub confidence: f64,
    pub volatility_level: VolatilityLevel,
    pub trend_direction: TrendDirection,
    /// Absolute magnitude of the smoothed trend indicator
    pub trend_strength: f64,
    pub as_of: DateTime<Utc>,
}

/// Market-indicator snapshot consumed by the classifier.
///
/// Derived indicators come from the market data collaborator; the classifier
/// itself never fetches anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    /// Last close from the provider
    pub close: Decimal,
    /// Annualized realized volatility over the trailing baseline
    pub annualized_vol: f64,
    /// Smoothed fractional return over the trend window
    pub trend_return: f64,
    /// Recent volume relative to the trailing average
    pub volume_ratio: f64,
    pub as_of: DateTime<Utc>,
}
