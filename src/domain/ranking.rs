use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::performance::PerformanceRecord;
use crate::error::MetablendError;

/// Standing band assigned from the composite-score percentile within a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    Top,
    AboveAverage,
    Standard,
    BelowAverage,
    Bottom,
}

impl PerformanceTier {
    /// Percentile bands: top >= 90, above_average >= 70, standard >= 30,
    /// below_average >= 10, bottom otherwise.
    pub fn from_percentile(pct: f64) -> Self {
        if pct >= 90.0 {
            PerformanceTier::Top
        } else if pct >= 70.0 {
            PerformanceTier::AboveAverage
        } else if pct >= 30.0 {
            PerformanceTier::Standard
        } else if pct >= 10.0 {
            PerformanceTier::BelowAverage
        } else {
            PerformanceTier::Bottom
        }
    }

    /// Tiers that count against an agent in the rotation hysteresis.
    pub fn is_sub_threshold(&self) -> bool {
        matches!(self, PerformanceTier::BelowAverage | PerformanceTier::Bottom)
    }

    /// Standard or better counts toward promotion/reactivation.
    pub fn is_at_least_standard(&self) -> bool {
        matches!(
            self,
            PerformanceTier::Top | PerformanceTier::AboveAverage | PerformanceTier::Standard
        )
    }
}

impl fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PerformanceTier::Top => "top",
            PerformanceTier::AboveAverage => "above_average",
            PerformanceTier::Standard => "standard",
            PerformanceTier::BelowAverage => "below_average",
            PerformanceTier::Bottom => "bottom",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PerformanceTier {
    type Err = MetablendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top" => Ok(PerformanceTier::Top),
            "above_average" => Ok(PerformanceTier::AboveAverage),
            "standard" => Ok(PerformanceTier::Standard),
            "below_average" => Ok(PerformanceTier::BelowAverage),
            "bottom" => Ok(PerformanceTier::Bottom),
            other => Err(MetablendError::Configuration(format!(
                "unknown performance tier: {other}"
            ))),
        }
    }
}

/// One row of a leaderboard snapshot. Append-only, owned by the ranking
/// engine; rank is a permutation of 1..N within the period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub period: String,
    pub agent_id: String,
    pub rank: u32,
    pub score: f64,
    pub score_change: f64,
    /// Positive = moved up the board
    pub rank_change: i32,
    /// False when no preceding period existed; changes are then zero
    pub has_previous: bool,
    pub performance_tier: PerformanceTier,
    pub is_active: bool,
}

/// Operational standing of an agent in the rotation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalTier {
    Active,
    Probation,
    Suspended,
}

impl fmt::Display for OperationalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationalTier::Active => "active",
            OperationalTier::Probation => "probation",
            OperationalTier::Suspended => "suspended",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OperationalTier {
    type Err = MetablendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(OperationalTier::Active),
            "probation" => Ok(OperationalTier::Probation),
            "suspended" => Ok(OperationalTier::Suspended),
            other => Err(MetablendError::Configuration(format!(
                "unknown operational tier: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Promote,
    Demote,
    Maintain,
    Suspend,
    Reactivate,
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionType::Promote => "promote",
            DecisionType::Demote => "demote",
            DecisionType::Maintain => "maintain",
            DecisionType::Suspend => "suspend",
            DecisionType::Reactivate => "reactivate",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DecisionType {
    type Err = MetablendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "promote" => Ok(DecisionType::Promote),
            "demote" => Ok(DecisionType::Demote),
            "maintain" => Ok(DecisionType::Maintain),
            "suspend" => Ok(DecisionType::Suspend),
            "reactivate" => Ok(DecisionType::Reactivate),
            other => Err(MetablendError::Configuration(format!(
                "unknown decision type: {other}"
            ))),
        }
    }
}

/// Two-phase lifecycle of a rotation decision: the engine proposes, an
/// external orchestrator confirms. The engine never self-applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Proposed,
    Applied,
}

/// A proposed (or confirmed) tier transition for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationDecision {
    pub id: Uuid,
    pub period: String,
    pub agent_id: String,
    pub decision_type: DecisionType,
    pub previous_tier: OperationalTier,
    pub new_tier: OperationalTier,
    pub reason: String,
    /// Metrics in effect when the decision was proposed, for audit
    pub metrics_snapshot: Option<PerformanceRecord>,
    pub status: DecisionStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl RotationDecision {
    pub fn is_applied(&self) -> bool {
        self.status == DecisionStatus::Applied
    }

    pub fn is_tier_change(&self) -> bool {
        self.decision_type != DecisionType::Maintain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_bands() {
        assert_eq!(PerformanceTier::from_percentile(95.0), PerformanceTier::Top);
        assert_eq!(PerformanceTier::from_percentile(90.0), PerformanceTier::Top);
        assert_eq!(
            PerformanceTier::from_percentile(75.0),
            PerformanceTier::AboveAverage
        );
        assert_eq!(
            PerformanceTier::from_percentile(50.0),
            PerformanceTier::Standard
        );
        assert_eq!(
            PerformanceTier::from_percentile(15.0),
            PerformanceTier::BelowAverage
        );
        assert_eq!(
            PerformanceTier::from_percentile(5.0),
            PerformanceTier::Bottom
        );
    }

    #[test]
    fn test_sub_threshold_bands() {
        assert!(PerformanceTier::Bottom.is_sub_threshold());
        assert!(PerformanceTier::BelowAverage.is_sub_threshold());
        assert!(!PerformanceTier::Standard.is_sub_threshold());
        assert!(PerformanceTier::Standard.is_at_least_standard());
        assert!(!PerformanceTier::Bottom.is_at_least_standard());
    }
}
