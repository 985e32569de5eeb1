//! Core data model: signals, regimes, performance records, weights, rankings.
//!
//! Everything persisted by the engine passes through these types. Bounded
//! fields are clamped or validated at construction; enums are closed sets
//! with string round-trips for the database boundary.

pub mod performance;
pub mod ranking;
pub mod regime;
pub mod signal;
pub mod weight;

pub use performance::{EvaluationWindow, Outcome, PerformanceRecord, RealizedDirection};
pub use ranking::{
    DecisionStatus, DecisionType, OperationalTier, PerformanceTier, RankingEntry,
    RotationDecision,
};
pub use regime::{MarketSnapshot, RegimeState, RegimeType, TrendDirection, VolatilityLevel};
pub use signal::{AgentSignal, EnsembleSignal, SignalType};
pub use weight::{AgentWeight, CalculationMethod};
