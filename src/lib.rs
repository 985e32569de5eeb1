pub mod blender;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod providers;
pub mod ranking;
pub mod regime;
pub mod tracker;
pub mod weights;

pub use blender::SignalBlender;
pub use config::AppConfig;
pub use domain::{
    AgentSignal, AgentWeight, CalculationMethod, DecisionStatus, DecisionType, EnsembleSignal,
    MarketSnapshot, OperationalTier, Outcome, PerformanceRecord, PerformanceTier, RankingEntry,
    RealizedDirection, RegimeState, RegimeType, RotationDecision, SignalType, TrendDirection,
    VolatilityLevel,
};
pub use engine::{CycleContext, EvaluationEngine};
pub use error::{MetablendError, Result};
pub use persistence::{MemoryStore, PgStore, Store, UpsertOutcome};
pub use providers::{MarketDataProvider, PgMarketData, PgOutcomeFeed, PgSignalSource, SignalSource};
pub use ranking::{RankingEngine, RotationEngine};
pub use tracker::PerformanceTracker;
pub use weights::WeightCalculator;
