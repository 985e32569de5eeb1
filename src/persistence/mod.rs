//! Persistence layer: append-mostly tables keyed by natural identity.
//!
//! One canonical row per (entity key, period) is enforced by uniqueness on
//! the identifying tuple; a losing concurrent writer gets `Duplicate` back
//! and discards its result, never blocks. The four read APIs return empty
//! results for absence, never an error.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    AgentWeight, EnsembleSignal, RankingEntry, RegimeState, RegimeType, RotationDecision,
};
use crate::error::Result;

/// Outcome of an idempotent upsert: either this writer created the canonical
/// row, or another writer for the same period got there first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Duplicate,
}

impl UpsertOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, UpsertOutcome::Duplicate)
    }
}

/// Durable store for everything the engine computes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a weight set for (period, regime). Duplicate computations for
    /// the same tuple are rejected, not overwritten.
    async fn upsert_weights(&self, period: &str, weights: &[AgentWeight])
        -> Result<UpsertOutcome>;

    /// Persist an ensemble signal, canonical per (symbol, period).
    async fn upsert_ensemble(&self, signal: &EnsembleSignal) -> Result<UpsertOutcome>;

    /// Persist a ranking snapshot, canonical per (period, agent).
    async fn upsert_ranking(&self, entries: &[RankingEntry]) -> Result<UpsertOutcome>;

    /// Append proposed rotation decisions.
    async fn insert_decisions(&self, decisions: &[RotationDecision]) -> Result<()>;

    /// Orchestrator confirmation: flip is_applied for one decision.
    /// Unknown decision ids are a configuration error.
    async fn mark_decision_applied(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Append a classified regime for audit. History is never read back by
    /// the engine itself.
    async fn append_regime(&self, symbol: &str, state: &RegimeState) -> Result<()>;

    // --- Read APIs exposed to collaborators ---

    /// Latest persisted ensemble signal for a symbol, if any.
    async fn latest_ensemble(&self, symbol: &str) -> Result<Option<EnsembleSignal>>;

    /// Most recent weight set computed for a regime; empty when none yet.
    async fn current_weights(&self, regime: RegimeType) -> Result<Vec<AgentWeight>>;

    /// Ranking snapshot for a specific period; empty when not yet computed.
    async fn ranking_for_period(&self, period: &str) -> Result<Vec<RankingEntry>>;

    /// The most recently persisted ranking snapshot, with its period id.
    async fn latest_ranking(&self) -> Result<Option<(String, Vec<RankingEntry>)>>;

    /// All proposed-but-unapplied rotation decisions.
    async fn pending_decisions(&self) -> Result<Vec<RotationDecision>>;
}
