//! In-memory store for tests and dry-run mode. Mirrors the Postgres store's
//! uniqueness semantics exactly, including duplicate rejection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    AgentWeight, EnsembleSignal, RankingEntry, RegimeState, RegimeType, RotationDecision,
};
use crate::error::{MetablendError, Result};

use super::{Store, UpsertOutcome};

#[derive(Default)]
struct Inner {
    /// (period, regime) -> weight set
    weights: BTreeMap<(String, RegimeType), Vec<AgentWeight>>,
    /// (symbol, period) -> ensemble, plus per-symbol latest ordering
    ensembles: BTreeMap<(String, String), EnsembleSignal>,
    /// period -> snapshot, in insertion order
    rankings: Vec<(String, Vec<RankingEntry>)>,
    decisions: Vec<RotationDecision>,
    regime_history: Vec<(String, RegimeState)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regime audit rows recorded (test helper).
    pub async fn regime_history_len(&self) -> usize {
        self.inner.read().await.regime_history.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_weights(
        &self,
        period: &str,
        weights: &[AgentWeight],
    ) -> Result<UpsertOutcome> {
        let Some(first) = weights.first() else {
            return Ok(UpsertOutcome::Inserted);
        };
        let key = (period.to_string(), first.regime_type);
        let mut inner = self.inner.write().await;
        if inner.weights.contains_key(&key) {
            return Ok(UpsertOutcome::Duplicate);
        }
        inner.weights.insert(key, weights.to_vec());
        Ok(UpsertOutcome::Inserted)
    }

    async fn upsert_ensemble(&self, signal: &EnsembleSignal) -> Result<UpsertOutcome> {
        let key = (signal.symbol.clone(), signal.period.clone());
        let mut inner = self.inner.write().await;
        if inner.ensembles.contains_key(&key) {
            return Ok(UpsertOutcome::Duplicate);
        }
        inner.ensembles.insert(key, signal.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn upsert_ranking(&self, entries: &[RankingEntry]) -> Result<UpsertOutcome> {
        let Some(first) = entries.first() else {
            return Ok(UpsertOutcome::Inserted);
        };
        let mut inner = self.inner.write().await;
        if inner.rankings.iter().any(|(p, _)| p == &first.period) {
            return Ok(UpsertOutcome::Duplicate);
        }
        inner
            .rankings
            .push((first.period.clone(), entries.to_vec()));
        Ok(UpsertOutcome::Inserted)
    }

    async fn insert_decisions(&self, decisions: &[RotationDecision]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.decisions.extend_from_slice(decisions);
        Ok(())
    }

    async fn mark_decision_applied(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let decision = inner
            .decisions
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| {
                MetablendError::Configuration(format!("unknown rotation decision: {id}"))
            })?;
        decision.status = crate::domain::DecisionStatus::Applied;
        decision.applied_at = Some(at);
        Ok(())
    }

    async fn append_regime(&self, symbol: &str, state: &RegimeState) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .regime_history
            .push((symbol.to_string(), state.clone()));
        Ok(())
    }

    async fn latest_ensemble(&self, symbol: &str) -> Result<Option<EnsembleSignal>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ensembles
            .values()
            .filter(|e| e.symbol == symbol)
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn current_weights(&self, regime: RegimeType) -> Result<Vec<AgentWeight>> {
        let inner = self.inner.read().await;
        Ok(inner
            .weights
            .iter()
            .filter(|((_, r), _)| *r == regime)
            .max_by_key(|(_, set)| set.first().map(|w| w.computed_at))
            .map(|(_, set)| set.clone())
            .unwrap_or_default())
    }

    async fn ranking_for_period(&self, period: &str) -> Result<Vec<RankingEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rankings
            .iter()
            .find(|(p, _)| p == period)
            .map(|(_, entries)| entries.clone())
            .unwrap_or_default())
    }

    async fn latest_ranking(&self) -> Result<Option<(String, Vec<RankingEntry>)>> {
        let inner = self.inner.read().await;
        Ok(inner.rankings.last().cloned())
    }

    async fn pending_decisions(&self) -> Result<Vec<RotationDecision>> {
        let inner = self.inner.read().await;
        Ok(inner
            .decisions
            .iter()
            .filter(|d| !d.is_applied())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CalculationMethod, DecisionStatus, DecisionType, OperationalTier, PerformanceTier,
        SignalType,
    };

    fn ensemble(symbol: &str, period: &str) -> EnsembleSignal {
        EnsembleSignal {
            symbol: symbol.to_string(),
            signal_type: SignalType::Buy,
            confidence: 0.7,
            blended_score: 0.5,
            contributing_agents: vec!["a".to_string()],
            agent_weights: [("a".to_string(), 1.0)].into_iter().collect(),
            reasoning: "test".to_string(),
            regime: RegimeType::Bull,
            period: period.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_ensemble_rejected() {
        let store = MemoryStore::new();
        let signal = ensemble("BTC", "p1");
        assert_eq!(
            store.upsert_ensemble(&signal).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_ensemble(&signal).await.unwrap(),
            UpsertOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_latest_ensemble_per_symbol() {
        let store = MemoryStore::new();
        let mut early = ensemble("BTC", "p1");
        early.created_at = Utc::now() - chrono::Duration::hours(1);
        store.upsert_ensemble(&early).await.unwrap();
        let late = ensemble("BTC", "p2");
        store.upsert_ensemble(&late).await.unwrap();
        store.upsert_ensemble(&ensemble("ETH", "p2")).await.unwrap();

        let latest = store.latest_ensemble("BTC").await.unwrap().unwrap();
        assert_eq!(latest.period, "p2");
        // Absence is an empty result, not an error
        assert!(store.latest_ensemble("DOGE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_ranking_period_rejected() {
        let store = MemoryStore::new();
        let entries = vec![RankingEntry {
            period: "p1".to_string(),
            agent_id: "a".to_string(),
            rank: 1,
            score: 0.9,
            score_change: 0.0,
            rank_change: 0,
            has_previous: false,
            performance_tier: PerformanceTier::Top,
            is_active: true,
        }];
        assert_eq!(
            store.upsert_ranking(&entries).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_ranking(&entries).await.unwrap(),
            UpsertOutcome::Duplicate
        );
        assert_eq!(store.ranking_for_period("p1").await.unwrap().len(), 1);
        assert!(store.ranking_for_period("p9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_decisions_and_apply() {
        let store = MemoryStore::new();
        let decision = RotationDecision {
            id: Uuid::new_v4(),
            period: "p1".to_string(),
            agent_id: "a".to_string(),
            decision_type: DecisionType::Demote,
            previous_tier: OperationalTier::Active,
            new_tier: OperationalTier::Probation,
            reason: "3 bad periods".to_string(),
            metrics_snapshot: None,
            status: DecisionStatus::Proposed,
            created_at: Utc::now(),
            applied_at: None,
        };
        store.insert_decisions(&[decision.clone()]).await.unwrap();
        assert_eq!(store.pending_decisions().await.unwrap().len(), 1);

        store
            .mark_decision_applied(decision.id, Utc::now())
            .await
            .unwrap();
        assert!(store.pending_decisions().await.unwrap().is_empty());

        let err = store
            .mark_decision_applied(Uuid::new_v4(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, MetablendError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_current_weights_latest_set_wins() {
        let store = MemoryStore::new();
        let weight = |at: DateTime<Utc>| AgentWeight {
            agent_id: "a".to_string(),
            regime_type: RegimeType::Bull,
            performance_score: 0.5,
            regime_score: 0.5,
            recency_score: 0.5,
            volatility_adjustment: 1.0,
            final_weight: 1.0,
            calculation_method: CalculationMethod::RegimeWeighted,
            computed_at: at,
        };
        let early = Utc::now() - chrono::Duration::hours(1);
        let late = Utc::now();
        store.upsert_weights("p1", &[weight(early)]).await.unwrap();
        store.upsert_weights("p2", &[weight(late)]).await.unwrap();

        let current = store.current_weights(RegimeType::Bull).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].computed_at, late);
        assert!(store
            .current_weights(RegimeType::Bear)
            .await
            .unwrap()
            .is_empty());
    }
}
