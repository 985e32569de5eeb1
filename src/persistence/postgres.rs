//! Postgres-backed store.
//!
//! Runtime queries; uniqueness constraints on the natural keys make every
//! writer idempotent: `ON CONFLICT DO NOTHING` with the affected row count
//! telling the caller whether it won the write race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    AgentWeight, CalculationMethod, DecisionStatus, DecisionType, EnsembleSignal,
    OperationalTier, PerformanceTier, RankingEntry, RegimeState, RegimeType, RotationDecision,
    SignalType,
};
use crate::error::{MetablendError, Result};

use super::{Store, UpsertOutcome};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the engine's tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        use sqlx::Executor;
        self.pool
            .execute(
                r#"
            CREATE TABLE IF NOT EXISTS agent_weights (
                id BIGSERIAL PRIMARY KEY,
                period TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                regime_type TEXT NOT NULL,
                performance_score DOUBLE PRECISION NOT NULL,
                regime_score DOUBLE PRECISION NOT NULL,
                recency_score DOUBLE PRECISION NOT NULL,
                volatility_adjustment DOUBLE PRECISION NOT NULL,
                final_weight DOUBLE PRECISION NOT NULL,
                calculation_method TEXT NOT NULL,
                computed_at TIMESTAMPTZ NOT NULL,
                UNIQUE (period, regime_type, agent_id)
            );
            CREATE TABLE IF NOT EXISTS ensemble_signals (
                id BIGSERIAL PRIMARY KEY,
                symbol TEXT NOT NULL,
                period TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                blended_score DOUBLE PRECISION NOT NULL,
                contributing_agents JSONB NOT NULL,
                agent_weights JSONB NOT NULL,
                reasoning TEXT NOT NULL,
                regime TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (symbol, period)
            );
            CREATE TABLE IF NOT EXISTS agent_rankings (
                id BIGSERIAL PRIMARY KEY,
                period TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                rank INT NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                score_change DOUBLE PRECISION NOT NULL,
                rank_change INT NOT NULL,
                has_previous BOOLEAN NOT NULL,
                performance_tier TEXT NOT NULL,
                is_active BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (period, agent_id)
            );
            CREATE TABLE IF NOT EXISTS rotation_decisions (
                id UUID PRIMARY KEY,
                period TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                decision_type TEXT NOT NULL,
                previous_tier TEXT NOT NULL,
                new_tier TEXT NOT NULL,
                reason TEXT NOT NULL,
                metrics_snapshot JSONB,
                is_applied BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                applied_at TIMESTAMPTZ
            );
            CREATE TABLE IF NOT EXISTS regime_history (
                id BIGSERIAL PRIMARY KEY,
                symbol TEXT NOT NULL,
                regime_type TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                volatility_level TEXT NOT NULL,
                trend_direction TEXT NOT NULL,
                trend_strength DOUBLE PRECISION NOT NULL,
                as_of TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS market_snapshots (
                id BIGSERIAL PRIMARY KEY,
                symbol TEXT NOT NULL,
                close NUMERIC NOT NULL,
                annualized_vol DOUBLE PRECISION NOT NULL,
                trend_return DOUBLE PRECISION NOT NULL,
                volume_ratio DOUBLE PRECISION NOT NULL,
                as_of TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_market_snapshots_symbol_as_of
                ON market_snapshots (symbol, as_of DESC);
            CREATE TABLE IF NOT EXISTS agent_signals (
                id BIGSERIAL PRIMARY KEY,
                agent_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_signals_symbol_created
                ON agent_signals (symbol, created_at DESC);
            CREATE TABLE IF NOT EXISTS agent_outcomes (
                id BIGSERIAL PRIMARY KEY,
                agent_id TEXT NOT NULL,
                prediction_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                predicted TEXT NOT NULL,
                actual TEXT NOT NULL,
                realized_return DOUBLE PRECISION NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                regime TEXT,
                evaluated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (agent_id, prediction_id)
            );
            CREATE INDEX IF NOT EXISTS idx_agent_outcomes_evaluated
                ON agent_outcomes (evaluated_at DESC);
            "#,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_weights(
        &self,
        period: &str,
        weights: &[AgentWeight],
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for w in weights {
            let result = sqlx::query(
                r#"
                INSERT INTO agent_weights (
                    period, agent_id, regime_type, performance_score, regime_score,
                    recency_score, volatility_adjustment, final_weight,
                    calculation_method, computed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (period, regime_type, agent_id) DO NOTHING
                "#,
            )
            .bind(period)
            .bind(&w.agent_id)
            .bind(w.regime_type.to_string())
            .bind(w.performance_score)
            .bind(w.regime_score)
            .bind(w.recency_score)
            .bind(w.volatility_adjustment)
            .bind(w.final_weight)
            .bind(w.calculation_method.to_string())
            .bind(w.computed_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        if inserted == 0 && !weights.is_empty() {
            debug!(period, "weight set already persisted by another writer");
            Ok(UpsertOutcome::Duplicate)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn upsert_ensemble(&self, signal: &EnsembleSignal) -> Result<UpsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO ensemble_signals (
                symbol, period, signal_type, confidence, blended_score,
                contributing_agents, agent_weights, reasoning, regime, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (symbol, period) DO NOTHING
            "#,
        )
        .bind(&signal.symbol)
        .bind(&signal.period)
        .bind(signal.signal_type.to_string())
        .bind(signal.confidence)
        .bind(signal.blended_score)
        .bind(serde_json::to_value(&signal.contributing_agents)?)
        .bind(serde_json::to_value(&signal.agent_weights)?)
        .bind(&signal.reasoning)
        .bind(signal.regime.to_string())
        .bind(signal.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(symbol = %signal.symbol, period = %signal.period, "ensemble already persisted");
            Ok(UpsertOutcome::Duplicate)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn upsert_ranking(&self, entries: &[RankingEntry]) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for e in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO agent_rankings (
                    period, agent_id, rank, score, score_change, rank_change,
                    has_previous, performance_tier, is_active
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (period, agent_id) DO NOTHING
                "#,
            )
            .bind(&e.period)
            .bind(&e.agent_id)
            .bind(e.rank as i32)
            .bind(e.score)
            .bind(e.score_change)
            .bind(e.rank_change)
            .bind(e.has_previous)
            .bind(e.performance_tier.to_string())
            .bind(e.is_active)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        if inserted == 0 && !entries.is_empty() {
            Ok(UpsertOutcome::Duplicate)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn insert_decisions(&self, decisions: &[RotationDecision]) -> Result<()> {
        for d in decisions {
            let metrics = d
                .metrics_snapshot
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?;
            sqlx::query(
                r#"
                INSERT INTO rotation_decisions (
                    id, period, agent_id, decision_type, previous_tier, new_tier,
                    reason, metrics_snapshot, is_applied, created_at, applied_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(d.id)
            .bind(&d.period)
            .bind(&d.agent_id)
            .bind(d.decision_type.to_string())
            .bind(d.previous_tier.to_string())
            .bind(d.new_tier.to_string())
            .bind(&d.reason)
            .bind(metrics)
            .bind(d.is_applied())
            .bind(d.created_at)
            .bind(d.applied_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn mark_decision_applied(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE rotation_decisions
            SET is_applied = TRUE, applied_at = $2
            WHERE id = $1 AND is_applied = FALSE
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MetablendError::Configuration(format!(
                "unknown or already-applied rotation decision: {id}"
            )));
        }
        Ok(())
    }

    async fn append_regime(&self, symbol: &str, state: &RegimeState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO regime_history (
                symbol, regime_type, confidence, volatility_level,
                trend_direction, trend_strength, as_of
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(symbol)
        .bind(state.regime_type.to_string())
        .bind(state.confidence)
        .bind(state.volatility_level.to_string())
        .bind(state.trend_direction.to_string())
        .bind(state.trend_strength)
        .bind(state.as_of)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_ensemble(&self, symbol: &str) -> Result<Option<EnsembleSignal>> {
        let row = sqlx::query(
            r#"
            SELECT symbol, period, signal_type, confidence, blended_score,
                   contributing_agents, agent_weights, reasoning, regime, created_at
            FROM ensemble_signals
            WHERE symbol = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(EnsembleSignal {
                symbol: r.try_get("symbol")?,
                period: r.try_get("period")?,
                signal_type: r.try_get::<String, _>("signal_type")?.parse::<SignalType>()?,
                confidence: r.try_get("confidence")?,
                blended_score: r.try_get("blended_score")?,
                contributing_agents: serde_json::from_value(
                    r.try_get("contributing_agents")?,
                )?,
                agent_weights: serde_json::from_value(r.try_get("agent_weights")?)?,
                reasoning: r.try_get("reasoning")?,
                regime: r.try_get::<String, _>("regime")?.parse::<RegimeType>()?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn current_weights(&self, regime: RegimeType) -> Result<Vec<AgentWeight>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_id, regime_type, performance_score, regime_score,
                   recency_score, volatility_adjustment, final_weight,
                   calculation_method, computed_at
            FROM agent_weights
            WHERE regime_type = $1
              AND period = (
                  SELECT period FROM agent_weights
                  WHERE regime_type = $1
                  ORDER BY computed_at DESC
                  LIMIT 1
              )
            ORDER BY agent_id
            "#,
        )
        .bind(regime.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(AgentWeight {
                    agent_id: r.try_get("agent_id")?,
                    regime_type: r.try_get::<String, _>("regime_type")?.parse::<RegimeType>()?,
                    performance_score: r.try_get("performance_score")?,
                    regime_score: r.try_get("regime_score")?,
                    recency_score: r.try_get("recency_score")?,
                    volatility_adjustment: r.try_get("volatility_adjustment")?,
                    final_weight: r.try_get("final_weight")?,
                    calculation_method: r
                        .try_get::<String, _>("calculation_method")?
                        .parse::<CalculationMethod>()?,
                    computed_at: r.try_get("computed_at")?,
                })
            })
            .collect()
    }

    async fn ranking_for_period(&self, period: &str) -> Result<Vec<RankingEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT period, agent_id, rank, score, score_change, rank_change,
                   has_previous, performance_tier, is_active
            FROM agent_rankings
            WHERE period = $1
            ORDER BY rank
            "#,
        )
        .bind(period)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ranking_from_row).collect()
    }

    async fn latest_ranking(&self) -> Result<Option<(String, Vec<RankingEntry>)>> {
        let row = sqlx::query(
            r#"
            SELECT period FROM agent_rankings
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let period: String = row.try_get("period")?;
        let entries = self.ranking_for_period(&period).await?;
        Ok(Some((period, entries)))
    }

    async fn pending_decisions(&self) -> Result<Vec<RotationDecision>> {
        let rows = sqlx::query(
            r#"
            SELECT id, period, agent_id, decision_type, previous_tier, new_tier,
                   reason, metrics_snapshot, created_at, applied_at
            FROM rotation_decisions
            WHERE is_applied = FALSE
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let metrics: Option<serde_json::Value> = r.try_get("metrics_snapshot")?;
                Ok(RotationDecision {
                    id: r.try_get("id")?,
                    period: r.try_get("period")?,
                    agent_id: r.try_get("agent_id")?,
                    decision_type: r
                        .try_get::<String, _>("decision_type")?
                        .parse::<DecisionType>()?,
                    previous_tier: r
                        .try_get::<String, _>("previous_tier")?
                        .parse::<OperationalTier>()?,
                    new_tier: r.try_get::<String, _>("new_tier")?.parse::<OperationalTier>()?,
                    reason: r.try_get("reason")?,
                    metrics_snapshot: metrics.map(serde_json::from_value).transpose()?,
                    status: DecisionStatus::Proposed,
                    created_at: r.try_get("created_at")?,
                    applied_at: r.try_get("applied_at")?,
                })
            })
            .collect()
    }
}

fn ranking_from_row(r: sqlx::postgres::PgRow) -> Result<RankingEntry> {
    Ok(RankingEntry {
        period: r.try_get("period")?,
        agent_id: r.try_get("agent_id")?,
        rank: r.try_get::<i32, _>("rank")? as u32,
        score: r.try_get("score")?,
        score_change: r.try_get("score_change")?,
        rank_change: r.try_get("rank_change")?,
        has_previous: r.try_get("has_previous")?,
        performance_tier: r
            .try_get::<String, _>("performance_tier")?
            .parse::<PerformanceTier>()?,
        is_active: r.try_get("is_active")?,
    })
}
