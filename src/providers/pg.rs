//! Postgres-backed collaborator readers.
//!
//! Upstream services write market snapshots and per-agent signals into
//! shared tables; these providers read the latest rows. They never write.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::{AgentSignal, MarketSnapshot, Outcome, RealizedDirection, RegimeType, SignalType};
use crate::error::{MetablendError, Result};

use super::{check_staleness, MarketDataProvider, SignalSource};

/// Reads the most recent indicator snapshot per symbol from
/// `market_snapshots`, rejecting stale rows.
pub struct PgMarketData {
    pool: PgPool,
    staleness_tolerance: Duration,
}

impl PgMarketData {
    pub fn new(pool: PgPool, staleness_tolerance: Duration) -> Self {
        Self {
            pool,
            staleness_tolerance,
        }
    }
}

#[async_trait]
impl MarketDataProvider for PgMarketData {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT symbol, close, annualized_vol, trend_return, volume_ratio, as_of
            FROM market_snapshots
            WHERE symbol = $1
            ORDER BY as_of DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            MetablendError::DataUnavailable(format!("no market snapshot for {symbol}"))
        })?;

        let snapshot = MarketSnapshot {
            symbol: row.get::<String, _>("symbol"),
            close: row.get::<Decimal, _>("close"),
            annualized_vol: row.get::<f64, _>("annualized_vol"),
            trend_return: row.get::<f64, _>("trend_return"),
            volume_ratio: row.get::<f64, _>("volume_ratio"),
            as_of: row.get::<DateTime<Utc>, _>("as_of"),
        };
        check_staleness(&snapshot, Utc::now(), self.staleness_tolerance)?;
        Ok(snapshot)
    }
}

/// Reads each agent's most recent signal for a symbol from `agent_signals`,
/// bounded to the current cycle's freshness window.
pub struct PgSignalSource {
    pool: PgPool,
    freshness: Duration,
}

impl PgSignalSource {
    pub fn new(pool: PgPool, freshness: Duration) -> Self {
        Self { pool, freshness }
    }
}

#[async_trait]
impl SignalSource for PgSignalSource {
    async fn collect(&self, symbol: &str) -> Result<Vec<AgentSignal>> {
        let cutoff = Utc::now() - self.freshness;
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (agent_id)
                agent_id, symbol, signal_type, confidence, created_at
            FROM agent_signals
            WHERE symbol = $1 AND created_at >= $2
            ORDER BY agent_id, created_at DESC
            "#,
        )
        .bind(symbol)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut signals = Vec::with_capacity(rows.len());
        for row in rows {
            let signal_type: SignalType = row.get::<String, _>("signal_type").parse()?;
            signals.push(AgentSignal::new(
                row.get::<String, _>("agent_id"),
                row.get::<String, _>("symbol"),
                signal_type,
                row.get::<f64, _>("confidence"),
                row.get::<DateTime<Utc>, _>("created_at"),
            ));
        }
        Ok(signals)
    }
}

/// Reads realized outcomes written by the settlement pipeline. The tracker
/// deduplicates by (agent_id, prediction_id), so overlapping polls are safe.
pub struct PgOutcomeFeed {
    pool: PgPool,
}

impl PgOutcomeFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Outcomes evaluated at or after the cutoff, oldest first.
    pub async fn fetch_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Outcome>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_id, prediction_id, symbol, predicted, actual,
                   realized_return, confidence, regime, evaluated_at
            FROM agent_outcomes
            WHERE evaluated_at >= $1
            ORDER BY evaluated_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let predicted: SignalType = row.get::<String, _>("predicted").parse()?;
            let actual: RealizedDirection = row.get::<String, _>("actual").parse()?;
            let regime = row
                .get::<Option<String>, _>("regime")
                .map(|s| s.parse::<RegimeType>())
                .transpose()?;
            outcomes.push(Outcome {
                agent_id: row.get("agent_id"),
                prediction_id: row.get("prediction_id"),
                symbol: row.get("symbol"),
                predicted,
                actual,
                realized_return: row.get("realized_return"),
                confidence: row.get("confidence"),
                regime,
                timestamp: row.get::<DateTime<Utc>, _>("evaluated_at"),
            });
        }
        Ok(outcomes)
    }
}
