//! Collaborator seams: market data and agent signal sources.
//!
//! The engine never fetches anything directly; it consumes these traits with
//! a timeout and degrades to cached state when a collaborator stalls. Test
//! doubles live here too since the engine tests drive cycles through them.

pub mod pg;

pub use pg::{PgMarketData, PgOutcomeFeed, PgSignalSource};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{AgentSignal, MarketSnapshot};
use crate::error::{MetablendError, Result};

/// Delivers derived market indicators per symbol.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Latest indicator snapshot for a symbol. Implementations should return
    /// `DataUnavailable` rather than blocking when the upstream is down.
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot>;
}

/// Collects the per-agent signals available for the current cycle.
/// An agent not delivering is a normal, tolerated condition.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn collect(&self, symbol: &str) -> Result<Vec<AgentSignal>>;
}

/// Staleness guard shared by provider implementations: a snapshot older than
/// the tolerance must not silently pass for fresh data.
pub fn check_staleness(
    snapshot: &MarketSnapshot,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<()> {
    if now - snapshot.as_of > tolerance {
        return Err(MetablendError::StaleData(format!(
            "snapshot for {} is {}s old, tolerance {}s",
            snapshot.symbol,
            (now - snapshot.as_of).num_seconds(),
            tolerance.num_seconds()
        )));
    }
    Ok(())
}
