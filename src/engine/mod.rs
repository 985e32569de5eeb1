//! Cycle orchestration: blending per symbol, ranking/rotation per period.
//!
//! Concurrency model:
//! - Blend cycles run in parallel across symbols; a per-symbol try-lock
//!   enforces at most one in-flight computation per symbol (skip-if-busy),
//!   so ensemble signals for a symbol are totally ordered by creation time.
//! - Every computation reads from a tracker snapshot taken at cycle start;
//!   outcomes arriving mid-cycle never partially affect it. The tracker lock
//!   is released before any I/O.
//! - Ranking and rotation are serialized behind a single gate and made
//!   re-entrant by the store's duplicate rejection: a second trigger for the
//!   same period discards its result without touching rotation state.
//! - Collaborator fetches are bounded by a timeout; on timeout the cycle
//!   degrades to the last known regime instead of blocking.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::blender::SignalBlender;
use crate::config::AppConfig;
use crate::domain::{
    AgentSignal, AgentWeight, EnsembleSignal, Outcome, PerformanceRecord, RankingEntry,
    RegimeState, RegimeType, RotationDecision,
};
use crate::error::{MetablendError, Result};
use crate::persistence::Store;
use crate::providers::{MarketDataProvider, SignalSource};
use crate::ranking::{RankingEngine, RotationEngine};
use crate::regime;
use crate::tracker::PerformanceTracker;
use crate::weights::WeightCalculator;

/// Explicit execution context for one cycle: the clock and the period id are
/// passed in, never taken from ambient state, so runs replay deterministically.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub now: DateTime<Utc>,
    pub period: String,
}

impl CycleContext {
    /// Blending period: the timestamp truncated to the blend cadence.
    pub fn for_blend(now: DateTime<Utc>, interval_secs: u64) -> Self {
        let interval = interval_secs.max(1) as i64;
        let bucket = now.timestamp() - now.timestamp().rem_euclid(interval);
        let start = Utc
            .timestamp_opt(bucket, 0)
            .single()
            .unwrap_or(now);
        Self {
            now,
            period: start.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }

    /// Ranking period: one per calendar day.
    pub fn for_ranking(now: DateTime<Utc>) -> Self {
        Self {
            now,
            period: now.format("%Y-%m-%d").to_string(),
        }
    }
}

/// The meta-evaluation engine: owns the tracker and the computation
/// components, talks to collaborators through trait seams.
pub struct EvaluationEngine {
    config: AppConfig,
    tracker: RwLock<PerformanceTracker>,
    calculator: WeightCalculator,
    blender: SignalBlender,
    ranking: RankingEngine,
    rotation: Mutex<RotationEngine>,
    /// Serializes ranking passes and remembers the last completed period
    ranking_gate: Mutex<Option<String>>,
    /// Per-symbol in-flight guards (skip-if-busy)
    blend_guards: BTreeMap<String, Mutex<()>>,
    /// Last classified regime per symbol, the degrade target on fetch failure
    last_regime: RwLock<BTreeMap<String, RegimeState>>,
    store: Arc<dyn Store>,
    provider: Arc<dyn MarketDataProvider>,
    signals: Arc<dyn SignalSource>,
}

impl EvaluationEngine {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        provider: Arc<dyn MarketDataProvider>,
        signals: Arc<dyn SignalSource>,
    ) -> Self {
        let blend_guards = config
            .scheduler
            .symbols
            .iter()
            .map(|s| (s.clone(), Mutex::new(())))
            .collect();
        Self {
            tracker: RwLock::new(PerformanceTracker::new(config.evaluation.clone())),
            calculator: WeightCalculator::new(config.weights.clone()),
            blender: SignalBlender::new(config.blend.clone()),
            ranking: RankingEngine::new(config.ranking.clone()),
            rotation: Mutex::new(RotationEngine::new(config.rotation.clone())),
            ranking_gate: Mutex::new(None),
            blend_guards,
            last_regime: RwLock::new(BTreeMap::new()),
            store,
            provider,
            signals,
            config,
        }
    }

    /// Evaluation window length, for callers backfilling outcome history.
    pub fn window_days(&self) -> i64 {
        self.config.evaluation.window_days
    }

    /// Feed one realized outcome into the tracker. Idempotent per
    /// (agent, prediction_id).
    pub async fn record_outcome(&self, outcome: Outcome) {
        let agent_id = outcome.agent_id.clone();
        {
            let mut tracker = self.tracker.write().await;
            tracker.record_outcome(outcome);
        }
        let mut rotation = self.rotation.lock().await;
        rotation.register_agent(&agent_id);
    }

    /// Run one blend cycle for a symbol.
    ///
    /// Returns the persisted ensemble, or `None` when the cycle was skipped
    /// (busy, no data, or lost the write race). Only configuration errors
    /// propagate.
    pub async fn run_blend_cycle(
        &self,
        symbol: &str,
        ctx: &CycleContext,
    ) -> Result<Option<EnsembleSignal>> {
        let Some(guard) = self.blend_guards.get(symbol) else {
            return Err(MetablendError::Configuration(format!(
                "symbol not configured for blending: {symbol}"
            )));
        };
        let Ok(_in_flight) = guard.try_lock() else {
            debug!(symbol, "blend already in flight, skipping");
            return Ok(None);
        };

        // Snapshot-consistent read; lock released before any I/O
        let snapshot = {
            let tracker = self.tracker.read().await;
            tracker.snapshot()
        };
        let candidates = snapshot.observed_agents();
        if candidates.is_empty() {
            debug!(symbol, "no observed agents yet, skipping blend");
            return Ok(None);
        }

        let regime_state = match self.fetch_regime(symbol).await {
            Some(state) => state,
            None => {
                warn!(symbol, "no regime available and nothing cached, skipping cycle");
                return Ok(None);
            }
        };

        let weights =
            self.calculator
                .compute_weights(&regime_state, &candidates, &snapshot, ctx.now);
        if self
            .store
            .upsert_weights(&ctx.period, &weights.values().cloned().collect::<Vec<_>>())
            .await?
            .is_duplicate()
        {
            debug!(symbol, period = %ctx.period, "weight set already computed this period");
        }

        let signals = self.fetch_signals(symbol).await;
        let ensemble = match self.blender.blend(
            symbol,
            &signals,
            &weights,
            &regime_state,
            &ctx.period,
            ctx.now,
        ) {
            Ok(ensemble) => ensemble,
            Err(e) if e.is_recoverable() => {
                warn!(symbol, error = %e, "blend degraded, last persisted ensemble stays authoritative");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if self.store.upsert_ensemble(&ensemble).await?.is_duplicate() {
            debug!(symbol, period = %ctx.period, "lost ensemble write race, discarding");
            return Ok(None);
        }

        info!(
            symbol,
            period = %ctx.period,
            signal = %ensemble.signal_type,
            score = ensemble.blended_score,
            confidence = ensemble.confidence,
            "ensemble signal persisted"
        );
        Ok(Some(ensemble))
    }

    /// Blend all configured symbols in parallel.
    pub async fn run_blend_all(&self, now: DateTime<Utc>) -> Vec<Result<Option<EnsembleSignal>>> {
        let ctx = CycleContext::for_blend(now, self.config.scheduler.blend_interval_secs);
        let futures = self
            .config
            .scheduler
            .symbols
            .iter()
            .map(|symbol| {
                let ctx = ctx.clone();
                async move { self.run_blend_cycle(symbol, &ctx).await }
            })
            .collect::<Vec<_>>();
        join_all(futures).await
    }

    /// Run one ranking + rotation pass for a period.
    ///
    /// Sequential relative to itself; safely re-entrant for the same period
    /// (the duplicate snapshot is discarded before rotation state advances).
    pub async fn run_ranking_cycle(&self, ctx: &CycleContext) -> Result<Vec<RotationDecision>> {
        let mut gate = self.ranking_gate.lock().await;
        if gate.as_deref() == Some(ctx.period.as_str()) {
            debug!(period = %ctx.period, "ranking already completed this period");
            return Ok(Vec::new());
        }

        let snapshot = {
            let tracker = self.tracker.read().await;
            tracker.snapshot()
        };

        let mut records: Vec<PerformanceRecord> = Vec::new();
        for agent_id in snapshot.observed_agents() {
            match snapshot.performance(&agent_id, ctx.now) {
                Ok(record) => records.push(record),
                Err(MetablendError::InsufficientHistory { samples, required, .. }) => {
                    debug!(agent_id = %agent_id, samples, required, "agent not ranked yet (cold start)");
                }
                Err(e) => return Err(e),
            }
        }
        if records.is_empty() {
            debug!(period = %ctx.period, "no rankable agents");
            return Ok(Vec::new());
        }

        let previous = self
            .store
            .latest_ranking()
            .await?
            .map(|(_, entries)| entries)
            .unwrap_or_default();
        let entries = self.ranking.rank(&ctx.period, &records, &previous);

        // A duplicate snapshot means another trigger already ranked this
        // period: discard before rotation state can advance twice.
        if self.store.upsert_ranking(&entries).await?.is_duplicate() {
            debug!(period = %ctx.period, "ranking already persisted, discarding pass");
            *gate = Some(ctx.period.clone());
            return Ok(Vec::new());
        }

        let known: BTreeSet<String> = snapshot.observed_agents().into_iter().collect();
        let by_agent: BTreeMap<String, PerformanceRecord> = records
            .iter()
            .map(|r| (r.agent_id.clone(), r.clone()))
            .collect();
        let decisions = {
            let mut rotation = self.rotation.lock().await;
            rotation.evaluate(&ctx.period, &entries, &known, &by_agent, ctx.now)?
        };
        self.store.insert_decisions(&decisions).await?;

        let transitions = decisions.iter().filter(|d| d.is_tier_change()).count();
        info!(
            period = %ctx.period,
            agents = entries.len(),
            transitions,
            "ranking pass complete"
        );

        *gate = Some(ctx.period.clone());
        Ok(decisions)
    }

    /// Orchestrator confirmation that a proposed decision was enforced.
    pub async fn apply_decision(
        &self,
        decision: &RotationDecision,
        at: DateTime<Utc>,
    ) -> Result<RotationDecision> {
        let applied = {
            let rotation = self.rotation.lock().await;
            rotation.confirm_applied(decision, at)?
        };
        self.store.mark_decision_applied(decision.id, at).await?;
        Ok(applied)
    }

    // --- Read APIs (absence is an empty result, never an error) ---

    pub async fn latest_ensemble(&self, symbol: &str) -> Result<Option<EnsembleSignal>> {
        self.store.latest_ensemble(symbol).await
    }

    pub async fn current_weights(&self, regime: RegimeType) -> Result<Vec<AgentWeight>> {
        self.store.current_weights(regime).await
    }

    pub async fn latest_ranking(&self) -> Result<Option<(String, Vec<RankingEntry>)>> {
        self.store.latest_ranking().await
    }

    pub async fn pending_decisions(&self) -> Result<Vec<RotationDecision>> {
        self.store.pending_decisions().await
    }

    /// Run the scheduler loops until the shutdown flag flips.
    pub async fn run_until(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let mut blend_tick = tokio::time::interval(Duration::from_secs(
            self.config.scheduler.blend_interval_secs,
        ));
        let mut ranking_tick = tokio::time::interval(Duration::from_secs(
            self.config.scheduler.ranking_interval_secs,
        ));

        loop {
            tokio::select! {
                _ = blend_tick.tick() => {
                    let now = Utc::now();
                    for result in self.run_blend_all(now).await {
                        if let Err(e) = result {
                            warn!(error = %e, "blend cycle failed");
                        }
                    }
                }
                _ = ranking_tick.tick() => {
                    let ctx = CycleContext::for_ranking(Utc::now());
                    if let Err(e) = self.run_ranking_cycle(&ctx).await {
                        warn!(error = %e, "ranking cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Fetch and classify the current regime, falling back to the last
    /// cached state when the provider stalls or fails.
    async fn fetch_regime(&self, symbol: &str) -> Option<RegimeState> {
        let timeout = Duration::from_millis(self.config.scheduler.fetch_timeout_ms);
        let fetched = tokio::time::timeout(timeout, self.provider.snapshot(symbol)).await;

        match fetched {
            Ok(Ok(snapshot)) => {
                let state = regime::classify(&snapshot, &self.config.regime);
                if let Err(e) = self.store.append_regime(symbol, &state).await {
                    warn!(symbol, error = %e, "regime audit append failed");
                }
                self.last_regime
                    .write()
                    .await
                    .insert(symbol.to_string(), state.clone());
                Some(state)
            }
            Ok(Err(e)) => {
                warn!(symbol, error = %e, "market data unavailable, degrading to cached regime");
                self.cached_regime(symbol).await
            }
            Err(_) => {
                warn!(
                    symbol,
                    timeout_ms = self.config.scheduler.fetch_timeout_ms,
                    "market data fetch timed out, degrading to cached regime"
                );
                self.cached_regime(symbol).await
            }
        }
    }

    async fn cached_regime(&self, symbol: &str) -> Option<RegimeState> {
        self.last_regime.read().await.get(symbol).cloned()
    }

    /// Collect this cycle's agent signals; absence of any or all agents is
    /// tolerated and handled downstream by weight renormalization.
    async fn fetch_signals(&self, symbol: &str) -> Vec<AgentSignal> {
        let timeout = Duration::from_millis(self.config.scheduler.fetch_timeout_ms);
        match tokio::time::timeout(timeout, self.signals.collect(symbol)).await {
            Ok(Ok(signals)) => signals,
            Ok(Err(e)) => {
                warn!(symbol, error = %e, "signal collection failed, blending with none");
                Vec::new()
            }
            Err(_) => {
                warn!(symbol, "signal collection timed out, blending with none");
                Vec::new()
            }
        }
    }
}
