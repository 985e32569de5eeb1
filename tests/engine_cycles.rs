//! Engine-level scenarios driving full blend and ranking cycles through
//! scripted collaborators and the in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use metablend::config::{
    AppConfig, DatabaseConfig, EvaluationConfig, SchedulerConfig,
};
use metablend::domain::{
    AgentSignal, MarketSnapshot, Outcome, RealizedDirection, RegimeType, SignalType,
};
use metablend::engine::{CycleContext, EvaluationEngine};
use metablend::error::{MetablendError, Result};
use metablend::persistence::MemoryStore;
use metablend::providers::{MarketDataProvider, SignalSource};
use metablend::DecisionType;

/// Pops one scripted response per fetch; an empty script means the
/// upstream is down.
struct ScriptedMarket {
    responses: Mutex<VecDeque<MarketSnapshot>>,
}

impl ScriptedMarket {
    fn new(responses: Vec<MarketSnapshot>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl MarketDataProvider for ScriptedMarket {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let popped = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        popped.ok_or_else(|| {
            MetablendError::DataUnavailable(format!("no market data for {symbol}"))
        })
    }
}

struct ScriptedSignals {
    signals: Vec<AgentSignal>,
}

#[async_trait]
impl SignalSource for ScriptedSignals {
    async fn collect(&self, symbol: &str) -> Result<Vec<AgentSignal>> {
        Ok(self
            .signals
            .iter()
            .filter(|s| s.symbol == symbol)
            .cloned()
            .collect())
    }
}

fn test_config(symbols: &[&str]) -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 1,
        },
        evaluation: EvaluationConfig {
            min_samples: 3,
            ..Default::default()
        },
        regime: Default::default(),
        weights: Default::default(),
        blend: Default::default(),
        ranking: Default::default(),
        rotation: Default::default(),
        scheduler: SchedulerConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        logging: Default::default(),
    }
}

fn bull_snapshot(now: DateTime<Utc>) -> MarketSnapshot {
    MarketSnapshot {
        symbol: "SPY".to_string(),
        close: dec!(450),
        annualized_vol: 0.15,
        trend_return: 0.08,
        volume_ratio: 1.1,
        as_of: now,
    }
}

fn outcome(
    agent: &str,
    seq: usize,
    predicted: SignalType,
    actual: RealizedDirection,
    realized_return: f64,
    now: DateTime<Utc>,
) -> Outcome {
    Outcome {
        agent_id: agent.to_string(),
        prediction_id: format!("{agent}-{seq}"),
        symbol: "SPY".to_string(),
        predicted,
        actual,
        realized_return,
        confidence: 0.7,
        regime: Some(RegimeType::Bull),
        timestamp: now - Duration::hours(seq as i64 + 1),
    }
}

fn signal(agent: &str, signal_type: SignalType, now: DateTime<Utc>) -> AgentSignal {
    AgentSignal::new(agent, "SPY", signal_type, 0.8, now)
}

async fn seed_history(engine: &EvaluationEngine, agent: &str, correct: usize, now: DateTime<Utc>) {
    for i in 0..4 {
        let (actual, ret) = if i < correct {
            (RealizedDirection::Up, 0.01)
        } else {
            (RealizedDirection::Down, -0.01)
        };
        engine
            .record_outcome(outcome(agent, i, SignalType::Buy, actual, ret, now))
            .await;
    }
}

#[tokio::test]
async fn blend_cycle_persists_ensemble_and_rejects_duplicates() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    let market = Arc::new(ScriptedMarket::new(vec![
        bull_snapshot(now),
        bull_snapshot(now),
    ]));
    let signals = Arc::new(ScriptedSignals {
        signals: vec![
            signal("alpha", SignalType::Buy, now),
            signal("beta", SignalType::Sell, now),
            signal("gamma", SignalType::Buy, now),
        ],
    });
    let engine = EvaluationEngine::new(
        test_config(&["SPY"]),
        store.clone(),
        market,
        signals,
    );

    // One outcome each: all three agents are cold, pinned to 1/3
    for agent in ["alpha", "beta", "gamma"] {
        engine
            .record_outcome(outcome(
                agent,
                0,
                SignalType::Buy,
                RealizedDirection::Up,
                0.01,
                now,
            ))
            .await;
    }

    let ctx = CycleContext::for_blend(now, 1800);
    let ensemble = engine
        .run_blend_cycle("SPY", &ctx)
        .await
        .unwrap()
        .expect("first cycle should produce an ensemble");

    // 1/3 + (-1/3) + 1/3 = 1/3, above the 0.25 buy threshold
    assert_eq!(ensemble.signal_type, SignalType::Buy);
    assert!((ensemble.blended_score - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(
        ensemble.contributing_agents,
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
    );
    let weight_sum: f64 = ensemble.agent_weights.values().sum();
    assert!((weight_sum - 1.0).abs() < 1e-6);

    let persisted = engine.latest_ensemble("SPY").await.unwrap();
    assert_eq!(persisted.map(|s| s.period), Some(ctx.period.clone()));

    // Same period again: the second writer loses and discards
    let rerun = engine.run_blend_cycle("SPY", &ctx).await.unwrap();
    assert!(rerun.is_none());
}

#[tokio::test]
async fn blend_degrades_to_cached_regime_when_provider_fails() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    // Only one scripted snapshot: the second fetch fails
    let market = Arc::new(ScriptedMarket::new(vec![bull_snapshot(now)]));
    let signals = Arc::new(ScriptedSignals {
        signals: vec![signal("alpha", SignalType::Buy, now)],
    });
    let engine = EvaluationEngine::new(
        test_config(&["SPY"]),
        store.clone(),
        market,
        signals,
    );
    engine
        .record_outcome(outcome(
            "alpha",
            0,
            SignalType::Buy,
            RealizedDirection::Up,
            0.01,
            now,
        ))
        .await;

    let first = CycleContext::for_blend(now, 1800);
    assert!(engine.run_blend_cycle("SPY", &first).await.unwrap().is_some());

    let later = now + Duration::minutes(30);
    let second = CycleContext::for_blend(later, 1800);
    let degraded = engine
        .run_blend_cycle("SPY", &second)
        .await
        .unwrap()
        .expect("cached regime should carry the cycle");
    assert_eq!(degraded.regime, RegimeType::Bull);

    // Only the fresh classification was audited
    assert_eq!(store.regime_history_len().await, 1);
}

#[tokio::test]
async fn blend_skips_when_no_regime_was_ever_classified() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    let market = Arc::new(ScriptedMarket::new(Vec::new()));
    let signals = Arc::new(ScriptedSignals {
        signals: vec![signal("alpha", SignalType::Buy, now)],
    });
    let engine = EvaluationEngine::new(
        test_config(&["SPY"]),
        store,
        market,
        signals,
    );
    engine
        .record_outcome(outcome(
            "alpha",
            0,
            SignalType::Buy,
            RealizedDirection::Up,
            0.01,
            now,
        ))
        .await;

    let ctx = CycleContext::for_blend(now, 1800);
    assert!(engine.run_blend_cycle("SPY", &ctx).await.unwrap().is_none());
}

#[tokio::test]
async fn blend_rejects_unconfigured_symbol() {
    let now = Utc::now();
    let engine = EvaluationEngine::new(
        test_config(&["SPY"]),
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedMarket::new(Vec::new())),
        Arc::new(ScriptedSignals { signals: vec![] }),
    );

    let ctx = CycleContext::for_blend(now, 1800);
    let err = engine.run_blend_cycle("QQQ", &ctx).await.unwrap_err();
    assert!(matches!(err, MetablendError::Configuration(_)));
}

#[tokio::test]
async fn ranking_cycle_is_idempotent_per_period() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    let engine = EvaluationEngine::new(
        test_config(&["SPY"]),
        store.clone(),
        Arc::new(ScriptedMarket::new(Vec::new())),
        Arc::new(ScriptedSignals { signals: vec![] }),
    );

    seed_history(&engine, "alpha", 4, now).await;
    seed_history(&engine, "beta", 1, now).await;

    let ctx = CycleContext {
        now,
        period: "2026-08-30".to_string(),
    };
    let decisions = engine.run_ranking_cycle(&ctx).await.unwrap();
    assert_eq!(decisions.len(), 2);
    assert!(decisions
        .iter()
        .all(|d| d.decision_type == DecisionType::Maintain));

    let (period, entries) = engine.latest_ranking().await.unwrap().unwrap();
    assert_eq!(period, "2026-08-30");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].agent_id, "alpha");
    assert_eq!(entries[0].rank, 1);

    // Second trigger for the same period is a no-op
    let rerun = engine.run_ranking_cycle(&ctx).await.unwrap();
    assert!(rerun.is_empty());
}

#[tokio::test]
async fn persistent_underperformer_is_demoted_after_three_periods() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    let engine = EvaluationEngine::new(
        test_config(&["SPY"]),
        store.clone(),
        Arc::new(ScriptedMarket::new(Vec::new())),
        Arc::new(ScriptedSignals { signals: vec![] }),
    );

    seed_history(&engine, "alpha", 4, now).await;
    seed_history(&engine, "beta", 1, now).await;

    let mut last = Vec::new();
    for day in 1..=3 {
        let ctx = CycleContext {
            now: now + Duration::days(day),
            period: format!("2026-09-{day:02}"),
        };
        last = engine.run_ranking_cycle(&ctx).await.unwrap();
    }

    let beta = last
        .iter()
        .find(|d| d.agent_id == "beta")
        .expect("beta should get a decision every period");
    assert_eq!(beta.decision_type, DecisionType::Demote);

    // Demotion stayed Proposed until an orchestrator confirms it
    let pending = engine.pending_decisions().await.unwrap();
    assert!(pending.iter().any(|d| d.id == beta.id));

    let applied = engine
        .apply_decision(beta, now + Duration::days(4))
        .await
        .unwrap();
    assert!(applied.is_applied());
    let pending = engine.pending_decisions().await.unwrap();
    assert!(!pending.iter().any(|d| d.id == beta.id));
}
