use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use metablend::config::AppConfig;
use metablend::engine::{CycleContext, EvaluationEngine};
use metablend::error::Result;
use metablend::persistence::PgStore;
use metablend::providers::{PgMarketData, PgOutcomeFeed, PgSignalSource};
use metablend::RegimeType;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metablend")]
#[command(version = "0.1.0")]
#[command(about = "Adaptive multi-agent signal weighting and meta-evaluation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config directory
    #[arg(short, long, default_value = "config")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loops (blend + ranking)
    Run,
    /// One-shot blend pass over all configured symbols
    Blend,
    /// One-shot ranking and rotation pass
    Rank,
    /// Show the latest ensemble signal for a symbol
    Signal { symbol: String },
    /// Show the current weight set for a regime
    Weights { regime: RegimeType },
    /// Show the latest ranking snapshot
    Ranking,
    /// Show proposed-but-unapplied rotation decisions
    Decisions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_logging();
            run_service(&cli.config).await?;
        }
        Commands::Blend => {
            init_logging();
            let (engine, feed) = build_engine(&cli.config).await?;
            backfill_outcomes(&engine, &feed).await?;
            let now = Utc::now();
            for result in engine.run_blend_all(now).await {
                match result {
                    Ok(Some(signal)) => info!(
                        symbol = %signal.symbol,
                        signal = %signal.signal_type,
                        confidence = signal.confidence,
                        "blended"
                    ),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "blend failed"),
                }
            }
        }
        Commands::Rank => {
            init_logging();
            let (engine, feed) = build_engine(&cli.config).await?;
            backfill_outcomes(&engine, &feed).await?;
            let ctx = CycleContext::for_ranking(Utc::now());
            let decisions = engine.run_ranking_cycle(&ctx).await?;
            for d in &decisions {
                println!(
                    "{}  {}  {} -> {}  ({})",
                    d.agent_id, d.decision_type, d.previous_tier, d.new_tier, d.reason
                );
            }
        }
        Commands::Signal { symbol } => {
            init_logging_simple();
            let (engine, _) = build_engine(&cli.config).await?;
            match engine.latest_ensemble(&symbol).await? {
                Some(s) => println!(
                    "{}  {}  score={:.4} confidence={:.4} regime={}\n  {}",
                    s.symbol, s.signal_type, s.blended_score, s.confidence, s.regime, s.reasoning
                ),
                None => println!("no ensemble signal for {symbol}"),
            }
        }
        Commands::Weights { regime } => {
            init_logging_simple();
            let (engine, _) = build_engine(&cli.config).await?;
            let weights = engine.current_weights(regime).await?;
            if weights.is_empty() {
                println!("no weight set for regime {regime}");
            }
            for w in weights {
                println!(
                    "{:<24} {:.4}  ({})",
                    w.agent_id, w.final_weight, w.calculation_method
                );
            }
        }
        Commands::Ranking => {
            init_logging_simple();
            let (engine, _) = build_engine(&cli.config).await?;
            match engine.latest_ranking().await? {
                Some((period, entries)) => {
                    println!("period {period}");
                    for e in entries {
                        println!(
                            "{:>3}. {:<24} {:.4}  {}  {}",
                            e.rank,
                            e.agent_id,
                            e.score,
                            e.performance_tier,
                            if e.is_active { "active" } else { "rotated-out" }
                        );
                    }
                }
                None => println!("no ranking snapshot yet"),
            }
        }
        Commands::Decisions => {
            init_logging_simple();
            let (engine, _) = build_engine(&cli.config).await?;
            let pending = engine.pending_decisions().await?;
            if pending.is_empty() {
                println!("no pending decisions");
            }
            for d in pending {
                println!(
                    "{}  {}  {}  {} -> {}  ({})",
                    d.id, d.period, d.agent_id, d.previous_tier, d.new_tier, d.reason
                );
            }
        }
    }

    Ok(())
}

/// Wire config, store, and providers into an engine. The outcome feed poller
/// is started separately so one-shot commands can backfill synchronously.
async fn build_engine(config_dir: &str) -> Result<(Arc<EvaluationEngine>, PgOutcomeFeed)> {
    let config = AppConfig::load_from(config_dir)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("config: {e}");
        }
        return Err(metablend::MetablendError::Configuration(format!(
            "invalid configuration ({} errors)",
            errors.len()
        )));
    }

    let store = PgStore::connect(&config.database.url, config.database.max_connections).await?;
    store.ensure_schema().await?;
    let pool = store.pool().clone();

    let staleness = ChronoDuration::seconds(config.scheduler.blend_interval_secs as i64 * 2);
    let provider = Arc::new(PgMarketData::new(pool.clone(), staleness));
    let signals = Arc::new(PgSignalSource::new(
        pool.clone(),
        ChronoDuration::seconds(config.scheduler.blend_interval_secs as i64 * 2),
    ));
    let feed = PgOutcomeFeed::new(pool);

    let engine = Arc::new(EvaluationEngine::new(
        config,
        Arc::new(store),
        provider,
        signals,
    ));
    Ok((engine, feed))
}

/// Load the evaluation window's outcomes into the tracker. The tracker
/// deduplicates, so repeated backfills are harmless.
async fn backfill_outcomes(engine: &EvaluationEngine, feed: &PgOutcomeFeed) -> Result<()> {
    let cutoff = Utc::now() - ChronoDuration::days(engine.window_days());
    let outcomes = feed.fetch_since(cutoff).await?;
    let count = outcomes.len();
    for outcome in outcomes {
        engine.record_outcome(outcome).await;
    }
    info!(count, "outcome backfill complete");
    Ok(())
}

async fn run_service(config_dir: &str) -> Result<()> {
    let (engine, feed) = build_engine(config_dir).await?;
    info!("metablend service starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Outcome ingestion: backfill the window, then poll for new rows
    let poller = {
        let engine = engine.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut cursor = Utc::now() - ChronoDuration::days(engine.window_days());
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match feed.fetch_since(cursor).await {
                            Ok(outcomes) => {
                                if let Some(last) = outcomes.last() {
                                    cursor = last.timestamp;
                                }
                                for outcome in outcomes {
                                    engine.record_outcome(outcome).await;
                                }
                            }
                            Err(e) => warn!(error = %e, "outcome poll failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    };

    let scheduler = tokio::spawn(engine.clone().run_until(shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = poller.await;
    if let Ok(Err(e)) = scheduler.await {
        error!(error = %e, "scheduler exited with error");
    }
    info!("metablend service stopped");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,metablend=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
