use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub regime: RegimeThresholds,
    #[serde(default)]
    pub weights: WeightConfig,
    #[serde(default)]
    pub blend: BlendConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Performance tracker settings
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    /// Evaluation window in days (outcomes older than this are pruned)
    pub window_days: i64,
    /// Half-life of the exponential decay applied to outcomes, in hours
    pub decay_half_life_hours: f64,
    /// Minimum raw outcome count before a PerformanceRecord is produced
    pub min_samples: usize,
    /// Return observations per year, used to annualize sharpe/sortino
    pub periods_per_year: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            decay_half_life_hours: 48.0,
            min_samples: 10,
            periods_per_year: 252.0,
        }
    }
}

/// Threshold rules for the regime classifier.
///
/// Volatility cut points are annualized; trend cut points are fractional
/// returns over the trailing trend window.
#[derive(Debug, Clone, Deserialize)]
pub struct RegimeThresholds {
    pub vol_low: f64,
    pub vol_medium: f64,
    pub vol_high: f64,
    /// Trend beyond which the market is bullish/bearish
    pub trend_threshold: f64,
    /// Trend below which the market is flat
    pub neutral_band: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            vol_low: 0.12,
            vol_medium: 0.20,
            vol_high: 0.25,
            trend_threshold: 0.05,
            neutral_band: 0.02,
        }
    }
}

/// Convex combination weights for the weight calculator.
#[derive(Debug, Clone, Deserialize)]
pub struct WeightConfig {
    pub performance: f64,
    pub regime: f64,
    pub recency: f64,
    /// Half-life for the recency score, in hours
    pub recency_half_life_hours: f64,
    /// Regime score above which an agent keeps full weight in high volatility
    pub strong_regime_score: f64,
    /// Multiplier applied to high-variance agents in high/extreme volatility
    pub volatility_damping: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            performance: 0.5,
            regime: 0.3,
            recency: 0.2,
            recency_half_life_hours: 24.0,
            strong_regime_score: 0.6,
            volatility_damping: 0.5,
        }
    }
}

impl WeightConfig {
    /// The three component weights must form a convex combination.
    pub fn component_sum(&self) -> f64 {
        self.performance + self.regime + self.recency
    }
}

/// Signal blender thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct BlendConfig {
    /// |blended_score| at or above this maps to buy/sell
    pub signal_threshold: f64,
    /// |blended_score| at or above this maps to strong_buy/strong_sell
    pub strong_threshold: f64,
    /// Number of contributors named in the reasoning string
    pub reasoning_top_n: usize,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            signal_threshold: 0.25,
            strong_threshold: 1.0,
            reasoning_top_n: 3,
        }
    }
}

/// Composite score weights for the ranking engine.
#[derive(Debug, Clone, Deserialize)]
pub struct RankingConfig {
    pub accuracy: f64,
    pub sharpe: f64,
    pub drawdown: f64,
    pub win_rate: f64,
    pub consistency: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            accuracy: 0.30,
            sharpe: 0.25,
            drawdown: 0.15,
            win_rate: 0.15,
            consistency: 0.15,
        }
    }
}

impl RankingConfig {
    pub fn component_sum(&self) -> f64 {
        self.accuracy + self.sharpe + self.drawdown + self.win_rate + self.consistency
    }
}

/// Hysteresis guards for the rotation state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    /// Consecutive sub-threshold periods before active -> probation
    pub demote_after: u32,
    /// Further consecutive sub-threshold periods before probation -> suspended
    pub suspend_after: u32,
    /// Consecutive at-or-above-standard periods before promotion/reactivation
    pub promote_after: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            demote_after: 3,
            suspend_after: 3,
            promote_after: 3,
        }
    }
}

/// Cadence and timeouts for the engine loops.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Blending cadence in seconds (default: every 30 minutes)
    pub blend_interval_secs: u64,
    /// Ranking/rotation cadence in seconds (default: daily)
    pub ranking_interval_secs: u64,
    /// Timeout for collaborator fetches (market data, agent signals)
    pub fetch_timeout_ms: u64,
    /// Symbols the engine blends
    pub symbols: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            blend_interval_secs: 1800,
            ranking_interval_secs: 86_400,
            fetch_timeout_ms: 5_000,
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("METABLEND_ENV")
                        .unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (METABLEND_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("METABLEND")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let weight_sum = self.weights.component_sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            errors.push(format!(
                "weight component mix must sum to 1.0, got {weight_sum}"
            ));
        }

        let ranking_sum = self.ranking.component_sum();
        if (ranking_sum - 1.0).abs() > 1e-6 {
            errors.push(format!(
                "ranking component mix must sum to 1.0, got {ranking_sum}"
            ));
        }

        if self.weights.volatility_damping <= 0.0 || self.weights.volatility_damping > 1.0 {
            errors.push("volatility_damping must be in (0, 1]".to_string());
        }

        if !(self.regime.vol_low < self.regime.vol_medium
            && self.regime.vol_medium < self.regime.vol_high)
        {
            errors.push("regime volatility thresholds must be strictly increasing".to_string());
        }

        if self.regime.neutral_band >= self.regime.trend_threshold {
            errors.push("neutral_band must be below trend_threshold".to_string());
        }

        if self.blend.signal_threshold >= self.blend.strong_threshold {
            errors.push("signal_threshold must be below strong_threshold".to_string());
        }

        if self.evaluation.min_samples == 0 {
            errors.push("evaluation.min_samples must be at least 1".to_string());
        }

        if self.rotation.demote_after == 0
            || self.rotation.suspend_after == 0
            || self.rotation.promote_after == 0
        {
            errors.push("rotation hysteresis guards must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/metablend".to_string(),
                max_connections: 5,
            },
            evaluation: EvaluationConfig::default(),
            regime: RegimeThresholds::default(),
            weights: WeightConfig::default(),
            blend: BlendConfig::default(),
            ranking: RankingConfig::default(),
            rotation: RotationConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_weight_mix_rejected() {
        let mut config = AppConfig::default();
        config.weights.performance = 0.9;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("weight component mix")));
    }

    #[test]
    fn test_inverted_vol_thresholds_rejected() {
        let mut config = AppConfig::default();
        config.regime.vol_low = 0.5;
        assert!(config.validate().is_err());
    }
}
