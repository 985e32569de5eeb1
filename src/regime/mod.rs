//! Regime Classifier — deterministic threshold rules over a market snapshot.
//!
//! Pure function of its inputs: identical snapshots always classify to an
//! identical [`RegimeState`], which is what makes regimes replayable in tests.
//! The classifier never fetches data; indicators arrive pre-derived from the
//! market data collaborator.

use crate::config::RegimeThresholds;
use crate::domain::{MarketSnapshot, RegimeState, RegimeType, TrendDirection, VolatilityLevel};

/// Classify a market snapshot into a regime.
///
/// Precedence: extreme volatility wins outright, then directional trend,
/// then flat markets, then everything in between is a trending-but-undecided
/// market. Confidence grows with distance from the deciding boundary, so a
/// snapshot sitting right on a cut point classifies with low conviction.
pub fn classify(snapshot: &MarketSnapshot, thresholds: &RegimeThresholds) -> RegimeState {
    let vol = snapshot.annualized_vol.max(0.0);
    let trend = snapshot.trend_return;

    let volatility_level = bucket_volatility(vol, thresholds);
    let trend_direction = bucket_trend(trend, thresholds);
    let trend_strength = trend.abs();

    let (regime_type, confidence) = if vol > thresholds.vol_high {
        (
            RegimeType::Volatile,
            boundary_confidence(vol / thresholds.vol_high - 1.0),
        )
    } else if trend > thresholds.trend_threshold {
        (
            RegimeType::Bull,
            boundary_confidence(trend / thresholds.trend_threshold - 1.0),
        )
    } else if trend < -thresholds.trend_threshold {
        (
            RegimeType::Bear,
            boundary_confidence(trend.abs() / thresholds.trend_threshold - 1.0),
        )
    } else if trend.abs() < thresholds.neutral_band {
        // Flat market: confidence decays toward the trending boundary
        (
            RegimeType::Neutral,
            boundary_confidence(1.0 - trend.abs() / thresholds.neutral_band),
        )
    } else {
        // Between the neutral band and the directional threshold
        let band_width = thresholds.trend_threshold - thresholds.neutral_band;
        let mid = thresholds.neutral_band + band_width / 2.0;
        let dist = 1.0 - (trend.abs() - mid).abs() / (band_width / 2.0);
        (RegimeType::Trending, boundary_confidence(dist))
    };

    RegimeState {
        regime_type,
        confidence,
        volatility_level,
        trend_direction,
        trend_strength,
        as_of: snapshot.as_of,
    }
}

fn bucket_volatility(vol: f64, thresholds: &RegimeThresholds) -> VolatilityLevel {
    if vol < thresholds.vol_low {
        VolatilityLevel::Low
    } else if vol < thresholds.vol_medium {
        VolatilityLevel::Medium
    } else if vol <= thresholds.vol_high {
        VolatilityLevel::High
    } else {
        VolatilityLevel::Extreme
    }
}

fn bucket_trend(trend: f64, thresholds: &RegimeThresholds) -> TrendDirection {
    if trend > thresholds.trend_threshold {
        TrendDirection::Bullish
    } else if trend < -thresholds.trend_threshold {
        TrendDirection::Bearish
    } else if trend.abs() < thresholds.neutral_band {
        TrendDirection::Neutral
    } else {
        TrendDirection::Mixed
    }
}

/// Map a normalized boundary distance into [0.5, 0.95]: at the boundary the
/// call is a coin flip with a slight edge, deep inside the bucket it tops
/// out below certainty.
fn boundary_confidence(normalized_distance: f64) -> f64 {
    let d = normalized_distance.clamp(0.0, 1.0);
    0.5 + 0.45 * d
}
