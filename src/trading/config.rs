//! Sizing and lifecycle configuration.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Regime;

/// Size multiplier per market regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeMultipliers {
    pub trending: f64,
    pub mean_reverting: f64,
    pub volatile: f64,
    pub crisis: f64,
}

impl RegimeMultipliers {
    pub fn for_regime(&self, regime: Regime) -> f64 {
        match regime {
            Regime::Trending => self.trending,
            Regime::MeanReverting => self.mean_reverting,
            Regime::Volatile => self.volatile,
            Regime::Crisis => self.crisis,
        }
    }
}

impl Default for RegimeMultipliers {
    fn default() -> Self {
        Self {
            trending: 1.0,
            mean_reverting: 0.75,
            volatile: 0.5,
            crisis: 0.0, // No new entries
        }
    }
}

/// Size multiplier by confidence band. Bands are exclusive lower bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceTiers {
    pub high_above: f64,
    pub medium_above: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl ConfidenceTiers {
    pub fn multiplier(&self, confidence: f64) -> f64 {
        if confidence > self.high_above {
            self.high
        } else if confidence > self.medium_above {
            self.medium
        } else {
            self.low
        }
    }
}

impl Default for ConfidenceTiers {
    fn default() -> Self {
        Self {
            high_above: 0.55,
            medium_above: 0.35,
            high: 1.0,
            medium: 0.7,
            low: 0.4,
        }
    }
}

/// Configuration for position sizing and the position lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Starting paper equity
    pub initial_equity: Decimal,

    /// Kelly cap: max fraction of equity committed to one position
    pub max_position_fraction: Decimal,

    /// Max loss at the stop-loss level as a fraction of equity
    pub max_risk_per_trade: Decimal,

    /// Allocations below this fraction of equity are not worth opening
    pub min_position_fraction: Decimal,

    /// Fraction of full Kelly to use (0.0 to 1.0)
    pub kelly_fraction: f64,

    /// Floor quantities to whole units
    pub whole_units: bool,

    pub regime_multipliers: RegimeMultipliers,

    pub confidence_tiers: ConfidenceTiers,

    /// Size multiplier per holding horizon in trading days; unlisted is 1.0
    pub horizon_multipliers: BTreeMap<u32, f64>,

    /// Size multiplier per sector for high or low beta sectors; unlisted is 1.0
    pub sector_multipliers: HashMap<String, f64>,

    /// Win rate assumed for a pattern without enough history
    pub prior_win_rate: f64,

    /// Win/loss ratio assumed for a pattern without enough history
    pub prior_win_loss_ratio: f64,

    /// Closed trades needed before learned pattern stats replace priors
    pub min_trades_for_stats: u32,

    /// Signals below this confidence are dropped at validation
    pub min_confidence: f64,

    /// Patterns that are never traded
    pub excluded_patterns: Vec<String>,

    /// Holding horizon in trading days when the signal has none
    pub default_horizon_days: u32,

    /// Signals asking for a longer horizon are dropped at validation
    pub max_horizon_days: u32,

    /// Round-trip cost as a fraction of capital at risk
    pub round_trip_cost: Decimal,

    /// Instrument to sector tags, used when the signal carries none
    pub sectors: HashMap<String, String>,
}

impl TradingConfig {
    /// Sector for an instrument, preferring the signal's own tag.
    pub fn sector_for(&self, instrument: &str, tagged: Option<&str>) -> Option<String> {
        tagged
            .map(str::to_string)
            .or_else(|| self.sectors.get(instrument).cloned())
    }

    pub fn horizon_multiplier(&self, horizon_days: u32) -> f64 {
        self.horizon_multipliers.get(&horizon_days).copied().unwrap_or(1.0)
    }

    pub fn sector_multiplier(&self, sector: Option<&str>) -> f64 {
        sector
            .and_then(|s| self.sector_multipliers.get(s))
            .copied()
            .unwrap_or(1.0)
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            initial_equity: dec!(100000),
            max_position_fraction: dec!(0.05),   // Max 5% per position
            max_risk_per_trade: dec!(0.02),      // Max 2% lost at the stop
            min_position_fraction: dec!(0.005),  // Min 0.5% per position
            kelly_fraction: 0.5,                 // Half Kelly
            whole_units: true,
            regime_multipliers: RegimeMultipliers::default(),
            confidence_tiers: ConfidenceTiers::default(),
            horizon_multipliers: BTreeMap::new(),
            sector_multipliers: HashMap::new(),
            prior_win_rate: 0.5,
            prior_win_loss_ratio: 1.5,
            min_trades_for_stats: 5,
            min_confidence: 0.0,
            excluded_patterns: Vec::new(),
            default_horizon_days: 5,
            max_horizon_days: 60,
            round_trip_cost: dec!(0.0005),       // 0.05% slippage + commission
            sectors: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TradingConfig =
            serde_json::from_str(r#"{"kelly_fraction": 0.25, "regime_multipliers": {"volatile": 0.3}}"#)
                .unwrap();

        assert_eq!(config.kelly_fraction, 0.25);
        assert_eq!(config.regime_multipliers.for_regime(Regime::Volatile), 0.3);
        assert_eq!(config.regime_multipliers.for_regime(Regime::Trending), 1.0);
        assert_eq!(config.max_position_fraction, dec!(0.05));
    }

    #[test]
    fn test_sector_lookup_prefers_signal_tag() {
        let mut config = TradingConfig::default();
        config.sectors.insert("HDFCBANK".to_string(), "banking".to_string());

        assert_eq!(config.sector_for("HDFCBANK", None).as_deref(), Some("banking"));
        assert_eq!(config.sector_for("HDFCBANK", Some("finance")).as_deref(), Some("finance"));
        assert_eq!(config.sector_for("TCS", None), None);
    }

    #[test]
    fn test_multiplier_lookups() {
        let config: TradingConfig = serde_json::from_str(
            r#"{"horizon_multipliers": {"1": 1.2, "10": 0.8}, "sector_multipliers": {"realty": 0.75}}"#,
        )
        .unwrap();

        assert_eq!(config.horizon_multiplier(1), 1.2);
        assert_eq!(config.horizon_multiplier(5), 1.0);
        assert_eq!(config.sector_multiplier(Some("realty")), 0.75);
        assert_eq!(config.sector_multiplier(Some("pharma")), 1.0);
        assert_eq!(config.sector_multiplier(None), 1.0);

        let tiers = &config.confidence_tiers;
        assert_eq!(tiers.multiplier(0.8), 1.0);
        assert_eq!(tiers.multiplier(0.55), 0.7);
        assert_eq!(tiers.multiplier(0.2), 0.4);
    }
}
