//! Kelly-criterion position sizing with regime, confidence, horizon and
//! sector scaling, then per-trade caps.

use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::{PatternStats, Signal};
use super::TradingConfig;

/// Why a signal sized to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingReason {
    /// Edge is zero or negative for the pattern's statistics
    NonPositiveKelly,
    /// Regime multiplier is zero
    RegimeHalt,
    /// Allocation rounds to nothing or falls under the minimum position
    BelowMinimumSize,
}

impl SizingReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NonPositiveKelly => "NonPositiveKelly",
            Self::RegimeHalt => "RegimeHalt",
            Self::BelowMinimumSize => "BelowMinimumSize",
        }
    }
}

impl fmt::Display for SizingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SizingCollapsed:{}", self.code())
    }
}

/// Where the win-rate and win/loss ratio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSource {
    Ledger,
    Signal,
    Default,
}

impl StatsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ledger => "ledger",
            Self::Signal => "signal",
            Self::Default => "default",
        }
    }
}

/// Statistics fed to the Kelly formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingStats {
    pub win_rate: f64,
    pub win_loss_ratio: f64,
    pub source: StatsSource,
}

/// A signal with a non-zero allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedCandidate {
    pub quantity: Decimal,
    pub capital_at_risk: Decimal,

    /// Raw Kelly fraction before scaling and caps
    pub kelly: f64,

    /// Fraction of equity after Kelly scaling, clamp and every multiplier
    pub fraction: f64,

    pub regime_multiplier: f64,

    /// Product of the confidence, horizon and sector multipliers
    pub adjustment: f64,
}

/// Result of sizing one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingOutcome {
    Sized(SizedCandidate),
    Collapsed { reason: SizingReason, kelly: f64 },
}

/// Calculator for position sizes. Pure: no I/O, no clock.
pub struct PositionSizer {
    config: TradingConfig,
}

impl PositionSizer {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Pick the statistics to size with.
    ///
    /// Learned ledger stats win once they cover `min_trades_for_stats`
    /// trades, then the producer's priors on the signal, then configured
    /// priors.
    pub fn resolve_stats(&self, signal: &Signal, learned: Option<&PatternStats>) -> SizingStats {
        if let Some(stats) = learned {
            if stats.trade_count >= self.config.min_trades_for_stats {
                return SizingStats {
                    win_rate: stats.win_rate,
                    win_loss_ratio: stats.win_loss_ratio,
                    source: StatsSource::Ledger,
                };
            }
        }

        if let (Some(win_rate), Some(ratio)) = (signal.prior_win_rate, signal.prior_win_loss_ratio) {
            return SizingStats {
                win_rate,
                win_loss_ratio: ratio,
                source: StatsSource::Signal,
            };
        }

        SizingStats {
            win_rate: self.config.prior_win_rate,
            win_loss_ratio: self.config.prior_win_loss_ratio,
            source: StatsSource::Default,
        }
    }

    /// Kelly criterion.
    ///
    /// f* = (p * b - q) / b
    /// where:
    ///   p = probability of winning (win rate)
    ///   q = probability of losing (1 - p)
    ///   b = ratio of average win to average loss
    pub fn kelly(win_rate: f64, win_loss_ratio: f64) -> f64 {
        if win_loss_ratio <= 0.0 || !win_loss_ratio.is_finite() || !win_rate.is_finite() {
            return 0.0;
        }
        (win_rate * win_loss_ratio - (1.0 - win_rate)) / win_loss_ratio
    }

    /// Size a validated signal against current equity.
    pub fn size(&self, signal: &Signal, equity: Decimal, stats: &SizingStats) -> SizingOutcome {
        let kelly = Self::kelly(stats.win_rate, stats.win_loss_ratio);
        if kelly <= 0.0 {
            return SizingOutcome::Collapsed {
                reason: SizingReason::NonPositiveKelly,
                kelly,
            };
        }

        let regime_multiplier = self.config.regime_multipliers.for_regime(signal.regime);
        if regime_multiplier <= 0.0 {
            return SizingOutcome::Collapsed {
                reason: SizingReason::RegimeHalt,
                kelly,
            };
        }

        if equity <= Decimal::ZERO || signal.entry_price <= Decimal::ZERO {
            return SizingOutcome::Collapsed {
                reason: SizingReason::BelowMinimumSize,
                kelly,
            };
        }

        let adjustment = self.adjustment(signal);
        let f_max = self.config.max_position_fraction.to_f64().unwrap_or(0.0);
        let fraction =
            (kelly * self.config.kelly_fraction).clamp(0.0, f_max) * regime_multiplier * adjustment;

        let allocation = equity * Decimal::try_from(fraction).unwrap_or(Decimal::ZERO);
        let allocation = self.apply_constraints(allocation, equity, signal);

        let mut quantity = allocation / signal.entry_price;
        if self.config.whole_units {
            quantity = quantity.floor();
        }
        let capital_at_risk = quantity * signal.entry_price;

        if quantity <= Decimal::ZERO
            || capital_at_risk < equity * self.config.min_position_fraction
        {
            return SizingOutcome::Collapsed {
                reason: SizingReason::BelowMinimumSize,
                kelly,
            };
        }

        SizingOutcome::Sized(SizedCandidate {
            quantity,
            capital_at_risk,
            kelly,
            fraction,
            regime_multiplier,
            adjustment,
        })
    }

    /// Confidence band, holding horizon and sector volatility scaling.
    fn adjustment(&self, signal: &Signal) -> f64 {
        let config = &self.config;
        let horizon = signal.horizon_days.unwrap_or(config.default_horizon_days);
        let sector = config.sector_for(&signal.instrument, signal.sector.as_deref());

        config.confidence_tiers.multiplier(signal.confidence)
            * config.horizon_multiplier(horizon)
            * config.sector_multiplier(sector.as_deref())
    }

    /// Apply per-trade caps to a raw allocation.
    fn apply_constraints(&self, allocation: Decimal, equity: Decimal, signal: &Signal) -> Decimal {
        // Max single position constraint
        let mut capped = allocation.min(equity * self.config.max_position_fraction);

        // Loss at the stop must stay within max risk per trade
        let stop_fraction = signal.stop_distance() / signal.entry_price;
        if stop_fraction > Decimal::ZERO {
            let max_by_risk = equity * self.config.max_risk_per_trade / stop_fraction;
            capped = capped.min(max_by_risk);
        }

        capped.max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Regime};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn make_signal(entry: Decimal, stop: Decimal, regime: Regime) -> Signal {
        Signal {
            instrument: "RELIANCE".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 15, 30, 0).unwrap(),
            direction: Direction::Long,
            pattern_id: "hammer".to_string(),
            confidence: 0.7,
            entry_price: entry,
            stop_loss: stop,
            target: entry * dec!(1.1),
            regime,
            sector: None,
            horizon_days: None,
            prior_win_rate: None,
            prior_win_loss_ratio: None,
        }
    }

    fn stats(win_rate: f64, ratio: f64) -> SizingStats {
        SizingStats {
            win_rate,
            win_loss_ratio: ratio,
            source: StatsSource::Ledger,
        }
    }

    #[test]
    fn test_kelly_clamped_to_max_fraction() {
        let sizer = PositionSizer::new(TradingConfig::default());
        let signal = make_signal(dec!(100), dec!(95), Regime::Trending);

        let outcome = sizer.size(&signal, dec!(100000), &stats(0.55, 1.5));

        let SizingOutcome::Sized(sized) = outcome else {
            panic!("expected a sized candidate, got {outcome:?}");
        };
        assert!((sized.kelly - 0.25).abs() < 1e-9);
        assert_eq!(sized.capital_at_risk, dec!(5000));
        assert_eq!(sized.quantity, dec!(50));
    }

    #[test]
    fn test_non_positive_kelly_collapses() {
        let sizer = PositionSizer::new(TradingConfig::default());
        let signal = make_signal(dec!(100), dec!(95), Regime::Trending);

        let outcome = sizer.size(&signal, dec!(100000), &stats(0.40, 1.0));
        assert!(matches!(
            outcome,
            SizingOutcome::Collapsed { reason: SizingReason::NonPositiveKelly, .. }
        ));
    }

    #[test]
    fn test_crisis_regime_halts() {
        let sizer = PositionSizer::new(TradingConfig::default());
        let signal = make_signal(dec!(100), dec!(95), Regime::Crisis);

        let outcome = sizer.size(&signal, dec!(100000), &stats(0.6, 2.0));
        assert!(matches!(
            outcome,
            SizingOutcome::Collapsed { reason: SizingReason::RegimeHalt, .. }
        ));
    }

    #[test]
    fn test_regime_scales_after_clamp() {
        let sizer = PositionSizer::new(TradingConfig::default());
        let signal = make_signal(dec!(100), dec!(95), Regime::Volatile);

        let SizingOutcome::Sized(sized) = sizer.size(&signal, dec!(100000), &stats(0.55, 1.5)) else {
            panic!("expected a sized candidate");
        };
        assert_eq!(sized.capital_at_risk, dec!(2500));
    }

    #[test]
    fn test_confidence_horizon_and_sector_scale_size() {
        let mut config = TradingConfig::default();
        config.horizon_multipliers.insert(10, 0.8);
        config.sector_multipliers.insert("realty".to_string(), 0.75);
        config.sectors.insert("DLF".to_string(), "realty".to_string());
        config.whole_units = false;
        let sizer = PositionSizer::new(config);

        // Medium band: 5% clamp * 0.7
        let mut signal = make_signal(dec!(100), dec!(95), Regime::Trending);
        signal.confidence = 0.5;
        let SizingOutcome::Sized(sized) = sizer.size(&signal, dec!(100000), &stats(0.55, 1.5)) else {
            panic!("expected a sized candidate");
        };
        assert!((sized.capital_at_risk - dec!(3500)).abs() < dec!(0.01));

        // High band, 10 day horizon, realty from the sector table: 5% * 0.8 * 0.75
        signal.confidence = 0.9;
        signal.horizon_days = Some(10);
        signal.instrument = "DLF".to_string();
        let SizingOutcome::Sized(sized) = sizer.size(&signal, dec!(100000), &stats(0.55, 1.5)) else {
            panic!("expected a sized candidate");
        };
        assert!((sized.adjustment - 0.6).abs() < 1e-9);
        assert!((sized.capital_at_risk - dec!(3000)).abs() < dec!(0.01));
    }

    #[test]
    fn test_wide_stop_shrinks_allocation() {
        let sizer = PositionSizer::new(TradingConfig::default());
        // 50% stop: 2% of 100k at risk allows only 4,000 of capital
        let signal = make_signal(dec!(100), dec!(50), Regime::Trending);

        let SizingOutcome::Sized(sized) = sizer.size(&signal, dec!(100000), &stats(0.55, 1.5)) else {
            panic!("expected a sized candidate");
        };
        assert_eq!(sized.capital_at_risk, dec!(4000));
    }

    #[test]
    fn test_expensive_instrument_below_minimum() {
        let sizer = PositionSizer::new(TradingConfig::default());
        let signal = make_signal(dec!(9000), dec!(8900), Regime::Trending);

        // 5% of 10k buys zero whole units at 9,000
        let outcome = sizer.size(&signal, dec!(10000), &stats(0.55, 1.5));
        assert!(matches!(
            outcome,
            SizingOutcome::Collapsed { reason: SizingReason::BelowMinimumSize, .. }
        ));
    }

    #[test]
    fn test_stats_precedence() {
        let sizer = PositionSizer::new(TradingConfig::default());
        let mut signal = make_signal(dec!(100), dec!(95), Regime::Trending);

        let thin = PatternStats {
            trade_count: 2,
            ..PatternStats::prior("hammer", 0.9, 3.0)
        };
        assert_eq!(sizer.resolve_stats(&signal, Some(&thin)).source, StatsSource::Default);

        signal.prior_win_rate = Some(0.6);
        signal.prior_win_loss_ratio = Some(1.8);
        let resolved = sizer.resolve_stats(&signal, Some(&thin));
        assert_eq!(resolved.source, StatsSource::Signal);
        assert_eq!(resolved.win_rate, 0.6);

        let learned = PatternStats {
            trade_count: 12,
            ..PatternStats::prior("hammer", 0.58, 1.4)
        };
        let resolved = sizer.resolve_stats(&signal, Some(&learned));
        assert_eq!(resolved.source, StatsSource::Ledger);
        assert_eq!(resolved.win_loss_ratio, 1.4);
    }

    proptest! {
        #[test]
        fn prop_capital_at_risk_within_cap(
            win_rate in 0.0f64..1.0,
            ratio in 0.1f64..10.0,
            equity in 1_000u32..10_000_000,
            entry in 1u32..5_000,
            stop_pct in 1u32..60,
        ) {
            let config = TradingConfig::default();
            let cap_fraction = config.max_position_fraction;
            let sizer = PositionSizer::new(config);

            let entry = Decimal::from(entry);
            let stop = entry - entry * Decimal::from(stop_pct) / dec!(100);
            let signal = make_signal(entry, stop, Regime::Trending);
            let equity = Decimal::from(equity);

            if let SizingOutcome::Sized(sized) = sizer.size(&signal, equity, &stats(win_rate, ratio)) {
                prop_assert!(sized.capital_at_risk > Decimal::ZERO);
                prop_assert!(sized.capital_at_risk <= equity * cap_fraction);
            }
        }
    }
}
