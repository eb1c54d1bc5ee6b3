//! Pre-trade risk gate.
//!
//! Decides Accept or Reject for a sized candidate against the portfolio:
//! - Drawdown, loss-streak, daily-loss and monthly-loss kill switches
//! - One open position per instrument and direction
//! - Per-trade, position-count and aggregate exposure caps
//! - Sector concentration and rolling return correlation
//!
//! Deterministic for a given snapshot; no I/O. The loss-streak breaker
//! trips into a cooldown recorded on the portfolio state, which
//! [`RiskManager::refresh_breakers`] clears once it has run out.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsCalculator;
use crate::models::{Direction, PortfolioState, RiskSnapshot};

/// Portfolio-level risk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Maximum drawdown from the high-water mark before new entries stop (0-1)
    pub max_drawdown: Decimal,

    /// Aggregate open exposure cap as a fraction of equity
    pub max_portfolio_exposure: Decimal,

    pub max_open_positions: u32,

    pub max_positions_per_sector: u32,

    /// Direction-adjusted return correlation above which a candidate is refused
    pub max_correlation: f64,

    /// Closes loaded per instrument for correlation
    pub correlation_window: usize,

    /// Shared daily returns needed before correlation is trusted
    pub min_correlation_overlap: usize,

    /// Losing closes in a row that halt new entries
    pub max_consecutive_losses: u32,

    /// Hours new entries stay halted after the loss streak breaker trips
    pub loss_cooldown_hours: u32,

    /// Realized loss today, as a fraction of equity, that halts new entries
    pub max_daily_loss: Decimal,

    /// Realized loss this month, as a fraction of initial equity, that halts
    /// new entries
    pub max_monthly_loss: Decimal,

    /// New positions allowed per calendar day
    pub max_daily_entries: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown: dec!(0.20),           // 20% max DD
            max_portfolio_exposure: dec!(0.50), // 50% of equity deployed
            max_open_positions: 10,
            max_positions_per_sector: 2,
            max_correlation: 0.7,
            correlation_window: 20,
            min_correlation_overlap: 10,
            max_consecutive_losses: 5,
            loss_cooldown_hours: 24,       // Sit out the next session
            max_daily_loss: dec!(0.02),    // 2% of equity
            max_monthly_loss: dec!(0.05),  // 5% of initial equity
            max_daily_entries: 10,
        }
    }
}

/// An open position as seen by the risk gate.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenExposure {
    pub instrument: String,
    pub direction: Direction,
    pub sector: Option<String>,
    pub capital_at_risk: Decimal,
}

/// Everything the gate needs to know about the portfolio.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub state: PortfolioState,
    pub open: Vec<OpenExposure>,

    /// Positions opened on the current calendar day
    pub entries_today: u32,

    /// Net realized PnL of trades closed today, since any breaker reset
    pub realized_today: Decimal,

    /// Net realized PnL of trades closed this month, since any breaker reset
    pub realized_this_month: Decimal,

    /// Recent closes per instrument, sorted by date
    pub price_history: HashMap<String, Vec<(NaiveDate, f64)>>,
}

impl PortfolioSnapshot {
    pub fn new(state: PortfolioState) -> Self {
        Self {
            state,
            open: Vec::new(),
            entries_today: 0,
            realized_today: Decimal::ZERO,
            realized_this_month: Decimal::ZERO,
            price_history: HashMap::new(),
        }
    }

    /// Fold an accepted candidate in so later candidates in the same batch
    /// see it.
    pub fn record_accept(&mut self, exposure: OpenExposure, at: DateTime<Utc>) {
        self.state.apply_open(exposure.capital_at_risk, at);
        self.open.push(exposure);
        self.entries_today += 1;
    }

    pub fn has_open(&self, instrument: &str, direction: Direction) -> bool {
        self.open
            .iter()
            .any(|p| p.instrument == instrument && p.direction == direction)
    }
}

/// Why a candidate was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    DrawdownLimitExceeded { drawdown: Decimal, limit: Decimal },
    ConsecutiveLossLimit { losses: u32, limit: u32, until: Option<DateTime<Utc>> },
    DailyLossLimit { loss: Decimal, limit: Decimal },
    MonthlyLossLimit { loss: Decimal, limit: Decimal },
    DuplicatePosition { instrument: String, direction: Direction },
    PerTradeCapExceeded { capital_at_risk: Decimal, cap: Decimal },
    DailyEntryLimit { entries: u32, limit: u32 },
    PositionLimitExceeded { open: u32, limit: u32 },
    ExposureCapExceeded { exposure_after: Decimal, cap: Decimal },
    SectorLimitExceeded { sector: String, open: u32, limit: u32 },
    CorrelationLimitExceeded { instrument: String, correlation: f64, limit: f64 },
}

impl RejectReason {
    /// Stable reason code for logs and the ledger.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DrawdownLimitExceeded { .. } => "DrawdownLimitExceeded",
            Self::ConsecutiveLossLimit { .. } => "ConsecutiveLossLimit",
            Self::DailyLossLimit { .. } => "DailyLossLimit",
            Self::MonthlyLossLimit { .. } => "MonthlyLossLimit",
            Self::DuplicatePosition { .. } => "DuplicatePosition",
            Self::PerTradeCapExceeded { .. } => "PerTradeCapExceeded",
            Self::DailyEntryLimit { .. } => "DailyEntryLimit",
            Self::PositionLimitExceeded { .. } => "PositionLimitExceeded",
            Self::ExposureCapExceeded { .. } => "ExposureCapExceeded",
            Self::SectorLimitExceeded { .. } => "SectorLimitExceeded",
            Self::CorrelationLimitExceeded { .. } => "CorrelationLimitExceeded",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DrawdownLimitExceeded { drawdown, limit } => write!(
                f,
                "{}: drawdown {}% > {}%",
                self.code(),
                (drawdown * dec!(100)).round_dp(2),
                (limit * dec!(100)).round_dp(2)
            ),
            Self::ConsecutiveLossLimit { losses, limit, until } => {
                write!(f, "{}: {} losses in a row, limit {}", self.code(), losses, limit)?;
                if let Some(until) = until {
                    write!(f, ", halted until {}", until.to_rfc3339())?;
                }
                Ok(())
            }
            Self::DailyLossLimit { loss, limit } => {
                write!(f, "{}: lost {} today >= {}", self.code(), loss.round_dp(2), limit.round_dp(2))
            }
            Self::MonthlyLossLimit { loss, limit } => {
                write!(f, "{}: lost {} this month >= {}", self.code(), loss.round_dp(2), limit.round_dp(2))
            }
            Self::DuplicatePosition { instrument, direction } => {
                write!(f, "{}: {} {} already open", self.code(), instrument, direction)
            }
            Self::PerTradeCapExceeded { capital_at_risk, cap } => {
                write!(f, "{}: {} > {}", self.code(), capital_at_risk, cap)
            }
            Self::DailyEntryLimit { entries, limit } => {
                write!(f, "{}: {} entries today >= {}", self.code(), entries, limit)
            }
            Self::PositionLimitExceeded { open, limit } => {
                write!(f, "{}: {} open >= {}", self.code(), open, limit)
            }
            Self::ExposureCapExceeded { exposure_after, cap } => {
                write!(f, "{}: {} > {}", self.code(), exposure_after, cap)
            }
            Self::SectorLimitExceeded { sector, open, limit } => {
                write!(f, "{}: {} open in {} >= {}", self.code(), open, sector, limit)
            }
            Self::CorrelationLimitExceeded {
                instrument,
                correlation,
                limit,
            } => write!(
                f,
                "{}: {:.2} with {} > {:.2}",
                self.code(),
                correlation,
                instrument,
                limit
            ),
        }
    }
}

/// Outcome of the risk gate.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Accept(RiskSnapshot),
    Reject(RejectReason),
}

/// Change made to the loss streak breaker by [`RiskManager::refresh_breakers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerChange {
    Tripped { until: DateTime<Utc> },
    CooledDown,
}

/// A sized candidate presented to the gate.
#[derive(Debug, Clone, Copy)]
pub struct RiskCandidate<'a> {
    pub instrument: &'a str,
    pub direction: Direction,
    pub sector: Option<&'a str>,
    pub capital_at_risk: Decimal,
}

/// Portfolio risk gate.
pub struct RiskManager {
    config: RiskConfig,
    per_trade_cap: Decimal,
}

impl RiskManager {
    /// `per_trade_cap` is the max fraction of equity one position may commit.
    pub fn new(config: RiskConfig, per_trade_cap: Decimal) -> Self {
        Self {
            config,
            per_trade_cap,
        }
    }

    /// Trip the loss streak breaker, or clear it once its cooldown has run
    /// out. Call before evaluating a batch.
    pub fn refresh_breakers(&self, state: &mut PortfolioState, at: DateTime<Utc>) -> Option<BreakerChange> {
        if let Some(until) = state.halted_until {
            if at < until {
                return None;
            }
            // The streak starts over after the cooldown
            state.consecutive_losses = 0;
            state.halted_until = None;
            state.breakers_reset_at = Some(until);
            state.updated_at = at;
            return Some(BreakerChange::CooledDown);
        }

        let limit = self.config.max_consecutive_losses;
        if limit == 0 || state.consecutive_losses < limit {
            return None;
        }

        let until = Duration::try_hours(i64::from(self.config.loss_cooldown_hours))
            .and_then(|cooldown| at.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.halted_until = Some(until);
        state.updated_at = at;
        Some(BreakerChange::Tripped { until })
    }

    /// Accept or reject a candidate. Checks run in a fixed order so the same
    /// snapshot always yields the same reason.
    pub fn evaluate(
        &self,
        candidate: &RiskCandidate<'_>,
        snapshot: &PortfolioSnapshot,
        at: DateTime<Utc>,
    ) -> RiskDecision {
        let state = &snapshot.state;

        let drawdown = state.drawdown();
        if drawdown > self.config.max_drawdown {
            return RiskDecision::Reject(RejectReason::DrawdownLimitExceeded {
                drawdown,
                limit: self.config.max_drawdown,
            });
        }

        let limit = self.config.max_consecutive_losses;
        let halted_until = state.halted_until.filter(|until| at < *until);
        if halted_until.is_some() || (limit > 0 && state.consecutive_losses >= limit) {
            return RiskDecision::Reject(RejectReason::ConsecutiveLossLimit {
                losses: state.consecutive_losses,
                limit,
                until: halted_until,
            });
        }

        let daily_limit = state.equity * self.config.max_daily_loss;
        if let Some(loss) = breached(snapshot.realized_today, daily_limit) {
            return RiskDecision::Reject(RejectReason::DailyLossLimit {
                loss,
                limit: daily_limit,
            });
        }

        let monthly_limit = state.initial_equity * self.config.max_monthly_loss;
        if let Some(loss) = breached(snapshot.realized_this_month, monthly_limit) {
            return RiskDecision::Reject(RejectReason::MonthlyLossLimit {
                loss,
                limit: monthly_limit,
            });
        }

        if snapshot.has_open(candidate.instrument, candidate.direction) {
            return RiskDecision::Reject(RejectReason::DuplicatePosition {
                instrument: candidate.instrument.to_string(),
                direction: candidate.direction,
            });
        }

        let per_trade_cap = state.equity * self.per_trade_cap;
        if candidate.capital_at_risk > per_trade_cap {
            return RiskDecision::Reject(RejectReason::PerTradeCapExceeded {
                capital_at_risk: candidate.capital_at_risk,
                cap: per_trade_cap,
            });
        }

        if snapshot.entries_today >= self.config.max_daily_entries {
            return RiskDecision::Reject(RejectReason::DailyEntryLimit {
                entries: snapshot.entries_today,
                limit: self.config.max_daily_entries,
            });
        }

        let open_count = snapshot.open.len() as u32;
        if open_count >= self.config.max_open_positions {
            return RiskDecision::Reject(RejectReason::PositionLimitExceeded {
                open: open_count,
                limit: self.config.max_open_positions,
            });
        }

        let exposure_after = state.open_exposure + candidate.capital_at_risk;
        let exposure_cap = state.equity * self.config.max_portfolio_exposure;
        if exposure_after > exposure_cap {
            return RiskDecision::Reject(RejectReason::ExposureCapExceeded {
                exposure_after,
                cap: exposure_cap,
            });
        }

        let sector_positions = match candidate.sector {
            Some(sector) => {
                let count = snapshot
                    .open
                    .iter()
                    .filter(|p| p.sector.as_deref() == Some(sector))
                    .count() as u32;
                if count >= self.config.max_positions_per_sector {
                    return RiskDecision::Reject(RejectReason::SectorLimitExceeded {
                        sector: sector.to_string(),
                        open: count,
                        limit: self.config.max_positions_per_sector,
                    });
                }
                count
            }
            None => 0,
        };

        let max_correlation = self.max_correlation(candidate, snapshot);
        if let Some((instrument, correlation)) = &max_correlation {
            if *correlation > self.config.max_correlation {
                return RiskDecision::Reject(RejectReason::CorrelationLimitExceeded {
                    instrument: instrument.clone(),
                    correlation: *correlation,
                    limit: self.config.max_correlation,
                });
            }
        }

        RiskDecision::Accept(RiskSnapshot {
            equity: state.equity,
            high_water_mark: state.high_water_mark,
            drawdown,
            open_exposure: state.open_exposure,
            open_positions: open_count,
            max_correlation: max_correlation.map(|(_, c)| c),
            sector_positions,
            evaluated_at: at,
        })
    }

    /// Highest direction-adjusted correlation against open positions in
    /// other instruments. Opposite directions count as a hedge.
    fn max_correlation(
        &self,
        candidate: &RiskCandidate<'_>,
        snapshot: &PortfolioSnapshot,
    ) -> Option<(String, f64)> {
        let own = snapshot.price_history.get(candidate.instrument)?;

        let mut best: Option<(String, f64)> = None;
        for open in &snapshot.open {
            if open.instrument == candidate.instrument {
                continue;
            }
            let Some(other) = snapshot.price_history.get(&open.instrument) else {
                continue;
            };
            let Some(corr) =
                MetricsCalculator::correlation(own, other, self.config.min_correlation_overlap)
            else {
                continue;
            };

            let adjusted = if open.direction == candidate.direction {
                corr
            } else {
                -corr
            };
            if best.as_ref().map_or(true, |(_, b)| adjusted > *b) {
                best = Some((open.instrument.clone(), adjusted));
            }
        }

        best
    }
}

/// Loss in a window when it reaches a positive limit. A zero limit disables
/// the check.
fn breached(realized: Decimal, limit: Decimal) -> Option<Decimal> {
    let loss = -realized;
    (limit > Decimal::ZERO && loss > Decimal::ZERO && loss >= limit).then_some(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_portfolio(equity: Decimal, hwm: Decimal) -> PortfolioSnapshot {
        let mut state = PortfolioState::new(hwm);
        state.equity = equity;
        PortfolioSnapshot::new(state)
    }

    fn candidate(instrument: &str, capital: Decimal) -> RiskCandidate<'_> {
        RiskCandidate {
            instrument,
            direction: Direction::Long,
            sector: None,
            capital_at_risk: capital,
        }
    }

    fn open(instrument: &str, direction: Direction, sector: Option<&str>, capital: Decimal) -> OpenExposure {
        OpenExposure {
            instrument: instrument.to_string(),
            direction,
            sector: sector.map(str::to_string),
            capital_at_risk: capital,
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default(), dec!(0.05))
    }

    fn trending(start: NaiveDate, n: usize, seed: f64) -> Vec<(NaiveDate, f64)> {
        (0..n)
            .map(|i| {
                let wiggle = if i % 2 == 0 { seed } else { -seed * 0.5 };
                (start + chrono::Duration::days(i as i64), 100.0 + i as f64 + wiggle)
            })
            .collect()
    }

    #[test]
    fn test_drawdown_limit() {
        let snapshot = make_portfolio(dec!(78000), dec!(100000));
        let decision = manager().evaluate(&candidate("TCS", dec!(1000)), &snapshot, Utc::now());

        match decision {
            RiskDecision::Reject(reason) => {
                assert_eq!(reason.code(), "DrawdownLimitExceeded");
                assert!(reason.to_string().contains("22"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_drawdown_at_limit_still_accepts() {
        let snapshot = make_portfolio(dec!(80000), dec!(100000));
        let decision = manager().evaluate(&candidate("TCS", dec!(1000)), &snapshot, Utc::now());
        assert!(matches!(decision, RiskDecision::Accept(_)));
    }

    #[test]
    fn test_duplicate_open_rejected() {
        let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
        snapshot.open.push(open("TCS", Direction::Long, None, dec!(1000)));

        let decision = manager().evaluate(&candidate("TCS", dec!(1000)), &snapshot, Utc::now());
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::DuplicatePosition { .. })
        ));

        let short = RiskCandidate {
            direction: Direction::Short,
            ..candidate("TCS", dec!(1000))
        };
        assert!(matches!(
            manager().evaluate(&short, &snapshot, Utc::now()),
            RiskDecision::Accept(_)
        ));
    }

    #[test]
    fn test_exposure_cap() {
        let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
        snapshot.state.open_exposure = dec!(47000);

        let decision = manager().evaluate(&candidate("INFY", dec!(4000)), &snapshot, Utc::now());
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::ExposureCapExceeded { .. })
        ));
    }

    #[test]
    fn test_sector_limit() {
        let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
        snapshot.open.push(open("HDFCBANK", Direction::Long, Some("banking"), dec!(1000)));
        snapshot.open.push(open("ICICIBANK", Direction::Long, Some("banking"), dec!(1000)));

        let mut c = candidate("SBIN", dec!(1000));
        c.sector = Some("banking");
        let decision = manager().evaluate(&c, &snapshot, Utc::now());
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::SectorLimitExceeded { open: 2, .. })
        ));
    }

    #[test]
    fn test_correlated_candidate_rejected_but_hedge_allowed() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
        snapshot.open.push(open("HDFCBANK", Direction::Long, None, dec!(1000)));
        snapshot.price_history.insert("HDFCBANK".to_string(), trending(start, 20, 2.0));
        snapshot.price_history.insert("ICICIBANK".to_string(), trending(start, 20, 2.1));

        let decision = manager().evaluate(&candidate("ICICIBANK", dec!(1000)), &snapshot, Utc::now());
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::CorrelationLimitExceeded { .. })
        ));

        let hedge = RiskCandidate {
            direction: Direction::Short,
            ..candidate("ICICIBANK", dec!(1000))
        };
        match manager().evaluate(&hedge, &snapshot, Utc::now()) {
            RiskDecision::Accept(snap) => assert!(snap.max_correlation.unwrap() < 0.0),
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn test_accept_snapshot_is_deterministic() {
        let mut snapshot = make_portfolio(dec!(95000), dec!(100000));
        snapshot.state.open_exposure = dec!(3000);
        snapshot.open.push(open("WIPRO", Direction::Long, None, dec!(3000)));
        let at = Utc::now();

        let first = manager().evaluate(&candidate("TCS", dec!(2000)), &snapshot, at);
        let second = manager().evaluate(&candidate("TCS", dec!(2000)), &snapshot, at);
        assert_eq!(first, second);

        let RiskDecision::Accept(snap) = first else {
            panic!("expected acceptance");
        };
        assert_eq!(snap.drawdown, dec!(0.05));
        assert_eq!(snap.open_exposure, dec!(3000));
        assert_eq!(snap.open_positions, 1);
    }

    #[test]
    fn test_loss_streak_halts_entries() {
        let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
        snapshot.state.consecutive_losses = 5;

        let decision = manager().evaluate(&candidate("TCS", dec!(1000)), &snapshot, Utc::now());
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::ConsecutiveLossLimit { .. })
        ));
    }

    #[test]
    fn test_loss_streak_cooldown_trips_then_clears() {
        let manager = manager();
        let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
        snapshot.state.consecutive_losses = 5;
        let at = Utc::now();

        let change = manager.refresh_breakers(&mut snapshot.state, at);
        assert_eq!(change, Some(BreakerChange::Tripped { until: at + Duration::hours(24) }));

        // A win inside the cooldown does not lift it
        snapshot.state.consecutive_losses = 0;
        let later = at + Duration::hours(3);
        assert_eq!(manager.refresh_breakers(&mut snapshot.state, later), None);
        match manager.evaluate(&candidate("TCS", dec!(1000)), &snapshot, later) {
            RiskDecision::Reject(reason @ RejectReason::ConsecutiveLossLimit { until: Some(_), .. }) => {
                assert!(reason.to_string().contains("halted until"));
            }
            other => panic!("expected a cooldown rejection, got {other:?}"),
        }

        let next_day = at + Duration::hours(25);
        assert_eq!(
            manager.refresh_breakers(&mut snapshot.state, next_day),
            Some(BreakerChange::CooledDown)
        );
        assert_eq!(snapshot.state.halted_until, None);
        assert_eq!(snapshot.state.breakers_reset_at, Some(at + Duration::hours(24)));
        assert!(matches!(
            manager.evaluate(&candidate("TCS", dec!(1000)), &snapshot, next_day),
            RiskDecision::Accept(_)
        ));
    }

    #[test]
    fn test_daily_and_monthly_loss_limits() {
        let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
        let at = Utc::now();

        // 2% of 100k today
        snapshot.realized_today = dec!(-2000);
        snapshot.realized_this_month = dec!(-2000);
        match manager().evaluate(&candidate("TCS", dec!(1000)), &snapshot, at) {
            RiskDecision::Reject(RejectReason::DailyLossLimit { loss, limit }) => {
                assert_eq!(loss, dec!(2000));
                assert_eq!(limit, dec!(2000));
            }
            other => panic!("expected a daily loss rejection, got {other:?}"),
        }

        // A quiet day in a bad month
        snapshot.realized_today = dec!(-100);
        snapshot.realized_this_month = dec!(-5000);
        assert!(matches!(
            manager().evaluate(&candidate("TCS", dec!(1000)), &snapshot, at),
            RiskDecision::Reject(RejectReason::MonthlyLossLimit { .. })
        ));

        snapshot.realized_this_month = dec!(-4999);
        assert!(matches!(
            manager().evaluate(&candidate("TCS", dec!(1000)), &snapshot, at),
            RiskDecision::Accept(_)
        ));

        let disabled = RiskManager::new(
            RiskConfig {
                max_monthly_loss: Decimal::ZERO,
                ..RiskConfig::default()
            },
            dec!(0.05),
        );
        snapshot.realized_this_month = dec!(-50000);
        assert!(matches!(
            disabled.evaluate(&candidate("TCS", dec!(1000)), &snapshot, at),
            RiskDecision::Accept(_)
        ));
    }

    proptest! {
        #[test]
        fn prop_exposure_never_exceeds_cap(
            sizes in proptest::collection::vec(1u32..5_000, 1..40),
            instruments in proptest::collection::vec(0usize..15, 1..40),
        ) {
            let config = RiskConfig {
                max_open_positions: 100,
                max_daily_entries: 100,
                ..RiskConfig::default()
            };
            let cap_fraction = config.max_portfolio_exposure;
            let manager = RiskManager::new(config, dec!(0.05));
            let mut snapshot = make_portfolio(dec!(100000), dec!(100000));
            let at = Utc::now();

            for (size, idx) in sizes.iter().zip(instruments.iter()) {
                let instrument = format!("SYM{idx}");
                let c = candidate(&instrument, Decimal::from(*size));
                if let RiskDecision::Accept(_) = manager.evaluate(&c, &snapshot, at) {
                    snapshot.record_accept(
                        open(&instrument, Direction::Long, None, c.capital_at_risk),
                        at,
                    );
                }
                prop_assert!(snapshot.state.open_exposure <= snapshot.state.equity * cap_fraction);
            }

            let mut seen = std::collections::HashSet::new();
            for p in &snapshot.open {
                prop_assert!(seen.insert((p.instrument.clone(), p.direction)));
            }
        }
    }
}
