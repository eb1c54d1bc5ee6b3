//! Portfolio accounting state and the risk snapshot stored with each entry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Running portfolio accounting.
///
/// Equity is realized-only: initial equity plus realized PnL of every closed
/// or expired position. Exposure is the capital committed to open positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub initial_equity: Decimal,
    pub equity: Decimal,
    pub high_water_mark: Decimal,
    pub open_exposure: Decimal,
    pub open_positions: u32,
    pub realized_pnl: Decimal,

    /// Losing closes since the last winning close or breaker reset
    pub consecutive_losses: u32,

    /// End of the cooldown after the loss streak breaker tripped
    pub halted_until: Option<DateTime<Utc>>,

    /// Last breaker reset; earlier losses count toward no limit
    pub breakers_reset_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl PortfolioState {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            initial_equity,
            equity: initial_equity,
            high_water_mark: initial_equity,
            open_exposure: Decimal::ZERO,
            open_positions: 0,
            realized_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            halted_until: None,
            breakers_reset_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Drawdown from the high-water mark as a fraction (0.22 = 22%).
    pub fn drawdown(&self) -> Decimal {
        if self.high_water_mark <= Decimal::ZERO || self.equity >= self.high_water_mark {
            return Decimal::ZERO;
        }
        (self.high_water_mark - self.equity) / self.high_water_mark
    }

    /// Account for a newly opened position.
    pub fn apply_open(&mut self, capital_at_risk: Decimal, at: DateTime<Utc>) {
        self.open_exposure += capital_at_risk;
        self.open_positions += 1;
        self.updated_at = at;
    }

    /// Account for a position leaving the book with its realized PnL.
    pub fn apply_close(&mut self, capital_at_risk: Decimal, realized_pnl: Decimal, at: DateTime<Utc>) {
        self.open_exposure = (self.open_exposure - capital_at_risk).max(Decimal::ZERO);
        self.open_positions = self.open_positions.saturating_sub(1);
        self.realized_pnl += realized_pnl;
        self.equity += realized_pnl;
        if self.equity > self.high_water_mark {
            self.high_water_mark = self.equity;
        }
        if realized_pnl < Decimal::ZERO {
            self.consecutive_losses += 1;
        } else if realized_pnl > Decimal::ZERO {
            self.consecutive_losses = 0;
        }
        self.updated_at = at;
    }

    /// Whether the loss streak cooldown is still running at `at`.
    pub fn is_halted(&self, at: DateTime<Utc>) -> bool {
        self.halted_until.is_some_and(|until| at < until)
    }

    /// Clear the loss streak and any cooldown. Losses closed up to `at`
    /// stop counting toward the streak and the loss windows.
    pub fn reset_breakers(&mut self, at: DateTime<Utc>) {
        self.consecutive_losses = 0;
        self.halted_until = None;
        self.breakers_reset_at = Some(at);
        self.updated_at = at;
    }
}

/// Portfolio facts the risk gate looked at when it accepted a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub equity: Decimal,
    pub high_water_mark: Decimal,
    pub drawdown: Decimal,

    /// Exposure before this position was added
    pub open_exposure: Decimal,
    pub open_positions: u32,

    /// Highest return correlation against open positions, if measurable
    #[serde(default)]
    pub max_correlation: Option<f64>,

    /// Open positions sharing the candidate's sector
    #[serde(default)]
    pub sector_positions: u32,

    pub evaluated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_drawdown_tracks_high_water_mark() {
        let now = Utc::now();
        let mut state = PortfolioState::new(dec!(100000));

        state.apply_open(dec!(5000), now);
        state.apply_close(dec!(5000), dec!(10000), now);
        assert_eq!(state.high_water_mark, dec!(110000));
        assert_eq!(state.drawdown(), Decimal::ZERO);

        state.apply_open(dec!(5000), now);
        state.apply_close(dec!(5000), dec!(-24200), now);
        assert_eq!(state.equity, dec!(85800));
        assert_eq!(state.drawdown(), dec!(0.22));
        assert_eq!(state.open_exposure, Decimal::ZERO);
        assert_eq!(state.consecutive_losses, 1);
    }

    #[test]
    fn test_win_resets_loss_streak() {
        let now = Utc::now();
        let mut state = PortfolioState::new(dec!(1000));
        state.apply_close(Decimal::ZERO, dec!(-1), now);
        state.apply_close(Decimal::ZERO, dec!(-1), now);
        assert_eq!(state.consecutive_losses, 2);

        state.apply_close(Decimal::ZERO, dec!(3), now);
        assert_eq!(state.consecutive_losses, 0);
    }

    #[test]
    fn test_reset_clears_streak_and_cooldown() {
        let now = Utc::now();
        let mut state = PortfolioState::new(dec!(1000));
        state.apply_close(Decimal::ZERO, dec!(-1), now);
        state.halted_until = Some(now + chrono::Duration::hours(1));
        assert!(state.is_halted(now));

        state.reset_breakers(now);
        assert!(!state.is_halted(now));
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.breakers_reset_at, Some(now));
        assert_eq!(state.equity, dec!(999));
    }
}
