//! Paper position and its lifecycle status.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Direction, Regime, RiskSnapshot, Signal};

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Expired,
    Rejected,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "expired" => Some(Self::Expired),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Expired | Self::Rejected)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an open position was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    Target,
    Expiry,
    ManualClose,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "StopLoss",
            Self::Target => "Target",
            Self::Expiry => "Expiry",
            Self::ManualClose => "ManualClose",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "StopLoss" => Some(Self::StopLoss),
            "Target" => Some(Self::Target),
            "Expiry" => Some(Self::Expiry),
            "ManualClose" => Some(Self::ManualClose),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A paper position as tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Ledger row id (0 until persisted)
    pub id: i64,

    /// Stable key of the originating signal
    pub signal_key: String,

    pub instrument: String,
    pub direction: Direction,
    pub pattern_id: String,
    pub regime: Regime,

    #[serde(default)]
    pub sector: Option<String>,

    /// Sized quantity in whole or fractional units
    pub quantity: Decimal,

    /// Capital committed at entry (quantity * entry price)
    pub capital_at_risk: Decimal,

    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,

    pub stop_loss: Decimal,
    pub target: Decimal,

    /// Holding deadline; reaching it without an exit level expires the position
    pub expires_at: DateTime<Utc>,

    pub status: PositionStatus,

    /// Reason code of the last transition
    #[serde(default)]
    pub reason: Option<String>,

    /// Portfolio snapshot captured when the position was accepted
    #[serde(default)]
    pub risk_snapshot: Option<RiskSnapshot>,

    /// Optimistic concurrency counter, bumped on every transition
    pub version: i64,
}

impl Position {
    /// Build a pending position from a signal and its sized allocation.
    pub fn pending(
        signal: &Signal,
        quantity: Decimal,
        capital_at_risk: Decimal,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            signal_key: signal.key(),
            instrument: signal.instrument.clone(),
            direction: signal.direction,
            pattern_id: signal.pattern_id.clone(),
            regime: signal.regime,
            sector: signal.sector.clone(),
            quantity,
            capital_at_risk,
            entry_price: signal.entry_price,
            entry_time: signal.timestamp,
            stop_loss: signal.stop_loss,
            target: signal.target,
            expires_at,
            status: PositionStatus::Pending,
            reason: None,
            risk_snapshot: None,
            version: 0,
        }
    }

    /// Direction-aware gross PnL if exited at `exit_price`.
    pub fn gross_pnl(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.quantity * self.direction.sign()
    }

    /// Loss if the stop-loss level fills.
    pub fn loss_at_stop(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs() * self.quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn make_position(direction: Direction) -> Position {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 15, 30, 0).unwrap();
        let (stop, target) = match direction {
            Direction::Long => (dec!(95), dec!(110)),
            Direction::Short => (dec!(105), dec!(90)),
        };
        Position {
            id: 1,
            signal_key: "k".to_string(),
            instrument: "INFY".to_string(),
            direction,
            pattern_id: "hammer".to_string(),
            regime: Regime::Trending,
            sector: None,
            quantity: dec!(10),
            capital_at_risk: dec!(1000),
            entry_price: dec!(100),
            entry_time: now,
            stop_loss: stop,
            target,
            expires_at: now,
            status: PositionStatus::Open,
            reason: None,
            risk_snapshot: None,
            version: 0,
        }
    }

    #[test]
    fn test_pnl_is_direction_aware() {
        let long = make_position(Direction::Long);
        assert_eq!(long.gross_pnl(dec!(110)), dec!(100));
        assert_eq!(long.gross_pnl(dec!(95)), dec!(-50));

        let short = make_position(Direction::Short);
        assert_eq!(short.gross_pnl(dec!(90)), dec!(100));
        assert_eq!(short.gross_pnl(dec!(105)), dec!(-50));
        assert_eq!(short.loss_at_stop(), dec!(50));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(PositionStatus::parse("OPEN").is_none());
        assert!(!PositionStatus::Pending.is_terminal());
        assert!(!PositionStatus::Open.is_terminal());
        assert!(PositionStatus::Expired.is_terminal());
    }
}
