//! Closed trade outcome record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Direction, ExitReason};

/// Realized outcome of one position. Written exactly once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    /// Ledger row id; monotonically increasing in write order
    pub id: i64,

    pub position_id: i64,
    pub instrument: String,
    pub direction: Direction,
    pub pattern_id: String,

    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,

    /// Net of round-trip costs
    pub realized_pnl: Decimal,

    /// Direction-aware return on entry, net of costs
    pub return_pct: f64,
}

/// Candidate close computed by the monitor before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitFill {
    pub price: Decimal,
    pub time: DateTime<Utc>,
    pub reason: ExitReason,
}
