//! Position lifecycle: legal transitions and exit evaluation against bars.
//!
//! ```text
//! Pending -> Open -> Closed (StopLoss | Target | ManualClose)
//!                 -> Expired (Expiry)
//! Pending -> Rejected
//! ```

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::models::{Direction, ExitFill, ExitReason, Position, PositionStatus, PriceBar};

/// Event moving a position between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Reject,
    Open,
    Close(ExitReason),
    Expire,
}

impl Transition {
    /// Status the position lands in.
    pub fn target(&self) -> PositionStatus {
        match self {
            Self::Reject => PositionStatus::Rejected,
            Self::Open => PositionStatus::Open,
            Self::Close(_) => PositionStatus::Closed,
            Self::Expire => PositionStatus::Expired,
        }
    }

    /// Transition for an exit fill.
    pub fn for_exit(reason: ExitReason) -> Self {
        match reason {
            ExitReason::Expiry => Self::Expire,
            other => Self::Close(other),
        }
    }
}

/// Status after applying `transition` to `from`, or `None` if illegal.
pub fn next_status(from: PositionStatus, transition: Transition) -> Option<PositionStatus> {
    use PositionStatus::*;

    if from.is_terminal() {
        return None;
    }

    match (from, transition) {
        (Pending, Transition::Reject) => Some(Rejected),
        (Pending, Transition::Open) => Some(Open),
        (Open, Transition::Close(ExitReason::Expiry)) => None,
        (Open, Transition::Close(_)) => Some(Closed),
        (Open, Transition::Expire) => Some(Expired),
        _ => None,
    }
}

/// Walk `bars` (oldest first) and decide whether the position exits.
///
/// Bars dated on or before the entry day, or after `as_of`, are ignored.
/// Levels are only checked on bars up to the holding deadline; when one bar
/// crosses both levels the stop-loss wins. Once the deadline has passed the
/// position expires at the close of the last bar on or before it, or at the
/// first later bar when none was seen.
pub fn evaluate_exit(position: &Position, bars: &[PriceBar], as_of: DateTime<Utc>) -> Option<ExitFill> {
    let entry_day = position.entry_time.date_naive();
    let deadline_day = position.expires_at.date_naive();
    let today = as_of.date_naive();

    let mut window_close = None;
    let mut after_deadline = None;

    for bar in bars.iter().filter(|b| b.date > entry_day && b.date <= today) {
        if bar.date > deadline_day {
            after_deadline.get_or_insert(bar);
            continue;
        }
        if let Some(fill) = level_exit(position, bar, as_of) {
            return Some(fill);
        }
        window_close = Some(bar);
    }

    let Some(last) = window_close.or(after_deadline) else {
        debug!(
            position_id = position.id,
            instrument = %position.instrument,
            "No bar after entry yet"
        );
        return None;
    };

    let expired = as_of >= position.expires_at || last.date >= deadline_day || after_deadline.is_some();
    if !expired {
        return None;
    }

    info!(
        position_id = position.id,
        instrument = %position.instrument,
        bar_date = %last.date,
        close = %last.close,
        "Holding period expired"
    );
    Some(ExitFill {
        price: last.close,
        time: as_of,
        reason: ExitReason::Expiry,
    })
}

/// Stop or target crossed within one bar.
fn level_exit(position: &Position, bar: &PriceBar, as_of: DateTime<Utc>) -> Option<ExitFill> {
    let (stop_hit, target_hit) = match position.direction {
        Direction::Long => (bar.low <= position.stop_loss, bar.high >= position.target),
        Direction::Short => (bar.high >= position.stop_loss, bar.low <= position.target),
    };

    if stop_hit {
        warn!(
            position_id = position.id,
            instrument = %position.instrument,
            bar_date = %bar.date,
            stop = %position.stop_loss,
            low = %bar.low,
            high = %bar.high,
            target_also_hit = target_hit,
            "Stop loss triggered"
        );
        return Some(ExitFill {
            price: position.stop_loss,
            time: as_of,
            reason: ExitReason::StopLoss,
        });
    }

    if target_hit {
        info!(
            position_id = position.id,
            instrument = %position.instrument,
            bar_date = %bar.date,
            target = %position.target,
            "Target reached"
        );
        return Some(ExitFill {
            price: position.target,
            time: as_of,
            reason: ExitReason::Target,
        });
    }

    None
}

/// Realized PnL of an exit, net of round-trip cost on the committed capital.
pub fn realized_pnl(position: &Position, exit_price: Decimal, round_trip_cost: Decimal) -> Decimal {
    position.gross_pnl(exit_price) - position.capital_at_risk * round_trip_cost
}

/// Holding deadline `trading_days` weekdays after entry, or `None` past the
/// end of the calendar.
pub fn expiry_deadline(entry: DateTime<Utc>, trading_days: u32) -> Option<DateTime<Utc>> {
    let mut deadline = entry;
    let mut remaining = trading_days;
    while remaining > 0 {
        deadline = deadline.checked_add_signed(Duration::days(1))?;
        if !matches!(deadline.weekday(), Weekday::Sat | Weekday::Sun) {
            remaining -= 1;
        }
    }
    Some(deadline)
}
