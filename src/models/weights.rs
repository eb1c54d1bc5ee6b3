//! Per-pattern outcome statistics and the adjustments that move them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current learned statistics for one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub pattern_id: String,

    /// Smoothed probability of a winning trade
    pub win_rate: f64,

    /// Smoothed average win / average loss (on returns)
    pub win_loss_ratio: f64,

    /// Closed trades folded into these statistics
    pub trade_count: u32,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PatternStats {
    /// Starting point for a pattern with no history.
    pub fn prior(pattern_id: impl Into<String>, win_rate: f64, win_loss_ratio: f64) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            win_rate,
            win_loss_ratio,
            trade_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Kelly edge implied by these statistics.
    pub fn edge(&self) -> f64 {
        if self.win_loss_ratio <= 0.0 {
            return 0.0;
        }
        (self.win_rate * self.win_loss_ratio - (1.0 - self.win_rate)) / self.win_loss_ratio
    }
}

/// One bounded update to a pattern's statistics. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightAdjustment {
    pub pattern_id: String,

    /// Signed change applied to the win rate
    pub delta: f64,

    /// Signed change applied to the win/loss ratio
    pub ratio_delta: f64,

    pub win_rate_after: f64,
    pub ratio_after: f64,

    /// Closed trades in this batch for the pattern
    pub contributing_trades: u32,

    /// Highest closed-trade id covered by this update
    pub watermark_trade_id: i64,

    pub created_at: DateTime<Utc>,
}

/// Feedback progress marker: everything up to and including this trade has
/// been folded into pattern statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermark {
    pub last_trade_id: i64,
    pub last_exit_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_matches_kelly() {
        let stats = PatternStats::prior("hammer", 0.55, 1.5);
        assert!((stats.edge() - 0.25).abs() < 1e-9);

        let no_edge = PatternStats::prior("doji", 0.4, 1.0);
        assert!(no_edge.edge() < 0.0);
    }
}
