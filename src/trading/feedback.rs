//! Closed-trade feedback: folds realized outcomes into per-pattern
//! win-rate and win/loss statistics with bounded EMA steps.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::MetricsCalculator;
use crate::models::{ClosedTrade, PatternStats, Watermark, WeightAdjustment};

/// Feedback smoothing and bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// EMA weight of a single trade (0-1)
    pub alpha: f64,

    /// Largest win-rate move in one update
    pub max_win_rate_delta: f64,

    /// Largest win/loss ratio move in one update
    pub max_ratio_delta: f64,

    /// Rolling window for the cumulative bounds
    pub window_days: i64,

    /// Largest total absolute win-rate movement per pattern within the window
    pub max_window_win_rate_delta: f64,

    /// Largest total absolute ratio movement per pattern within the window
    pub max_window_ratio_delta: f64,

    pub min_ratio: f64,
    pub max_ratio: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            max_win_rate_delta: 0.05,
            max_ratio_delta: 0.25,
            window_days: 30,
            max_window_win_rate_delta: 0.15,
            max_window_ratio_delta: 0.75,
            min_ratio: 0.1,
            max_ratio: 10.0,
        }
    }
}

/// Absolute movement already spent by a pattern inside the rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowUsage {
    pub win_rate: f64,
    pub ratio: f64,
}

/// New statistics for one pattern plus the adjustment record explaining them.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternUpdate {
    pub stats: PatternStats,
    pub adjustment: WeightAdjustment,
}

/// Everything one feedback pass will write.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackPlan {
    pub updates: Vec<PatternUpdate>,
    pub watermark: Watermark,
    pub trades: usize,
}

/// Aggregates closed trades into bounded pattern updates. Pure.
pub struct FeedbackEngine {
    config: FeedbackConfig,
    prior_win_rate: f64,
    prior_win_loss_ratio: f64,
}

impl FeedbackEngine {
    pub fn new(config: FeedbackConfig, prior_win_rate: f64, prior_win_loss_ratio: f64) -> Self {
        Self {
            config,
            prior_win_rate,
            prior_win_loss_ratio,
        }
    }

    /// Start of the rolling window ending at `at`.
    pub fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at - Duration::days(self.config.window_days)
    }

    /// Plan the update for trades past the watermark. `None` when there is
    /// nothing new.
    pub fn plan(
        &self,
        trades: &[ClosedTrade],
        current: &HashMap<String, PatternStats>,
        usage: &HashMap<String, WindowUsage>,
        at: DateTime<Utc>,
    ) -> Option<FeedbackPlan> {
        let last = trades.iter().max_by_key(|t| t.id)?;
        let watermark = Watermark {
            last_trade_id: last.id,
            last_exit_time: Some(last.exit_time),
        };

        let mut by_pattern: BTreeMap<&str, Vec<&ClosedTrade>> = BTreeMap::new();
        for trade in trades {
            by_pattern.entry(trade.pattern_id.as_str()).or_default().push(trade);
        }

        let updates = by_pattern
            .into_iter()
            .map(|(pattern_id, group)| {
                let old = current.get(pattern_id).cloned().unwrap_or_else(|| {
                    PatternStats::prior(pattern_id, self.prior_win_rate, self.prior_win_loss_ratio)
                });
                let spent = usage.get(pattern_id).copied().unwrap_or_default();
                let watermark_trade_id = group.iter().map(|t| t.id).max().unwrap_or(last.id);
                self.update_pattern(old, &group, spent, watermark_trade_id, at)
            })
            .collect();

        Some(FeedbackPlan {
            updates,
            watermark,
            trades: trades.len(),
        })
    }

    fn update_pattern(
        &self,
        old: PatternStats,
        group: &[&ClosedTrade],
        spent: WindowUsage,
        watermark_trade_id: i64,
        at: DateTime<Utc>,
    ) -> PatternUpdate {
        let returns: Vec<f64> = group.iter().map(|t| t.return_pct).collect();
        let batch = MetricsCalculator::outcome_stats(&returns);
        let n = batch.count as i32;

        // n trades at weight alpha each
        let alpha = 1.0 - (1.0 - self.config.alpha).powi(n);

        let raw_wr = alpha * (batch.win_rate - old.win_rate);
        let wr_delta = bound(
            raw_wr,
            self.config.max_win_rate_delta,
            self.config.max_window_win_rate_delta - spent.win_rate,
        );
        let win_rate = (old.win_rate + wr_delta).clamp(0.0, 1.0);

        let raw_ratio = batch
            .win_loss_ratio()
            .map(|r| alpha * (r - old.win_loss_ratio))
            .unwrap_or(0.0);
        let ratio_delta = bound(
            raw_ratio,
            self.config.max_ratio_delta,
            self.config.max_window_ratio_delta - spent.ratio,
        );
        let win_loss_ratio =
            (old.win_loss_ratio + ratio_delta).clamp(self.config.min_ratio, self.config.max_ratio);

        debug!(
            pattern = %old.pattern_id,
            trades = batch.count,
            batch_win_rate = batch.win_rate,
            raw_delta = raw_wr,
            applied_delta = win_rate - old.win_rate,
            "Pattern feedback"
        );

        let stats = PatternStats {
            pattern_id: old.pattern_id.clone(),
            win_rate,
            win_loss_ratio,
            trade_count: old.trade_count + batch.count,
            updated_at: at,
        };

        let adjustment = WeightAdjustment {
            pattern_id: old.pattern_id.clone(),
            delta: win_rate - old.win_rate,
            ratio_delta: win_loss_ratio - old.win_loss_ratio,
            win_rate_after: win_rate,
            ratio_after: win_loss_ratio,
            contributing_trades: batch.count,
            watermark_trade_id,
            created_at: at,
        };

        PatternUpdate { stats, adjustment }
    }
}

/// Clamp a delta to the per-update bound and the remaining window budget.
fn bound(raw: f64, per_update: f64, remaining: f64) -> f64 {
    let limit = per_update.min(remaining).max(0.0);
    raw.clamp(-limit, limit)
}
