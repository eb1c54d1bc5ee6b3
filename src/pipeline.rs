//! Batch drivers: run, monitor and feedback, plus manual close and
//! reconcile.
//!
//! Each driver:
//! - Takes its exclusive lock before touching the ledger
//! - Fetches external data through the retry policy
//! - Applies every write of the invocation in one ledger transaction
//! - Logs one line per processed signal or position with a reason code

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::{PriceFeed, RetryPolicy, SignalSource};
use crate::db::{ReconcileReport, TradeLedger};
use crate::error::{PipelineError, Result, ValidationError};
use crate::lock::ExclusiveLock;
use crate::metrics::{DrawdownStats, MetricsCalculator};
use crate::models::{
    ClosedTrade, ExitFill, ExitReason, PortfolioState, Position, PriceBar, Signal, Watermark,
};
use crate::trading::{
    evaluate_exit, expiry_deadline, BreakerChange, FeedbackConfig, FeedbackEngine, OpenExposure,
    PortfolioSnapshot, PositionSizer, RiskCandidate, RiskConfig, RiskDecision, RiskManager,
    SizingOutcome, TradingConfig, Transition,
};

/// Full pipeline configuration, loadable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub feedback: FeedbackConfig,
    pub retry: RetryPolicy,

    /// Directory holding per-entry-point lock files
    pub lock_dir: PathBuf,

    /// Lock age after which the holder is presumed dead
    pub stale_lock_secs: u64,

    /// Concurrent price fetches during monitor
    pub fetch_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            feedback: FeedbackConfig::default(),
            retry: RetryPolicy::default(),
            lock_dir: PathBuf::from(".papertrader/locks"),
            stale_lock_secs: 6 * 3600,
            fetch_concurrency: 4,
        }
    }
}

impl PipelineConfig {
    /// Defaults, overridden by the JSON file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
                serde_json::from_str(&raw)
                    .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the sizing and risk math cannot work with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;
        let unit = Decimal::ZERO..=Decimal::ONE;

        if t.initial_equity <= Decimal::ZERO {
            return Err(PipelineError::Config("initial_equity must be positive".into()));
        }
        if !(t.kelly_fraction > 0.0 && t.kelly_fraction <= 1.0) {
            return Err(PipelineError::Config("kelly_fraction must be in (0, 1]".into()));
        }
        if !unit.contains(&t.max_position_fraction) || !unit.contains(&t.max_risk_per_trade) {
            return Err(PipelineError::Config(
                "max_position_fraction and max_risk_per_trade must be in [0, 1]".into(),
            ));
        }
        if t.max_horizon_days == 0
            || t.default_horizon_days == 0
            || t.default_horizon_days > t.max_horizon_days
        {
            return Err(PipelineError::Config(
                "horizons must satisfy 1 <= default_horizon_days <= max_horizon_days".into(),
            ));
        }
        let multipliers = [
            t.confidence_tiers.high,
            t.confidence_tiers.medium,
            t.confidence_tiers.low,
        ];
        if multipliers
            .iter()
            .chain(t.horizon_multipliers.values())
            .chain(t.sector_multipliers.values())
            .any(|m| !(m.is_finite() && *m >= 0.0))
        {
            return Err(PipelineError::Config("size multipliers must be non-negative".into()));
        }
        let r = &self.risk;
        if !unit.contains(&r.max_drawdown)
            || !unit.contains(&r.max_daily_loss)
            || !unit.contains(&r.max_monthly_loss)
        {
            return Err(PipelineError::Config(
                "max_drawdown, max_daily_loss and max_monthly_loss must be in [0, 1]".into(),
            ));
        }
        if !(self.feedback.alpha > 0.0 && self.feedback.alpha <= 1.0) {
            return Err(PipelineError::Config("feedback alpha must be in (0, 1]".into()));
        }
        if self.fetch_concurrency == 0 {
            return Err(PipelineError::Config("fetch_concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

/// Outcome counts of one Run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub received: usize,
    pub invalid: usize,
    pub already_processed: usize,
    pub opened: usize,
    pub rejected: usize,
    pub collapsed: usize,
    pub capital_committed: Decimal,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: {} signals, {} opened (${}), {} rejected, {} sized to zero, {} invalid, {} already processed",
            self.run_id,
            self.received,
            self.opened,
            self.capital_committed,
            self.rejected,
            self.collapsed,
            self.invalid,
            self.already_processed
        )
    }
}

/// Outcome counts of one Monitor pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSummary {
    pub run_id: String,
    pub positions: usize,
    pub closed: usize,
    pub expired: usize,
    pub unchanged: usize,

    /// Positions another invocation moved first
    pub stale: usize,

    /// Instruments whose bar could not be fetched
    pub skipped_instruments: Vec<String>,

    pub realized_pnl: Decimal,
}

impl MonitorSummary {
    /// Committed, but some positions were left unevaluated.
    pub fn is_partial(&self) -> bool {
        !self.skipped_instruments.is_empty()
    }
}

impl fmt::Display for MonitorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "monitor {}: {} open, {} closed, {} expired, {} unchanged, realized ${}",
            self.run_id, self.positions, self.closed, self.expired, self.unchanged, self.realized_pnl
        )?;
        if !self.skipped_instruments.is_empty() {
            write!(f, ", skipped {}", self.skipped_instruments.join(","))?;
        }
        Ok(())
    }
}

/// Outcome of one Feedback pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackSummary {
    pub run_id: String,
    pub trades: usize,
    pub patterns: usize,
    pub watermark: Watermark,
    pub exported: Option<PathBuf>,
}

impl fmt::Display for FeedbackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.trades == 0 {
            return write!(
                f,
                "feedback {}: no new closed trades (watermark {})",
                self.run_id, self.watermark.last_trade_id
            );
        }
        write!(
            f,
            "feedback {}: {} trades across {} patterns, watermark -> {}",
            self.run_id, self.trades, self.patterns, self.watermark.last_trade_id
        )
    }
}

/// Read-only dashboard view.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: PortfolioState,
    pub open: Vec<Position>,
    pub status_counts: Vec<(String, i64)>,
    pub watermark: Watermark,
    pub curve: Option<DrawdownStats>,
}

/// A validated signal with its holding deadline.
struct ParsedSignal {
    signal: Signal,
    expires_at: DateTime<Utc>,
}

/// The execution pipeline over one ledger.
pub struct Pipeline {
    config: PipelineConfig,
    ledger: TradeLedger,
    sizer: PositionSizer,
    risk: RiskManager,
    feedback: FeedbackEngine,
    lock: ExclusiveLock,
}

impl Pipeline {
    /// Open the ledger and build the pipeline.
    pub async fn open(config: PipelineConfig, database_url: &str) -> Result<Self> {
        let ledger = TradeLedger::open(database_url, config.trading.initial_equity).await?;
        Ok(Self::new(config, ledger))
    }

    pub fn new(config: PipelineConfig, ledger: TradeLedger) -> Self {
        let sizer = PositionSizer::new(config.trading.clone());
        let risk = RiskManager::new(config.risk.clone(), config.trading.max_position_fraction);
        let feedback = FeedbackEngine::new(
            config.feedback.clone(),
            config.trading.prior_win_rate,
            config.trading.prior_win_loss_ratio,
        );
        let lock = ExclusiveLock::new(
            config.lock_dir.clone(),
            Duration::from_secs(config.stale_lock_secs),
        );

        Self {
            config,
            ledger,
            sizer,
            risk,
            feedback,
            lock,
        }
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    // ==================== Run ====================

    /// Size, gate and record the day's signals.
    pub async fn run(&self, source: &dyn SignalSource, date: NaiveDate) -> Result<RunSummary> {
        let _guard = self.lock.acquire("run")?;
        let run_id = new_run_id();
        let span = info_span!("run", run_id = %run_id, %date);

        self.run_signals(source, date, run_id).instrument(span).await
    }

    async fn run_signals(
        &self,
        source: &dyn SignalSource,
        date: NaiveDate,
        run_id: String,
    ) -> Result<RunSummary> {
        let at = Utc::now();

        // 1. Fetch. Exhausting retries aborts before any write.
        let records = self
            .config
            .retry
            .run("signals", || source.signals_for(date))
            .await?;
        info!(signals = records.len(), "Fetched signals");

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            received: records.len(),
            ..Default::default()
        };

        // 2. Parse and validate each record on its own
        let mut signals = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let label = record_label(&record, index);
            match self.parse_signal(record) {
                Ok(parsed) => signals.push(parsed),
                Err(reason) => {
                    summary.invalid += 1;
                    warn!(
                        signal = %label,
                        reason = reason.code(),
                        detail = %reason,
                        "Signal dropped at validation"
                    );
                }
            }
        }

        // 3. Snapshot the portfolio under the write lock
        let keys: Vec<String> = signals.iter().map(|p| p.signal.key()).collect();
        let known = self.ledger.known_signal_keys(&keys).await?;
        let learned = self.ledger.pattern_stats().await?;
        let instruments: Vec<&str> = signals.iter().map(|p| p.signal.instrument.as_str()).collect();

        let mut tx = self.ledger.begin(&run_id).await?;
        let mut state = tx.portfolio_state().await?;
        let breaker = self.risk.refresh_breakers(&mut state, at);
        match breaker {
            Some(BreakerChange::Tripped { until }) => warn!(
                losses = state.consecutive_losses,
                halted_until = %until,
                reason = "ConsecutiveLossLimit",
                "Loss streak breaker tripped"
            ),
            Some(BreakerChange::CooledDown) => info!("Loss streak cooldown over"),
            None => {}
        }
        let mut snapshot = self.snapshot(state, at, &instruments).await?;

        // 4. Decide each signal in order; earlier acceptances count against later ones
        let mut seen = HashSet::new();

        for ParsedSignal { signal, expires_at } in signals {
            let key = signal.key();
            if known.contains(&key) || !seen.insert(key.clone()) {
                summary.already_processed += 1;
                info!(signal = %key, reason = "AlreadyProcessed", "Signal skipped");
                continue;
            }

            let signal_json = serde_json::to_string(&signal)
                .map_err(|e| PipelineError::CorruptRow(format!("signal {key}: {e}")))?;
            let stats = self
                .sizer
                .resolve_stats(&signal, learned.get(&signal.pattern_id));

            let sized = match self.sizer.size(&signal, snapshot.state.equity, &stats) {
                SizingOutcome::Sized(sized) => sized,
                SizingOutcome::Collapsed { reason, kelly } => {
                    let mut position =
                        Position::pending(&signal, Decimal::ZERO, Decimal::ZERO, expires_at);
                    position.id = tx.insert_position(&position, &signal_json, at).await?;
                    tx.apply_transition(&position, Transition::Reject, &reason.to_string(), None, at)
                        .await?;

                    summary.collapsed += 1;
                    info!(
                        signal = %key,
                        position_id = position.id,
                        reason = %reason,
                        kelly,
                        stats_source = stats.source.as_str(),
                        "Signal sized to zero"
                    );
                    continue;
                }
            };

            let sector = self
                .config
                .trading
                .sector_for(&signal.instrument, signal.sector.as_deref());
            let mut position =
                Position::pending(&signal, sized.quantity, sized.capital_at_risk, expires_at);
            position.sector = sector.clone();
            position.id = tx.insert_position(&position, &signal_json, at).await?;

            let candidate = RiskCandidate {
                instrument: &signal.instrument,
                direction: signal.direction,
                sector: sector.as_deref(),
                capital_at_risk: sized.capital_at_risk,
            };

            match self.risk.evaluate(&candidate, &snapshot, at) {
                RiskDecision::Reject(reason) => {
                    tx.apply_transition(&position, Transition::Reject, &reason.to_string(), None, at)
                        .await?;
                    summary.rejected += 1;
                    info!(
                        signal = %key,
                        position_id = position.id,
                        reason = reason.code(),
                        detail = %reason,
                        "Signal rejected by risk gate"
                    );
                }
                RiskDecision::Accept(risk_snapshot) => {
                    tx.apply_transition(
                        &position,
                        Transition::Open,
                        "Accepted",
                        Some(&risk_snapshot),
                        at,
                    )
                    .await?;
                    snapshot.record_accept(
                        OpenExposure {
                            instrument: signal.instrument.clone(),
                            direction: signal.direction,
                            sector,
                            capital_at_risk: sized.capital_at_risk,
                        },
                        at,
                    );

                    summary.opened += 1;
                    summary.capital_committed += sized.capital_at_risk;
                    info!(
                        signal = %key,
                        position_id = position.id,
                        instrument = %signal.instrument,
                        direction = %signal.direction,
                        quantity = %sized.quantity,
                        capital_at_risk = %sized.capital_at_risk,
                        loss_at_stop = %position.loss_at_stop(),
                        kelly = sized.kelly,
                        fraction = sized.fraction,
                        adjustment = sized.adjustment,
                        stats_source = stats.source.as_str(),
                        reason = "Accepted",
                        "Position opened"
                    );
                }
            }
        }

        // 5. Commit
        if summary.opened > 0 || breaker.is_some() {
            tx.save_portfolio_state(&snapshot.state).await?;
        }
        tx.commit().await?;

        info!(
            opened = summary.opened,
            rejected = summary.rejected,
            collapsed = summary.collapsed,
            invalid = summary.invalid,
            "Run committed"
        );
        Ok(summary)
    }

    fn parse_signal(&self, record: Value) -> std::result::Result<ParsedSignal, ValidationError> {
        let signal: Signal = serde_json::from_value(record)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        signal.validate()?;

        let trading = &self.config.trading;
        let horizon = signal.horizon(trading.default_horizon_days, trading.max_horizon_days)?;
        let expires_at = expiry_deadline(signal.timestamp, horizon).ok_or(
            ValidationError::HorizonOutOfRange {
                days: horizon,
                max: trading.max_horizon_days,
            },
        )?;

        if trading.excluded_patterns.iter().any(|p| p == &signal.pattern_id) {
            return Err(ValidationError::ExcludedPattern(signal.pattern_id));
        }
        if signal.confidence < trading.min_confidence {
            return Err(ValidationError::BelowMinConfidence {
                confidence: signal.confidence,
                min: trading.min_confidence,
            });
        }

        Ok(ParsedSignal { signal, expires_at })
    }

    /// Portfolio facts for the risk gate, with close history for every open
    /// instrument and every candidate instrument.
    ///
    /// Called while holding the ledger write lock, so the pool reads agree
    /// with `state`.
    async fn snapshot(
        &self,
        state: PortfolioState,
        at: DateTime<Utc>,
        candidates: &[&str],
    ) -> Result<PortfolioSnapshot> {
        let open = self.ledger.open_positions().await?;

        // Loss windows start at the period start or the last breaker reset
        let today = at.date_naive();
        let month = today.with_day(1).unwrap_or(today);
        let window = |start: NaiveDate| {
            let start = start.and_time(NaiveTime::MIN).and_utc();
            state.breakers_reset_at.map_or(start, |reset| reset.max(start))
        };
        let (day_start, month_start) = (window(today), window(month));

        let mut snapshot = PortfolioSnapshot::new(state);
        snapshot.entries_today = self.ledger.entries_on(today).await?;
        snapshot.realized_today = self.ledger.realized_pnl_since(day_start).await?;
        snapshot.realized_this_month = self.ledger.realized_pnl_since(month_start).await?;

        let window = self.config.risk.correlation_window;
        let instruments: HashSet<&str> = open
            .iter()
            .map(|p| p.instrument.as_str())
            .chain(candidates.iter().copied())
            .collect();
        for instrument in instruments {
            let closes = self.ledger.recent_closes(instrument, window + 1).await?;
            if !closes.is_empty() {
                snapshot.price_history.insert(instrument.to_string(), closes);
            }
        }

        snapshot.open = open
            .into_iter()
            .map(|p| OpenExposure {
                instrument: p.instrument,
                direction: p.direction,
                sector: p.sector,
                capital_at_risk: p.capital_at_risk,
            })
            .collect();

        Ok(snapshot)
    }

    // ==================== Monitor ====================

    /// Evaluate every open position against its latest bar.
    pub async fn monitor(&self, feed: &dyn PriceFeed, as_of: DateTime<Utc>) -> Result<MonitorSummary> {
        let _guard = self.lock.acquire("monitor")?;
        let run_id = new_run_id();
        let span = info_span!("monitor", run_id = %run_id, as_of = %as_of);

        self.monitor_positions(feed, as_of, run_id).instrument(span).await
    }

    async fn monitor_positions(
        &self,
        feed: &dyn PriceFeed,
        as_of: DateTime<Utc>,
        run_id: String,
    ) -> Result<MonitorSummary> {
        let open = self.ledger.open_positions().await?;
        let mut summary = MonitorSummary {
            run_id: run_id.clone(),
            positions: open.len(),
            ..Default::default()
        };

        if open.is_empty() {
            info!("No open positions");
            return Ok(summary);
        }

        let mut by_instrument: BTreeMap<String, Vec<Position>> = BTreeMap::new();
        for position in open {
            by_instrument
                .entry(position.instrument.clone())
                .or_default()
                .push(position);
        }

        // 1. Fetch every bar since the earliest entry, isolated per instrument,
        //    so days missed by earlier passes are caught up
        let today = as_of.date_naive();
        let retry = &self.config.retry;
        let ranges: Vec<(String, NaiveDate)> = by_instrument
            .iter()
            .map(|(instrument, positions)| {
                let from = positions
                    .iter()
                    .map(|p| p.entry_time.date_naive())
                    .min()
                    .unwrap_or(today)
                    .min(today);
                (instrument.clone(), from)
            })
            .collect();
        let mut fetched: Vec<(String, Result<Vec<PriceBar>>)> = stream::iter(ranges)
            .map(|(instrument, from)| async move {
                let bars = retry
                    .run(&instrument, || feed.daily_bars(&instrument, from, today))
                    .await;
                (instrument, bars)
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .collect()
            .await;
        fetched.sort_by(|a, b| a.0.cmp(&b.0));

        // 2. Evaluate exits and write under the write lock
        let mut tx = self.ledger.begin(&run_id).await?;
        let mut state = tx.portfolio_state().await?;
        let cost = self.config.trading.round_trip_cost;

        for (instrument, result) in fetched {
            let positions = by_instrument.remove(&instrument).unwrap_or_default();

            let mut bars = match result {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(
                        instrument = %instrument,
                        error = %e,
                        reason = e.code(),
                        positions = positions.len(),
                        "Skipping instrument"
                    );
                    summary.skipped_instruments.push(instrument);
                    continue;
                }
            };
            bars.sort_by_key(|b| b.date);

            if let Some(bad) = bars.iter().find(|b| !b.is_consistent()) {
                warn!(
                    instrument = %instrument,
                    bar_date = %bad.date,
                    reason = "InconsistentBar",
                    positions = positions.len(),
                    "Skipping instrument"
                );
                summary.skipped_instruments.push(instrument);
                continue;
            }

            for bar in &bars {
                tx.record_bar(bar).await?;
            }

            for position in positions {
                let Some(fill) = evaluate_exit(&position, &bars, as_of) else {
                    summary.unchanged += 1;
                    debug!(
                        position_id = position.id,
                        instrument = %instrument,
                        bars = bars.len(),
                        close = ?bars.last().map(|b| b.close),
                        reason = "NoExit",
                        "Position unchanged"
                    );
                    continue;
                };

                match tx.close_position(&position, &fill, cost, as_of).await? {
                    Some(trade) => {
                        state.apply_close(position.capital_at_risk, trade.realized_pnl, as_of);
                        summary.realized_pnl += trade.realized_pnl;
                        if trade.exit_reason == ExitReason::Expiry {
                            summary.expired += 1;
                        } else {
                            summary.closed += 1;
                        }
                        info!(
                            position_id = position.id,
                            instrument = %instrument,
                            reason = %trade.exit_reason,
                            exit_price = %trade.exit_price,
                            realized_pnl = %trade.realized_pnl,
                            "Position exited"
                        );
                    }
                    None => {
                        summary.stale += 1;
                        warn!(
                            position_id = position.id,
                            reason = "StaleVersion",
                            "Position moved by another invocation"
                        );
                    }
                }
            }
        }

        // 3. Commit; equity only moves when something closed
        if summary.closed + summary.expired > 0 {
            tx.save_portfolio_state(&state).await?;
            tx.record_equity_point(&state).await?;
        }
        tx.commit().await?;

        info!(
            closed = summary.closed,
            expired = summary.expired,
            unchanged = summary.unchanged,
            skipped = summary.skipped_instruments.len(),
            "Monitor committed"
        );
        Ok(summary)
    }

    /// Close one open position at a given price (ManualClose).
    pub async fn close_position(
        &self,
        position_id: i64,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<ClosedTrade> {
        let _guard = self.lock.acquire("monitor")?;
        let run_id = new_run_id();

        if price <= Decimal::ZERO {
            return Err(PipelineError::Validation {
                signal: format!("position {position_id}"),
                reason: ValidationError::NonPositivePrice("price"),
            });
        }

        let position = self
            .ledger
            .position(position_id)
            .await?
            .ok_or(PipelineError::UnknownPosition(position_id))?;

        let fill = ExitFill {
            price,
            time: at,
            reason: ExitReason::ManualClose,
        };

        let mut tx = self.ledger.begin(&run_id).await?;
        let mut state = tx.portfolio_state().await?;
        let trade = tx
            .close_position(&position, &fill, self.config.trading.round_trip_cost, at)
            .await?
            .ok_or_else(|| PipelineError::ConcurrencyConflict {
                entry_point: "close".to_string(),
                holder: format!("position {position_id} changed while closing"),
            })?;

        state.apply_close(position.capital_at_risk, trade.realized_pnl, at);
        tx.save_portfolio_state(&state).await?;
        tx.record_equity_point(&state).await?;
        tx.commit().await?;

        info!(
            run_id = %run_id,
            position_id,
            instrument = %position.instrument,
            exit_price = %price,
            realized_pnl = %trade.realized_pnl,
            reason = "ManualClose",
            "Position closed manually"
        );
        Ok(trade)
    }

    /// Clear the loss streak and its cooldown (operator override).
    ///
    /// Nothing is written unless `confirm` is set; returns the state after
    /// the reset. The drawdown limit is not a breaker and stays in force.
    pub async fn reset_breakers(&self, confirm: bool) -> Result<Option<PortfolioState>> {
        if !confirm {
            return Ok(None);
        }

        let _run = self.lock.acquire("run")?;
        let _monitor = self.lock.acquire("monitor")?;
        let run_id = new_run_id();
        let at = Utc::now();

        let mut tx = self.ledger.begin(&run_id).await?;
        let mut state = tx.portfolio_state().await?;
        let (losses, halted_until) = (state.consecutive_losses, state.halted_until);
        state.reset_breakers(at);
        tx.save_portfolio_state(&state).await?;
        tx.commit().await?;

        warn!(
            run_id = %run_id,
            losses,
            halted_until = ?halted_until,
            "Circuit breakers reset"
        );
        Ok(Some(state))
    }

    // ==================== Feedback ====================

    /// Fold closed trades past the watermark into pattern statistics.
    pub async fn feedback(&self, export: Option<&Path>) -> Result<FeedbackSummary> {
        let _guard = self.lock.acquire("feedback")?;
        let run_id = new_run_id();
        let span = info_span!("feedback", run_id = %run_id);

        self.apply_feedback(export, run_id).instrument(span).await
    }

    async fn apply_feedback(&self, export: Option<&Path>, run_id: String) -> Result<FeedbackSummary> {
        let at = Utc::now();
        let watermark = self.ledger.watermark().await?;
        let trades = self.ledger.closed_trades_after(watermark.last_trade_id).await?;

        let mut summary = FeedbackSummary {
            run_id: run_id.clone(),
            watermark,
            ..Default::default()
        };

        let current = self.ledger.pattern_stats().await?;
        let usage = self
            .ledger
            .window_usage(self.feedback.window_start(at))
            .await?;

        let Some(plan) = self.feedback.plan(&trades, &current, &usage, at) else {
            info!(watermark = watermark.last_trade_id, "No new closed trades");
            return Ok(summary);
        };

        let mut tx = self.ledger.begin(&run_id).await?;
        for update in &plan.updates {
            tx.insert_weight_adjustment(&update.adjustment).await?;
            tx.save_pattern_stats(&update.stats).await?;
            info!(
                pattern = %update.stats.pattern_id,
                trades = update.adjustment.contributing_trades,
                delta = update.adjustment.delta,
                ratio_delta = update.adjustment.ratio_delta,
                win_rate = update.stats.win_rate,
                win_loss_ratio = update.stats.win_loss_ratio,
                "Pattern weights updated"
            );
        }

        if !tx.advance_watermark(&plan.watermark, at).await? {
            return Err(PipelineError::ConcurrencyConflict {
                entry_point: "feedback".to_string(),
                holder: format!("watermark already past {}", plan.watermark.last_trade_id),
            });
        }
        tx.commit().await?;

        summary.trades = plan.trades;
        summary.patterns = plan.updates.len();
        summary.watermark = plan.watermark;

        if let Some(path) = export {
            let count = self.export_weights(path).await?;
            info!(path = %path.display(), patterns = count, "Exported pattern weights");
            summary.exported = Some(path.to_path_buf());
        }

        Ok(summary)
    }

    /// Write current pattern weights as JSON for the signal producer.
    ///
    /// Written to a temporary file and renamed into place.
    pub async fn export_weights(&self, path: &Path) -> Result<usize> {
        let stats: BTreeMap<String, _> = self.ledger.pattern_stats().await?.into_iter().collect();
        let patterns: serde_json::Map<String, Value> = stats
            .values()
            .map(|s| {
                (
                    s.pattern_id.clone(),
                    serde_json::json!({
                        "win_rate": s.win_rate,
                        "win_loss_ratio": s.win_loss_ratio,
                        "trade_count": s.trade_count,
                        "edge": s.edge(),
                        "updated_at": s.updated_at,
                    }),
                )
            })
            .collect();

        let body = serde_json::to_string_pretty(&serde_json::json!({
            "generated_at": Utc::now(),
            "patterns": patterns,
        }))
        .map_err(|e| PipelineError::CorruptRow(format!("weights export: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(stats.len())
    }

    // ==================== Status / Reconcile ====================

    /// Last committed state. Takes no lock.
    pub async fn status(&self) -> Result<StatusReport> {
        let curve: Vec<Decimal> = std::iter::once(self.config.trading.initial_equity)
            .chain(
                self.ledger
                    .equity_curve()
                    .await?
                    .iter()
                    .filter_map(|p| p.equity.parse().ok()),
            )
            .collect();

        Ok(StatusReport {
            state: self.ledger.portfolio_state().await?,
            open: self.ledger.open_positions().await?,
            status_counts: self.ledger.status_counts().await?,
            watermark: self.ledger.watermark().await?,
            curve: MetricsCalculator::drawdown(&curve),
        })
    }

    /// Compare stored portfolio state with the ledger; with `repair`,
    /// overwrite it with the rebuilt state.
    pub async fn reconcile(&self, repair: bool) -> Result<ReconcileReport> {
        if !repair {
            return self.ledger.reconcile().await;
        }

        let _guard = self.lock.acquire("reconcile")?;
        let _run = self.lock.acquire("run")?;
        let _monitor = self.lock.acquire("monitor")?;

        let report = self.ledger.reconcile().await?;
        if report.is_consistent() {
            return Ok(report);
        }

        let run_id = new_run_id();
        let mut repaired = report.derived.clone();
        repaired.updated_at = Utc::now();

        let mut tx = self.ledger.begin(&run_id).await?;
        tx.save_portfolio_state(&repaired).await?;
        tx.commit().await?;

        warn!(
            run_id = %run_id,
            drift = ?report.drift(),
            stored_equity = %report.stored.equity,
            derived_equity = %report.derived.equity,
            "Portfolio state repaired"
        );
        Ok(report)
    }
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Best-effort name for a raw record in log lines.
fn record_label(record: &Value, index: usize) -> String {
    match record.get("instrument").and_then(Value::as_str) {
        Some(instrument) => format!("#{index}:{instrument}"),
        None => format!("#{index}"),
    }
}
