//! Trade ledger: durable SQLite record of every position and its history.
//!
//! Stores:
//! - Positions (current-state projection) and their append-only transition log
//! - Closed trades, written exactly once per position
//! - Pattern statistics, weight adjustments and the feedback watermark
//! - Portfolio state, equity curve and observed price bars
//!
//! Each driver invocation writes through one [`LedgerTx`]; nothing is
//! visible to readers until it commits. Transactions begin `IMMEDIATE`, so
//! the write lock is held from the start and a second driver waits instead
//! of working from a state that is about to change. WAL journaling lets
//! dashboard readers see the last committed state while a driver is writing.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::models::{
    ClosedTrade, Direction, ExitFill, ExitReason, PatternStats, PortfolioState, Position,
    PositionStatus, PriceBar, Regime, RiskSnapshot, Watermark, WeightAdjustment,
};
use crate::trading::{next_status, realized_pnl, Transition, WindowUsage};

/// Connection pool over the ledger database.
pub struct TradeLedger {
    pool: SqlitePool,
}

/// Stored position row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PositionRow {
    id: i64,
    signal_key: String,
    instrument: String,
    direction: String,
    pattern_id: String,
    regime: String,
    sector: Option<String>,
    quantity: String,
    capital_at_risk: String,
    entry_price: String,
    entry_time: String,
    stop_loss: String,
    target: String,
    expires_at: String,
    status: String,
    reason: Option<String>,
    risk_snapshot: Option<String>,
    version: i64,
}

/// Stored closed trade row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ClosedTradeRow {
    id: i64,
    position_id: i64,
    instrument: String,
    direction: String,
    pattern_id: String,
    exit_price: String,
    exit_time: String,
    exit_reason: String,
    realized_pnl: String,
    return_pct: f64,
}

/// Stored portfolio state row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PortfolioRow {
    initial_equity: String,
    equity: String,
    high_water_mark: String,
    open_exposure: String,
    open_positions: i64,
    realized_pnl: String,
    consecutive_losses: i64,
    halted_until: Option<String>,
    breakers_reset_at: Option<String>,
    updated_at: String,
}

/// Stored pattern statistics row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PatternRow {
    pattern_id: String,
    win_rate: f64,
    win_loss_ratio: f64,
    trade_count: i64,
    updated_at: String,
}

/// Stored weight adjustment row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct AdjustmentRow {
    pattern_id: String,
    delta: f64,
    ratio_delta: f64,
    win_rate_after: f64,
    ratio_after: f64,
    contributing_trades: i64,
    watermark_trade_id: i64,
    created_at: String,
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TransitionRecord {
    pub id: i64,
    pub position_id: i64,
    pub from_status: Option<String>,
    pub to_status: String,
    pub reason: String,
    pub run_id: String,
    pub occurred_at: String,
}

/// Equity curve point.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub id: i64,
    pub timestamp: String,
    pub equity: String,
    pub open_exposure: String,
    pub drawdown: String,
    pub run_id: String,
}

/// Stored portfolio state next to the state rebuilt from the ledger.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub stored: PortfolioState,
    pub derived: PortfolioState,
}

impl ReconcileReport {
    /// Fields whose stored value differs from the rebuilt one.
    pub fn drift(&self) -> Vec<&'static str> {
        let (s, d) = (&self.stored, &self.derived);
        let mut fields = Vec::new();
        if s.equity != d.equity {
            fields.push("equity");
        }
        if s.high_water_mark != d.high_water_mark {
            fields.push("high_water_mark");
        }
        if s.open_exposure != d.open_exposure {
            fields.push("open_exposure");
        }
        if s.open_positions != d.open_positions {
            fields.push("open_positions");
        }
        if s.realized_pnl != d.realized_pnl {
            fields.push("realized_pnl");
        }
        if s.consecutive_losses != d.consecutive_losses {
            fields.push("consecutive_losses");
        }
        fields
    }

    pub fn is_consistent(&self) -> bool {
        self.drift().is_empty()
    }
}

impl TradeLedger {
    /// Open (creating if missing) the ledger and run migrations.
    pub async fn open(database_url: &str, initial_equity: Decimal) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.run_migrations().await?;
        ledger.init_portfolio(initial_equity).await?;

        Ok(ledger)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Current-state projection of positions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_key TEXT NOT NULL UNIQUE,
                instrument TEXT NOT NULL,
                direction TEXT NOT NULL,
                pattern_id TEXT NOT NULL,
                regime TEXT NOT NULL,
                sector TEXT,
                quantity TEXT NOT NULL,
                capital_at_risk TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                target TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                risk_snapshot TEXT,
                signal_json TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                run_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only transition log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL,
                from_status TEXT,
                to_status TEXT NOT NULL,
                reason TEXT NOT NULL,
                snapshot TEXT,
                run_id TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                FOREIGN KEY (position_id) REFERENCES positions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Closed trades, one per position
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL UNIQUE,
                instrument TEXT NOT NULL,
                direction TEXT NOT NULL,
                pattern_id TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                return_pct REAL NOT NULL,
                run_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                FOREIGN KEY (position_id) REFERENCES positions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Learned pattern statistics
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_stats (
                pattern_id TEXT PRIMARY KEY,
                win_rate REAL NOT NULL,
                win_loss_ratio REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only weight adjustments
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS weight_adjustments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_id TEXT NOT NULL,
                delta REAL NOT NULL,
                ratio_delta REAL NOT NULL,
                win_rate_after REAL NOT NULL,
                ratio_after REAL NOT NULL,
                contributing_trades INTEGER NOT NULL,
                watermark_trade_id INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Feedback watermark
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feedback_watermark (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_trade_id INTEGER NOT NULL DEFAULT 0,
                last_exit_time TEXT,
                updated_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Portfolio state
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                initial_equity TEXT NOT NULL,
                equity TEXT NOT NULL,
                high_water_mark TEXT NOT NULL,
                open_exposure TEXT NOT NULL,
                open_positions INTEGER NOT NULL,
                realized_pnl TEXT NOT NULL,
                consecutive_losses INTEGER NOT NULL,
                halted_until TEXT,
                breakers_reset_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Equity curve
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity TEXT NOT NULL,
                open_exposure TEXT NOT NULL,
                drawdown TEXT NOT NULL,
                run_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Observed daily bars
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_bars (
                instrument TEXT NOT NULL,
                bar_date TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                PRIMARY KEY (instrument, bar_date)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_one_open ON positions(instrument, direction) WHERE status = 'open'",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transitions_position ON transitions(position_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_adjustments_pattern ON weight_adjustments(pattern_id, created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("INSERT OR IGNORE INTO feedback_watermark (id, last_trade_id) VALUES (1, 0)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Seed portfolio state on first open. Later opens keep what is stored.
    async fn init_portfolio(&self, initial_equity: Decimal) -> Result<()> {
        let state = PortfolioState::new(initial_equity);
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO portfolio_state (
                id, initial_equity, equity, high_water_mark, open_exposure,
                open_positions, realized_pnl, consecutive_losses, updated_at
            ) VALUES (1, ?, ?, ?, ?, 0, ?, 0, ?)
            "#,
        )
        .bind(state.initial_equity.to_string())
        .bind(state.equity.to_string())
        .bind(state.high_water_mark.to_string())
        .bind(state.open_exposure.to_string())
        .bind(state.realized_pnl.to_string())
        .bind(ts(state.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(initial_equity = %initial_equity, "Initialized portfolio state");
        }
        Ok(())
    }

    /// Start the single transaction for one driver invocation, taking the
    /// database write lock.
    pub async fn begin(&self, run_id: &str) -> Result<LedgerTx> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(LedgerTx {
            tx,
            run_id: run_id.to_string(),
        })
    }

    // ==================== Portfolio ====================

    /// Get current portfolio state.
    pub async fn portfolio_state(&self) -> Result<PortfolioState> {
        let row = sqlx::query_as::<_, PortfolioRow>("SELECT * FROM portfolio_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    /// Get the equity curve, oldest first.
    pub async fn equity_curve(&self) -> Result<Vec<EquityPoint>> {
        Ok(
            sqlx::query_as::<_, EquityPoint>("SELECT * FROM equity_curve ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Rebuild portfolio state from positions and closed trades and compare
    /// with what is stored.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let stored = self.portfolio_state().await?;
        let mut derived = PortfolioState::new(stored.initial_equity);

        for trade in self.closed_trades_after(0).await? {
            derived.apply_close(Decimal::ZERO, trade.realized_pnl, trade.exit_time);
            // Losses up to a breaker reset no longer count toward the streak
            if stored.breakers_reset_at.is_some_and(|reset| trade.exit_time <= reset) {
                derived.consecutive_losses = 0;
            }
        }
        derived.halted_until = stored.halted_until;
        derived.breakers_reset_at = stored.breakers_reset_at;

        let open = self.open_positions().await?;
        derived.open_positions = open.len() as u32;
        derived.open_exposure = open.iter().map(|p| p.capital_at_risk).sum();
        derived.updated_at = stored.updated_at;

        Ok(ReconcileReport { stored, derived })
    }

    // ==================== Positions ====================

    /// Get all open positions.
    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        self.positions_with_status(PositionStatus::Open).await
    }

    /// Get positions in one status, oldest first.
    pub async fn positions_with_status(&self, status: PositionStatus) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE status = ? ORDER BY id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Position::try_from).collect()
    }

    /// Get one position by id.
    pub async fn position(&self, id: i64) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Position::try_from).transpose()
    }

    /// Which of these signal keys already have a position.
    pub async fn known_signal_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        let mut known = HashSet::new();
        for key in keys {
            let hit: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM positions WHERE signal_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            if hit.is_some() {
                known.insert(key.clone());
            }
        }
        Ok(known)
    }

    /// Positions opened on a calendar day (UTC).
    pub async fn entries_on(&self, day: NaiveDate) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transitions WHERE to_status = 'open' AND substr(occurred_at, 1, 10) = ?",
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u32)
    }

    /// Position counts per status.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        Ok(sqlx::query_as(
            "SELECT status, COUNT(*) FROM positions GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Transition history of one position, oldest first.
    pub async fn transitions(&self, position_id: i64) -> Result<Vec<TransitionRecord>> {
        Ok(sqlx::query_as::<_, TransitionRecord>(
            r#"
            SELECT id, position_id, from_status, to_status, reason, run_id, occurred_at
            FROM transitions WHERE position_id = ? ORDER BY id
            "#,
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ==================== Closed Trades ====================

    /// Closed trades with id above `after_id`, in write order.
    pub async fn closed_trades_after(&self, after_id: i64) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query_as::<_, ClosedTradeRow>(
            r#"
            SELECT id, position_id, instrument, direction, pattern_id, exit_price,
                   exit_time, exit_reason, realized_pnl, return_pct
            FROM closed_trades WHERE id > ? ORDER BY id
            "#,
        )
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ClosedTrade::try_from).collect()
    }

    /// Net realized PnL of trades exiting at or after `since`.
    pub async fn realized_pnl_since(&self, since: DateTime<Utc>) -> Result<Decimal> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT realized_pnl FROM closed_trades WHERE exit_time >= ?")
                .bind(ts(since))
                .fetch_all(&self.pool)
                .await?;

        let mut total = Decimal::ZERO;
        for (pnl,) in &rows {
            total += parse_decimal(pnl)?;
        }
        Ok(total)
    }

    /// Closed trade for a position, if any.
    pub async fn closed_trade_for(&self, position_id: i64) -> Result<Option<ClosedTrade>> {
        let row = sqlx::query_as::<_, ClosedTradeRow>(
            r#"
            SELECT id, position_id, instrument, direction, pattern_id, exit_price,
                   exit_time, exit_reason, realized_pnl, return_pct
            FROM closed_trades WHERE position_id = ?
            "#,
        )
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ClosedTrade::try_from).transpose()
    }

    // ==================== Feedback ====================

    /// Get the feedback watermark.
    pub async fn watermark(&self) -> Result<Watermark> {
        let (last_trade_id, last_exit_time): (i64, Option<String>) = sqlx::query_as(
            "SELECT last_trade_id, last_exit_time FROM feedback_watermark WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Watermark {
            last_trade_id,
            last_exit_time: last_exit_time.as_deref().map(parse_time).transpose()?,
        })
    }

    /// Get learned statistics for every pattern.
    pub async fn pattern_stats(&self) -> Result<HashMap<String, PatternStats>> {
        let rows = sqlx::query_as::<_, PatternRow>("SELECT * FROM pattern_stats")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let stats = PatternStats::try_from(row)?;
                Ok::<_, PipelineError>((stats.pattern_id.clone(), stats))
            })
            .collect()
    }

    /// Absolute movement per pattern from adjustments since `since`.
    pub async fn window_usage(&self, since: DateTime<Utc>) -> Result<HashMap<String, WindowUsage>> {
        let rows: Vec<(String, f64, f64)> = sqlx::query_as(
            r#"
            SELECT pattern_id, COALESCE(SUM(ABS(delta)), 0.0), COALESCE(SUM(ABS(ratio_delta)), 0.0)
            FROM weight_adjustments WHERE created_at >= ?
            GROUP BY pattern_id
            "#,
        )
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(pattern, win_rate, ratio)| (pattern, WindowUsage { win_rate, ratio }))
            .collect())
    }

    /// Most recent weight adjustments, newest first.
    pub async fn weight_adjustments(&self, limit: i64) -> Result<Vec<WeightAdjustment>> {
        let rows = sqlx::query_as::<_, AdjustmentRow>(
            r#"
            SELECT pattern_id, delta, ratio_delta, win_rate_after, ratio_after,
                   contributing_trades, watermark_trade_id, created_at
            FROM weight_adjustments ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WeightAdjustment::try_from).collect()
    }

    // ==================== Price Bars ====================

    /// Last `limit` closes for an instrument, oldest first.
    pub async fn recent_closes(&self, instrument: &str, limit: usize) -> Result<Vec<(NaiveDate, f64)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT bar_date, close FROM price_bars WHERE instrument = ? ORDER BY bar_date DESC LIMIT ?",
        )
        .bind(instrument)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut closes = rows
            .into_iter()
            .map(|(date, close)| {
                let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .map_err(|e| PipelineError::CorruptRow(format!("bar date {date}: {e}")))?;
                let close = parse_decimal(&close)?.to_f64().unwrap_or(0.0);
                Ok((date, close))
            })
            .collect::<Result<Vec<_>>>()?;
        closes.reverse();

        Ok(closes)
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Writes of one driver invocation. Dropped without [`LedgerTx::commit`]
/// means rolled back.
pub struct LedgerTx {
    tx: Transaction<'static, Sqlite>,
    run_id: String,
}

impl LedgerTx {
    /// Portfolio state as seen under this transaction's write lock.
    pub async fn portfolio_state(&mut self) -> Result<PortfolioState> {
        let row = sqlx::query_as::<_, PortfolioRow>("SELECT * FROM portfolio_state WHERE id = 1")
            .fetch_one(&mut *self.tx)
            .await?;
        row.try_into()
    }

    /// Insert a new pending position and log its creation. Returns its id.
    pub async fn insert_position(
        &mut self,
        position: &Position,
        signal_json: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let now = ts(at);
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                signal_key, instrument, direction, pattern_id, regime, sector,
                quantity, capital_at_risk, entry_price, entry_time, stop_loss, target,
                expires_at, status, reason, signal_json, version, run_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&position.signal_key)
        .bind(&position.instrument)
        .bind(position.direction.as_str())
        .bind(&position.pattern_id)
        .bind(position.regime.as_str())
        .bind(&position.sector)
        .bind(position.quantity.to_string())
        .bind(position.capital_at_risk.to_string())
        .bind(position.entry_price.to_string())
        .bind(ts(position.entry_time))
        .bind(position.stop_loss.to_string())
        .bind(position.target.to_string())
        .bind(ts(position.expires_at))
        .bind(signal_json)
        .bind(&self.run_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *self.tx)
        .await?;

        let id = result.last_insert_rowid();
        self.log_transition(id, None, PositionStatus::Pending, "Created", None, &now)
            .await?;

        Ok(id)
    }

    /// Apply a lifecycle transition if the position is still in the status
    /// and version the caller read.
    ///
    /// Returns `false` when another invocation already moved it. Illegal
    /// transitions are an error.
    pub async fn apply_transition(
        &mut self,
        position: &Position,
        transition: Transition,
        reason: &str,
        snapshot: Option<&RiskSnapshot>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let to = next_status(position.status, transition).ok_or(PipelineError::IllegalTransition {
            position_id: position.id,
            from: position.status,
            to: transition.target(),
        })?;

        let snapshot_json = snapshot
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PipelineError::CorruptRow(format!("risk snapshot: {e}")))?;
        let now = ts(at);

        let result = sqlx::query(
            r#"
            UPDATE positions SET
                status = ?,
                reason = ?,
                risk_snapshot = COALESCE(?, risk_snapshot),
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND status = ? AND version = ?
            "#,
        )
        .bind(to.as_str())
        .bind(reason)
        .bind(&snapshot_json)
        .bind(&now)
        .bind(position.id)
        .bind(position.status.as_str())
        .bind(position.version)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                position_id = position.id,
                from = %position.status,
                to = %to,
                "Position already transitioned, skipping"
            );
            return Ok(false);
        }

        self.log_transition(
            position.id,
            Some(position.status),
            to,
            reason,
            snapshot_json.as_deref(),
            &now,
        )
        .await?;

        Ok(true)
    }

    /// Move an open position to Closed/Expired and write its closed trade.
    ///
    /// Returns `None` if the position was no longer open at its version.
    pub async fn close_position(
        &mut self,
        position: &Position,
        fill: &ExitFill,
        round_trip_cost: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Option<ClosedTrade>> {
        let transition = Transition::for_exit(fill.reason);
        if !self
            .apply_transition(position, transition, fill.reason.as_str(), None, at)
            .await?
        {
            return Ok(None);
        }

        let pnl = realized_pnl(position, fill.price, round_trip_cost);
        let return_pct = if position.capital_at_risk > Decimal::ZERO {
            (pnl / position.capital_at_risk).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        let result = sqlx::query(
            r#"
            INSERT INTO closed_trades (
                position_id, instrument, direction, pattern_id, exit_price, exit_time,
                exit_reason, realized_pnl, return_pct, run_id, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position.id)
        .bind(&position.instrument)
        .bind(position.direction.as_str())
        .bind(&position.pattern_id)
        .bind(fill.price.to_string())
        .bind(ts(fill.time))
        .bind(fill.reason.as_str())
        .bind(pnl.to_string())
        .bind(return_pct)
        .bind(&self.run_id)
        .bind(ts(at))
        .execute(&mut *self.tx)
        .await?;

        Ok(Some(ClosedTrade {
            id: result.last_insert_rowid(),
            position_id: position.id,
            instrument: position.instrument.clone(),
            direction: position.direction,
            pattern_id: position.pattern_id.clone(),
            exit_price: fill.price,
            exit_time: fill.time,
            exit_reason: fill.reason,
            realized_pnl: pnl,
            return_pct,
        }))
    }

    async fn log_transition(
        &mut self,
        position_id: i64,
        from: Option<PositionStatus>,
        to: PositionStatus,
        reason: &str,
        snapshot: Option<&str>,
        occurred_at: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transitions (position_id, from_status, to_status, reason, snapshot, run_id, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position_id)
        .bind(from.map(|s| s.as_str()))
        .bind(to.as_str())
        .bind(reason)
        .bind(snapshot)
        .bind(&self.run_id)
        .bind(occurred_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Overwrite the portfolio state row.
    pub async fn save_portfolio_state(&mut self, state: &PortfolioState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE portfolio_state SET
                equity = ?,
                high_water_mark = ?,
                open_exposure = ?,
                open_positions = ?,
                realized_pnl = ?,
                consecutive_losses = ?,
                halted_until = ?,
                breakers_reset_at = ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(state.equity.to_string())
        .bind(state.high_water_mark.to_string())
        .bind(state.open_exposure.to_string())
        .bind(state.open_positions as i64)
        .bind(state.realized_pnl.to_string())
        .bind(state.consecutive_losses as i64)
        .bind(state.halted_until.map(ts))
        .bind(state.breakers_reset_at.map(ts))
        .bind(ts(state.updated_at))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Record an equity curve point.
    pub async fn record_equity_point(&mut self, state: &PortfolioState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_curve (timestamp, equity, open_exposure, drawdown, run_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts(state.updated_at))
        .bind(state.equity.to_string())
        .bind(state.open_exposure.to_string())
        .bind(state.drawdown().to_string())
        .bind(&self.run_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Store an observed bar. The first observation for a day is kept.
    pub async fn record_bar(&mut self, bar: &PriceBar) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO price_bars (instrument, bar_date, open, high, low, close)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bar.instrument)
        .bind(bar.date.format("%Y-%m-%d").to_string())
        .bind(bar.open.to_string())
        .bind(bar.high.to_string())
        .bind(bar.low.to_string())
        .bind(bar.close.to_string())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Save or update a pattern's statistics.
    pub async fn save_pattern_stats(&mut self, stats: &PatternStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pattern_stats (pattern_id, win_rate, win_loss_ratio, trade_count, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(pattern_id) DO UPDATE SET
                win_rate = excluded.win_rate,
                win_loss_ratio = excluded.win_loss_ratio,
                trade_count = excluded.trade_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&stats.pattern_id)
        .bind(stats.win_rate)
        .bind(stats.win_loss_ratio)
        .bind(stats.trade_count as i64)
        .bind(ts(stats.updated_at))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Append a weight adjustment.
    pub async fn insert_weight_adjustment(&mut self, adj: &WeightAdjustment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO weight_adjustments (
                pattern_id, delta, ratio_delta, win_rate_after, ratio_after,
                contributing_trades, watermark_trade_id, run_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&adj.pattern_id)
        .bind(adj.delta)
        .bind(adj.ratio_delta)
        .bind(adj.win_rate_after)
        .bind(adj.ratio_after)
        .bind(adj.contributing_trades as i64)
        .bind(adj.watermark_trade_id)
        .bind(&self.run_id)
        .bind(ts(adj.created_at))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Move the watermark forward. Returns `false` if it is already at or
    /// past `watermark`.
    pub async fn advance_watermark(&mut self, watermark: &Watermark, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feedback_watermark SET
                last_trade_id = ?,
                last_exit_time = ?,
                updated_at = ?
            WHERE id = 1 AND last_trade_id < ?
            "#,
        )
        .bind(watermark.last_trade_id)
        .bind(watermark.last_exit_time.map(ts))
        .bind(ts(at))
        .bind(watermark.last_trade_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Commit every write of this invocation.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

// ==================== Row conversion ====================

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PipelineError::CorruptRow(format!("timestamp {s}: {e}")))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| PipelineError::CorruptRow(format!("decimal {s}: {e}")))
}

fn parse_direction(s: &str) -> Result<Direction> {
    Direction::parse(s).ok_or_else(|| PipelineError::CorruptRow(format!("direction {s}")))
}

impl TryFrom<PositionRow> for Position {
    type Error = PipelineError;

    fn try_from(row: PositionRow) -> Result<Self> {
        let risk_snapshot = row
            .risk_snapshot
            .as_deref()
            .map(serde_json::from_str::<RiskSnapshot>)
            .transpose()
            .map_err(|e| PipelineError::CorruptRow(format!("risk snapshot of {}: {e}", row.id)))?;

        Ok(Position {
            id: row.id,
            signal_key: row.signal_key,
            instrument: row.instrument,
            direction: parse_direction(&row.direction)?,
            pattern_id: row.pattern_id,
            regime: Regime::parse(&row.regime)
                .ok_or_else(|| PipelineError::CorruptRow(format!("regime {}", row.regime)))?,
            sector: row.sector,
            quantity: parse_decimal(&row.quantity)?,
            capital_at_risk: parse_decimal(&row.capital_at_risk)?,
            entry_price: parse_decimal(&row.entry_price)?,
            entry_time: parse_time(&row.entry_time)?,
            stop_loss: parse_decimal(&row.stop_loss)?,
            target: parse_decimal(&row.target)?,
            expires_at: parse_time(&row.expires_at)?,
            status: PositionStatus::parse(&row.status)
                .ok_or_else(|| PipelineError::CorruptRow(format!("status {}", row.status)))?,
            reason: row.reason,
            risk_snapshot,
            version: row.version,
        })
    }
}

impl TryFrom<ClosedTradeRow> for ClosedTrade {
    type Error = PipelineError;

    fn try_from(row: ClosedTradeRow) -> Result<Self> {
        Ok(ClosedTrade {
            id: row.id,
            position_id: row.position_id,
            instrument: row.instrument,
            direction: parse_direction(&row.direction)?,
            pattern_id: row.pattern_id,
            exit_price: parse_decimal(&row.exit_price)?,
            exit_time: parse_time(&row.exit_time)?,
            exit_reason: ExitReason::parse(&row.exit_reason)
                .ok_or_else(|| PipelineError::CorruptRow(format!("exit reason {}", row.exit_reason)))?,
            realized_pnl: parse_decimal(&row.realized_pnl)?,
            return_pct: row.return_pct,
        })
    }
}

impl TryFrom<PortfolioRow> for PortfolioState {
    type Error = PipelineError;

    fn try_from(row: PortfolioRow) -> Result<Self> {
        Ok(PortfolioState {
            initial_equity: parse_decimal(&row.initial_equity)?,
            equity: parse_decimal(&row.equity)?,
            high_water_mark: parse_decimal(&row.high_water_mark)?,
            open_exposure: parse_decimal(&row.open_exposure)?,
            open_positions: row.open_positions as u32,
            realized_pnl: parse_decimal(&row.realized_pnl)?,
            consecutive_losses: row.consecutive_losses as u32,
            halted_until: row.halted_until.as_deref().map(parse_time).transpose()?,
            breakers_reset_at: row.breakers_reset_at.as_deref().map(parse_time).transpose()?,
            updated_at: parse_time(&row.updated_at)?,
        })
    }
}

impl TryFrom<PatternRow> for PatternStats {
    type Error = PipelineError;

    fn try_from(row: PatternRow) -> Result<Self> {
        Ok(PatternStats {
            pattern_id: row.pattern_id,
            win_rate: row.win_rate,
            win_loss_ratio: row.win_loss_ratio,
            trade_count: row.trade_count as u32,
            updated_at: parse_time(&row.updated_at)?,
        })
    }
}

impl TryFrom<AdjustmentRow> for WeightAdjustment {
    type Error = PipelineError;

    fn try_from(row: AdjustmentRow) -> Result<Self> {
        Ok(WeightAdjustment {
            pattern_id: row.pattern_id,
            delta: row.delta,
            ratio_delta: row.ratio_delta,
            win_rate_after: row.win_rate_after,
            ratio_after: row.ratio_after,
            contributing_trades: row.contributing_trades as u32,
            watermark_trade_id: row.watermark_trade_id,
            created_at: parse_time(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    use crate::models::Signal;

    async fn open_ledger() -> (TempDir, TradeLedger) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let ledger = TradeLedger::open(&url, dec!(100000)).await.unwrap();
        (dir, ledger)
    }

    fn signal(instrument: &str) -> Signal {
        Signal {
            instrument: instrument.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap(),
            direction: Direction::Long,
            pattern_id: "hammer".to_string(),
            confidence: 0.7,
            entry_price: dec!(100),
            stop_loss: dec!(95),
            target: dec!(110),
            regime: Regime::Trending,
            sector: None,
            horizon_days: None,
            prior_win_rate: None,
            prior_win_loss_ratio: None,
        }
    }

    async fn open_position(ledger: &TradeLedger, instrument: &str) -> Position {
        let s = signal(instrument);
        let mut position = Position::pending(&s, dec!(50), dec!(5000), s.timestamp);
        let at = Utc::now();

        let mut tx = ledger.begin("run-1").await.unwrap();
        position.id = tx.insert_position(&position, "{}", at).await.unwrap();
        assert!(tx
            .apply_transition(&position, Transition::Open, "Accepted", None, at)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        ledger.position(position.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_open_position_round_trip() {
        let (_dir, ledger) = open_ledger().await;
        let position = open_position(&ledger, "TCS").await;

        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.version, 1);
        assert_eq!(position.capital_at_risk, dec!(5000));

        let log = ledger.transitions(position.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].from_status, None);
        assert_eq!(log[1].to_status, "open");
    }

    #[tokio::test]
    async fn test_stale_transition_is_skipped() {
        let (_dir, ledger) = open_ledger().await;
        let position = open_position(&ledger, "TCS").await;
        let fill = ExitFill {
            price: dec!(95),
            time: Utc::now(),
            reason: ExitReason::StopLoss,
        };

        let mut tx = ledger.begin("run-2").await.unwrap();
        assert!(tx.close_position(&position, &fill, Decimal::ZERO, Utc::now()).await.unwrap().is_some());
        // Same snapshot again inside the same invocation
        assert!(tx.close_position(&position, &fill, Decimal::ZERO, Utc::now()).await.unwrap().is_none());
        tx.commit().await.unwrap();

        let trades = ledger.closed_trades_after(0).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].realized_pnl, dec!(-250));
        assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
    }

    #[tokio::test]
    async fn test_illegal_transition_errors() {
        let (_dir, ledger) = open_ledger().await;
        let position = open_position(&ledger, "TCS").await;

        let mut tx = ledger.begin("run-3").await.unwrap();
        let err = tx
            .apply_transition(&position, Transition::Reject, "late", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_unique_open_index() {
        let (_dir, ledger) = open_ledger().await;
        open_position(&ledger, "TCS").await;

        // Different signal, same instrument and direction
        let mut s = signal("TCS");
        s.timestamp = s.timestamp + chrono::Duration::days(1);
        let mut dup = Position::pending(&s, dec!(1), dec!(100), s.timestamp);

        let mut tx = ledger.begin("run-4").await.unwrap();
        dup.id = tx.insert_position(&dup, "{}", Utc::now()).await.unwrap();
        let err = tx
            .apply_transition(&dup, Transition::Open, "Accepted", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let (_dir, ledger) = open_ledger().await;
        let s = signal("INFY");
        let position = Position::pending(&s, dec!(10), dec!(1000), s.timestamp);

        {
            let mut tx = ledger.begin("run-5").await.unwrap();
            tx.insert_position(&position, "{}", Utc::now()).await.unwrap();
        }

        assert!(ledger.known_signal_keys(&[s.key()]).await.unwrap().is_empty());
        assert!(ledger.status_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watermark_only_advances() {
        let (_dir, ledger) = open_ledger().await;
        let wm = Watermark {
            last_trade_id: 5,
            last_exit_time: Some(Utc::now()),
        };

        let mut tx = ledger.begin("fb-1").await.unwrap();
        assert!(tx.advance_watermark(&wm, Utc::now()).await.unwrap());
        assert!(!tx
            .advance_watermark(&Watermark { last_trade_id: 3, last_exit_time: None }, Utc::now())
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert_eq!(ledger.watermark().await.unwrap().last_trade_id, 5);
    }

    #[tokio::test]
    async fn test_recent_closes_oldest_first() {
        let (_dir, ledger) = open_ledger().await;
        let mut tx = ledger.begin("mon-1").await.unwrap();
        for day in 1..=5u32 {
            let close = Decimal::from(100 + day);
            tx.record_bar(&PriceBar {
                instrument: "TCS".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
                open: close,
                high: close,
                low: close,
                close,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let closes = ledger.recent_closes("TCS", 3).await.unwrap();
        assert_eq!(closes.len(), 3);
        assert_eq!(closes[0].0, NaiveDate::from_ymd_opt(2025, 3, 3).unwrap());
        assert_eq!(closes[2].1, 105.0);
    }
}
