//! Paper-Trading Execution Pipeline
//!
//! Turns daily pattern signals into sized paper positions, tracks them to
//! exit against daily bars, and feeds closed-trade outcomes back into the
//! per-pattern statistics used for sizing.

mod api;
mod db;
mod error;
mod lock;
mod metrics;
mod models;
mod pipeline;
mod trading;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{HttpPriceFeed, JsonFileSignalSource};
use crate::error::{PipelineError, EXIT_PARTIAL};
use crate::pipeline::{Pipeline, PipelineConfig};

/// Paper-trading pipeline CLI.
#[derive(Parser)]
#[command(name = "papertrader")]
#[command(about = "Size, track and learn from paper trades on daily pattern signals", long_about = None)]
struct Cli {
    /// Ledger database URL
    #[arg(short, long, env = "PAPER_DB_URL", default_value = "sqlite:./papertrader.db")]
    database: String,

    /// JSON configuration file (defaults apply to missing fields)
    #[arg(short, long, env = "PAPER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for per-entry-point lock files
    #[arg(long, env = "PAPER_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Size and gate the day's signals, opening accepted positions
    Run {
        /// Signal file written by the producer
        #[arg(short, long, env = "PAPER_SIGNALS")]
        signals: PathBuf,

        /// Trading day to process (default: today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Check open positions against the latest daily bars
    Monitor {
        /// Chart API base URL
        #[arg(long, env = "PAPER_FEED_URL")]
        feed_url: Option<String>,

        /// Exchange suffix appended to instruments (e.g. ".NS")
        #[arg(long, env = "PAPER_SYMBOL_SUFFIX", default_value = "")]
        symbol_suffix: String,

        /// Evaluation time, RFC 3339 (default: now)
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },

    /// Fold new closed trades into pattern statistics
    Feedback {
        /// Also write the updated weights to this JSON file
        #[arg(short, long, env = "PAPER_WEIGHTS_EXPORT")]
        export: Option<PathBuf>,
    },

    /// Show portfolio state and open positions
    Status,

    /// Show one position with its transition history
    Show {
        /// Position id
        id: i64,
    },

    /// Close an open position manually
    Close {
        /// Position id
        id: i64,

        /// Exit price
        #[arg(short, long)]
        price: Decimal,
    },

    /// Rebuild portfolio state from the ledger and report drift
    Reconcile {
        /// Overwrite stored state with the rebuilt one
        #[arg(long)]
        repair: bool,
    },

    /// Clear the loss streak breaker and its cooldown
    ResetBreakers {
        /// Required; without it nothing is changed
        #[arg(long)]
        confirm: bool,
    },

    /// Show current pattern weights
    Weights {
        /// Write the weights to this JSON file instead of printing them
        #[arg(short, long)]
        export: Option<PathBuf>,

        /// Number of recent adjustments to list
        #[arg(long, default_value = "10")]
        history: i64,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Invocation failed: {e:#}");
            let code = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let builder = FmtSubscriber::builder().with_target(false);

    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = builder.with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Run one subcommand and return its exit code.
async fn execute(cli: Cli) -> Result<u8> {
    let mut config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = cli.lock_dir {
        config.lock_dir = dir;
    }

    if let Commands::Config = cli.command {
        let json = serde_json::to_string_pretty(&config)?;
        println!("{}", json);
        return Ok(0);
    }

    let pipeline = Pipeline::open(config, &cli.database)
        .await
        .with_context(|| format!("Failed to open ledger at {}", cli.database))?;

    match cli.command {
        Commands::Run { signals, date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            info!(signals = %signals.display(), %date, "Starting run");

            let source = JsonFileSignalSource::new(signals);
            let summary = pipeline.run(&source, date).await?;
            println!("{}", summary);
        }

        Commands::Monitor {
            feed_url,
            symbol_suffix,
            as_of,
        } => {
            let feed = match feed_url {
                Some(url) => HttpPriceFeed::with_base_url(url)?,
                None => HttpPriceFeed::new()?,
            }
            .with_symbol_suffix(symbol_suffix);

            let summary = pipeline.monitor(&feed, as_of.unwrap_or_else(Utc::now)).await?;
            println!("{}", summary);

            if summary.is_partial() {
                return Ok(EXIT_PARTIAL);
            }
        }

        Commands::Feedback { export } => {
            let summary = pipeline.feedback(export.as_deref()).await?;
            println!("{}", summary);
            if let Some(path) = &summary.exported {
                println!("Weights written to {}", path.display());
            }
        }

        Commands::Status => {
            let report = pipeline.status().await?;
            let state = &report.state;

            println!("\n=== Portfolio ===");
            println!("Equity:           ${:.2}", state.equity);
            println!("Initial:          ${:.2}", state.initial_equity);
            println!("Realized P&L:     ${:.2}", state.realized_pnl);
            println!("High-Water Mark:  ${:.2}", state.high_water_mark);
            println!("Drawdown:         {:.2}%", state.drawdown() * Decimal::ONE_HUNDRED);
            println!("Open Exposure:    ${:.2}", state.open_exposure);
            println!("Loss Streak:      {}", state.consecutive_losses);
            if let Some(until) = state.halted_until {
                println!("Entries Halted:   until {}", until.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!("Updated:          {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

            if let Some(curve) = &report.curve {
                println!("Max Drawdown:     {:.2}%", curve.max * Decimal::ONE_HUNDRED);
            }

            println!("\n=== Ledger ===");
            for (status, count) in &report.status_counts {
                println!("  {:<12} {:>6}", status, count);
            }
            println!("Feedback Watermark: trade #{}", report.watermark.last_trade_id);

            if report.open.is_empty() {
                println!("\nNo open positions.");
                return Ok(0);
            }

            println!(
                "\n{:>6} {:<14} {:<6} {:<16} {:>10} {:>10} {:>10} {:>10} {:<10}",
                "ID", "INSTRUMENT", "DIR", "PATTERN", "QTY", "ENTRY", "STOP", "TARGET", "EXPIRES"
            );
            println!("{}", "-".repeat(102));

            for pos in &report.open {
                println!(
                    "{:>6} {:<14} {:<6} {:<16} {:>10} {:>10.2} {:>10.2} {:>10.2} {:<10}",
                    pos.id,
                    truncate(&pos.instrument, 14),
                    pos.direction.as_str(),
                    truncate(&pos.pattern_id, 16),
                    pos.quantity,
                    pos.entry_price,
                    pos.stop_loss,
                    pos.target,
                    pos.expires_at.format("%Y-%m-%d"),
                );
            }
        }

        Commands::Show { id } => {
            let ledger = pipeline.ledger();
            let pos = ledger
                .position(id)
                .await?
                .ok_or(PipelineError::UnknownPosition(id))?;

            println!("\n=== Position #{} ===", pos.id);
            println!("Signal:      {}", pos.signal_key);
            println!("Instrument:  {} ({})", pos.instrument, pos.direction);
            println!("Pattern:     {} [{}]", pos.pattern_id, pos.regime.as_str());
            println!("Sector:      {}", pos.sector.as_deref().unwrap_or("-"));
            println!("Status:      {}", pos.status);
            println!("Quantity:    {}", pos.quantity);
            println!("Committed:   ${:.2}", pos.capital_at_risk);
            println!("Entry:       {:.2} @ {}", pos.entry_price, pos.entry_time.format("%Y-%m-%d %H:%M"));
            println!("Stop/Target: {:.2} / {:.2}", pos.stop_loss, pos.target);
            println!("Expires:     {}", pos.expires_at.format("%Y-%m-%d"));

            if let Some(trade) = ledger.closed_trade_for(pos.id).await? {
                println!("\n--- Exit ---");
                println!("Reason:      {}", trade.exit_reason);
                println!("Price:       {:.2} @ {}", trade.exit_price, trade.exit_time.format("%Y-%m-%d %H:%M"));
                println!("P&L:         ${:.2} ({:.2}%)", trade.realized_pnl, trade.return_pct * 100.0);
            }

            println!("\n--- Transitions ---");
            for t in ledger.transitions(pos.id).await? {
                println!(
                    "  {}  {:<8} -> {:<8} {:<28} run {}",
                    t.occurred_at,
                    t.from_status.as_deref().unwrap_or("-"),
                    t.to_status,
                    truncate(&t.reason, 28),
                    truncate(&t.run_id, 8)
                );
            }
        }

        Commands::Close { id, price } => {
            let trade = pipeline.close_position(id, price, Utc::now()).await?;
            println!(
                "Closed position #{} at {:.2}: P&L ${:.2}",
                id, trade.exit_price, trade.realized_pnl
            );
        }

        Commands::Reconcile { repair } => {
            let report = pipeline.reconcile(repair).await?;
            let drift = report.drift();

            println!("\n{:<18} {:>16} {:>16}", "FIELD", "STORED", "LEDGER");
            println!("{}", "-".repeat(52));
            println!("{:<18} {:>16.2} {:>16.2}", "equity", report.stored.equity, report.derived.equity);
            println!("{:<18} {:>16.2} {:>16.2}", "high_water_mark", report.stored.high_water_mark, report.derived.high_water_mark);
            println!("{:<18} {:>16.2} {:>16.2}", "realized_pnl", report.stored.realized_pnl, report.derived.realized_pnl);
            println!("{:<18} {:>16.2} {:>16.2}", "open_exposure", report.stored.open_exposure, report.derived.open_exposure);
            println!("{:<18} {:>16} {:>16}", "open_positions", report.stored.open_positions, report.derived.open_positions);
            println!("{:<18} {:>16} {:>16}", "consecutive_losses", report.stored.consecutive_losses, report.derived.consecutive_losses);

            if drift.is_empty() {
                println!("\nPortfolio state matches the ledger.");
            } else if repair {
                println!("\nRepaired: {}", drift.join(", "));
            } else {
                println!("\nDrift in: {} (rerun with --repair to fix)", drift.join(", "));
            }
        }

        Commands::ResetBreakers { confirm } => match pipeline.reset_breakers(confirm).await? {
            Some(state) => println!(
                "Breakers reset at {}. Loss streak cleared, new entries allowed.",
                state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => println!("Nothing changed. Rerun with --confirm to clear the loss streak breaker."),
        },

        Commands::Weights { export, history } => {
            if let Some(path) = export {
                let count = pipeline.export_weights(&path).await?;
                println!("Wrote {} pattern weights to {}", count, path.display());
                return Ok(0);
            }

            let mut stats: Vec<_> = pipeline.ledger().pattern_stats().await?.into_values().collect();
            if stats.is_empty() {
                println!("No learned pattern statistics yet. Run 'papertrader feedback' after trades close.");
                return Ok(0);
            }
            stats.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));

            println!(
                "\n{:<24} {:>8} {:>8} {:>8} {:>8}",
                "PATTERN", "WIN%", "W/L", "TRADES", "EDGE"
            );
            println!("{}", "-".repeat(60));
            for s in &stats {
                println!(
                    "{:<24} {:>7.1}% {:>8.2} {:>8} {:>8.3}",
                    truncate(&s.pattern_id, 24),
                    s.win_rate * 100.0,
                    s.win_loss_ratio,
                    s.trade_count,
                    s.edge()
                );
            }

            let adjustments = pipeline.ledger().weight_adjustments(history).await?;
            if !adjustments.is_empty() {
                println!("\n--- Recent Adjustments ---");
                for adj in adjustments {
                    println!(
                        "  {} {:<20} win {:+.4} -> {:.3}  w/l {:+.4} -> {:.3}  ({} trades, up to #{})",
                        adj.created_at.format("%Y-%m-%d %H:%M"),
                        truncate(&adj.pattern_id, 20),
                        adj.delta,
                        adj.win_rate_after,
                        adj.ratio_delta,
                        adj.ratio_after,
                        adj.contributing_trades,
                        adj.watermark_trade_id
                    );
                }
            }
        }

        // Printed before the ledger is opened
        Commands::Config => {}
    }

    Ok(0)
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
