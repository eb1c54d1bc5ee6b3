//! Data models for signals, positions, closed trades, bars and portfolio state.

mod market;
mod portfolio;
mod position;
mod signal;
mod trade;
mod weights;

pub use market::PriceBar;
pub use portfolio::{PortfolioState, RiskSnapshot};
pub use position::{ExitReason, Position, PositionStatus};
pub use signal::{Direction, Regime, Signal};
pub use trade::{ClosedTrade, ExitFill};
pub use weights::{PatternStats, Watermark, WeightAdjustment};
