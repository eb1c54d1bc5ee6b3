//! Trading logic: position sizing, risk gate, position lifecycle, feedback.

mod config;
mod feedback;
mod position_sizer;
mod risk_manager;
mod state_machine;

pub use config::{RegimeMultipliers, TradingConfig};
pub use feedback::{FeedbackConfig, FeedbackEngine, FeedbackPlan, PatternUpdate, WindowUsage};
pub use position_sizer::{
    PositionSizer, SizedCandidate, SizingOutcome, SizingReason, SizingStats, StatsSource,
};
pub use risk_manager::{
    BreakerChange, OpenExposure, PortfolioSnapshot, RejectReason, RiskCandidate, RiskConfig,
    RiskDecision, RiskManager,
};
pub use state_machine::{evaluate_exit, expiry_deadline, next_status, realized_pnl, Transition};
