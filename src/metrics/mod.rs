//! Portfolio and outcome statistics.

mod calculator;

pub use calculator::{DrawdownStats, MetricsCalculator, OutcomeStats};
