//! Error taxonomy for the execution pipeline.
//!
//! Transient data errors are retried and then skipped per item, validation
//! errors drop a single signal, everything else aborts the invocation before
//! its transaction commits.

use thiserror::Error;

use crate::models::PositionStatus;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Exit code for a driver that could not take its lock.
pub const EXIT_CONFLICT: u8 = 75;

/// Exit code for a committed invocation that skipped items on data errors.
pub const EXIT_PARTIAL: u8 = 3;

/// Failure talking to a price feed or signal source.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited by upstream")]
    RateLimited,

    #[error("upstream returned status {0}")]
    Upstream(u16),

    #[error("no data for {0}")]
    NoData(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl FeedError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::RateLimited => true,
            Self::Upstream(status) => *status >= 500,
            Self::NoData(_) | Self::Malformed(_) => false,
        }
    }
}

/// Why a single signal was refused before sizing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed signal: {0}")]
    Malformed(String),

    #[error("field {0} is empty")]
    EmptyField(&'static str),

    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("{0} must be positive")]
    NonPositivePrice(&'static str),

    #[error("stop {stop} and target {target} are on the wrong side of entry {entry} for a {direction} signal")]
    LevelsInconsistent {
        direction: String,
        entry: String,
        stop: String,
        target: String,
    },

    #[error("horizon of {days} trading days outside [1, {max}]")]
    HorizonOutOfRange { days: u32, max: u32 },

    #[error("{field} {value} outside its valid range")]
    PriorOutOfRange { field: &'static str, value: f64 },

    #[error("prior_win_rate and prior_win_loss_ratio must be given together")]
    IncompletePriors,

    #[error("pattern {0} is excluded")]
    ExcludedPattern(String),

    #[error("confidence {confidence} below minimum {min}")]
    BelowMinConfidence { confidence: f64, min: f64 },
}

impl ValidationError {
    /// Stable reason code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "Malformed",
            Self::EmptyField(_) => "EmptyField",
            Self::ConfidenceOutOfRange(_) => "ConfidenceOutOfRange",
            Self::NonPositivePrice(_) => "NonPositivePrice",
            Self::LevelsInconsistent { .. } => "LevelsInconsistent",
            Self::HorizonOutOfRange { .. } => "HorizonOutOfRange",
            Self::PriorOutOfRange { .. } => "PriorOutOfRange",
            Self::IncompletePriors => "IncompletePriors",
            Self::ExcludedPattern(_) => "ExcludedPattern",
            Self::BelowMinConfidence { .. } => "BelowMinConfidence",
        }
    }
}

/// Pipeline-level failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient data error for {item} after {attempts} attempt(s): {source}")]
    TransientData {
        item: String,
        attempts: u32,
        #[source]
        source: FeedError,
    },

    #[error("data error for {item}: {source}")]
    Feed {
        item: String,
        #[source]
        source: FeedError,
    },

    #[error("invalid signal {signal}: {reason}")]
    Validation {
        signal: String,
        reason: ValidationError,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("corrupt ledger row: {0}")]
    CorruptRow(String),

    #[error("position {0} not found")]
    UnknownPosition(i64),

    #[error("illegal transition {from} -> {to} for position {position_id}")]
    IllegalTransition {
        position_id: i64,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("{entry_point} is already running ({holder})")]
    ConcurrencyConflict { entry_point: String, holder: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Stable reason code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientData { .. } => "TransientData",
            Self::Feed { .. } => "PermanentData",
            Self::Validation { reason, .. } => reason.code(),
            Self::Persistence(_) => "Persistence",
            Self::CorruptRow(_) => "CorruptRow",
            Self::UnknownPosition(_) => "UnknownPosition",
            Self::IllegalTransition { .. } => "IllegalTransition",
            Self::ConcurrencyConflict { .. } => "ConcurrencyConflict",
            Self::Io(_) => "Io",
            Self::Config(_) => "Config",
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConcurrencyConflict { .. } => EXIT_CONFLICT,
            _ => 1,
        }
    }
}
