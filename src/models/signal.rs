//! Scored trade signal as handed over by the upstream signal producer.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "Long", alias = "LONG", alias = "bullish", alias = "BULLISH")]
    Long,
    #[serde(alias = "Short", alias = "SHORT", alias = "bearish", alias = "BEARISH")]
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" | "bullish" => Some(Self::Long),
            "short" | "bearish" => Some(Self::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market regime label attached by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    #[serde(alias = "Trending")]
    Trending,
    #[serde(alias = "MeanReverting")]
    MeanReverting,
    #[serde(alias = "Volatile")]
    Volatile,
    #[serde(alias = "Crisis")]
    Crisis,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::MeanReverting => "mean_reverting",
            Self::Volatile => "volatile",
            Self::Crisis => "crisis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trending" => Some(Self::Trending),
            "mean_reverting" | "meanreverting" => Some(Self::MeanReverting),
            "volatile" => Some(Self::Volatile),
            "crisis" => Some(Self::Crisis),
            _ => None,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scored candidate trade. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signal {
    /// Instrument identifier (ticker)
    pub instrument: String,

    /// When the producer issued the signal
    pub timestamp: DateTime<Utc>,

    pub direction: Direction,

    /// Originating pattern or rule
    pub pattern_id: String,

    /// Producer confidence in [0, 1]
    pub confidence: f64,

    /// Reference close the signal was scored against
    pub entry_price: Decimal,

    pub stop_loss: Decimal,

    pub target: Decimal,

    pub regime: Regime,

    /// Sector tag used for concentration limits
    #[serde(default)]
    pub sector: Option<String>,

    /// Holding horizon in trading days
    #[serde(default)]
    pub horizon_days: Option<u32>,

    /// Producer's historical win rate for this pattern
    #[serde(default)]
    pub prior_win_rate: Option<f64>,

    /// Producer's historical average win / average loss
    #[serde(default)]
    pub prior_win_loss_ratio: Option<f64>,
}

impl Signal {
    /// Stable identity used to make repeated runs idempotent.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.instrument,
            self.direction,
            self.pattern_id,
            self.timestamp.to_rfc3339()
        )
    }

    /// Distance from entry to stop, always positive for a valid signal.
    pub fn stop_distance(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }

    /// Holding horizon in trading days, falling back to `default`.
    pub fn horizon(&self, default: u32, max: u32) -> Result<u32, ValidationError> {
        let days = self.horizon_days.unwrap_or(default);
        if days == 0 || days > max {
            return Err(ValidationError::HorizonOutOfRange { days, max });
        }
        Ok(days)
    }

    /// Structural checks: non-empty identifiers, confidence and priors in
    /// range, positive prices and exit levels on the correct side of entry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.instrument.trim().is_empty() {
            return Err(ValidationError::EmptyField("instrument"));
        }
        if self.pattern_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("pattern_id"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(self.confidence));
        }

        match (self.prior_win_rate, self.prior_win_loss_ratio) {
            (None, None) => {}
            (Some(win_rate), Some(ratio)) => {
                if !(0.0..=1.0).contains(&win_rate) {
                    return Err(ValidationError::PriorOutOfRange {
                        field: "prior_win_rate",
                        value: win_rate,
                    });
                }
                if !(ratio.is_finite() && ratio > 0.0) {
                    return Err(ValidationError::PriorOutOfRange {
                        field: "prior_win_loss_ratio",
                        value: ratio,
                    });
                }
            }
            _ => return Err(ValidationError::IncompletePriors),
        }

        for (name, price) in [
            ("entry_price", self.entry_price),
            ("stop_loss", self.stop_loss),
            ("target", self.target),
        ] {
            if price <= Decimal::ZERO {
                return Err(ValidationError::NonPositivePrice(name));
            }
        }

        let ordered = match self.direction {
            Direction::Long => self.stop_loss < self.entry_price && self.entry_price < self.target,
            Direction::Short => self.target < self.entry_price && self.entry_price < self.stop_loss,
        };
        if !ordered {
            return Err(ValidationError::LevelsInconsistent {
                direction: self.direction.to_string(),
                entry: self.entry_price.to_string(),
                stop: self.stop_loss.to_string(),
                target: self.target.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_producer_aliases() {
        let json = r#"{
            "instrument": "RELIANCE",
            "timestamp": "2025-03-10T15:30:00Z",
            "direction": "bullish",
            "pattern_id": "hammer",
            "confidence": 0.72,
            "entry_price": "100.0",
            "stop_loss": "95.0",
            "target": "110.0",
            "regime": "Trending"
        }"#;

        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.regime, Regime::Trending);
        assert_eq!(signal.stop_distance(), dec!(5));
        assert!(signal.sector.is_none());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{
            "instrument": "TCS",
            "timestamp": "2025-03-10T15:30:00Z",
            "direction": "long",
            "pattern_id": "engulfing",
            "confidence": 0.6,
            "entry_price": "100",
            "stop_loss": "95",
            "target": "110",
            "regime": "trending",
            "leverage": 5
        }"#;

        assert!(serde_json::from_str::<Signal>(json).is_err());
    }

    #[test]
    fn test_key_is_stable() {
        let json = r#"{
            "instrument": "TCS",
            "timestamp": "2025-03-10T15:30:00Z",
            "direction": "short",
            "pattern_id": "shooting_star",
            "confidence": 0.6,
            "entry_price": "100",
            "stop_loss": "105",
            "target": "90",
            "regime": "volatile"
        }"#;
        let a: Signal = serde_json::from_str(json).unwrap();
        let b = a.clone();

        assert_eq!(a.key(), b.key());
        assert!(a.key().starts_with("TCS:short:shooting_star:"));
    }

    #[test]
    fn test_validate_levels() {
        let json = r#"{
            "instrument": "TCS",
            "timestamp": "2025-03-10T15:30:00Z",
            "direction": "long",
            "pattern_id": "hammer",
            "confidence": 0.6,
            "entry_price": "100",
            "stop_loss": "95",
            "target": "110",
            "regime": "trending"
        }"#;
        let mut signal: Signal = serde_json::from_str(json).unwrap();
        assert!(signal.validate().is_ok());

        // Long with the stop above entry
        signal.stop_loss = dec!(101);
        assert_eq!(signal.validate().unwrap_err().code(), "LevelsInconsistent");

        signal.stop_loss = dec!(95);
        signal.confidence = 1.4;
        assert_eq!(signal.validate().unwrap_err().code(), "ConfidenceOutOfRange");

        signal.confidence = 0.6;
        signal.instrument = " ".to_string();
        assert_eq!(signal.validate(), Err(ValidationError::EmptyField("instrument")));
    }

    #[test]
    fn test_validate_priors() {
        let json = r#"{
            "instrument": "TCS",
            "timestamp": "2025-03-10T15:30:00Z",
            "direction": "long",
            "pattern_id": "hammer",
            "confidence": 0.6,
            "entry_price": "100",
            "stop_loss": "95",
            "target": "110",
            "regime": "trending",
            "prior_win_rate": 7.5,
            "prior_win_loss_ratio": 1.5
        }"#;
        let mut signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.validate().unwrap_err().code(), "PriorOutOfRange");

        signal.prior_win_rate = Some(0.55);
        assert!(signal.validate().is_ok());

        signal.prior_win_loss_ratio = Some(0.0);
        assert_eq!(signal.validate().unwrap_err().code(), "PriorOutOfRange");

        signal.prior_win_loss_ratio = None;
        assert_eq!(signal.validate(), Err(ValidationError::IncompletePriors));
    }

    #[test]
    fn test_horizon_bounds() {
        let json = r#"{
            "instrument": "TCS",
            "timestamp": "2025-03-10T15:30:00Z",
            "direction": "long",
            "pattern_id": "hammer",
            "confidence": 0.6,
            "entry_price": "100",
            "stop_loss": "95",
            "target": "110",
            "regime": "trending",
            "horizon_days": 4000000000
        }"#;
        let mut signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(
            signal.horizon(5, 60),
            Err(ValidationError::HorizonOutOfRange { days: 4_000_000_000, max: 60 })
        );

        signal.horizon_days = Some(0);
        assert!(signal.horizon(5, 60).is_err());

        signal.horizon_days = None;
        assert_eq!(signal.horizon(5, 60), Ok(5));
    }
}
