//! Daily OHLC bar from the price feed.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One daily bar for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub instrument: String,
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl PriceBar {
    /// Bars with inverted ranges or non-positive prices are feed errors.
    pub fn is_consistent(&self) -> bool {
        self.low > Decimal::ZERO
            && self.low <= self.high
            && self.open >= self.low
            && self.open <= self.high
            && self.close >= self.low
            && self.close <= self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_inconsistent_bar() {
        let mut bar = PriceBar {
            instrument: "SBIN".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 11).unwrap(),
            open: dec!(100),
            high: dec!(112),
            low: dec!(90),
            close: dec!(101),
        };
        assert!(bar.is_consistent());

        bar.low = dec!(113);
        assert!(!bar.is_consistent());
    }
}
