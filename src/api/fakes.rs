//! In-memory feeds for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::error::FeedError;
use crate::models::PriceBar;

use super::{PriceFeed, SignalSource};

/// Fixed signal list, or a fixed failure.
pub struct VecSignalSource {
    signals: Vec<Value>,
    failure: Option<FeedError>,
    pub calls: AtomicU32,
}

impl VecSignalSource {
    pub fn new(signals: Vec<Value>) -> Self {
        Self {
            signals,
            failure: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: FeedError) -> Self {
        Self {
            signals: Vec::new(),
            failure: Some(error),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SignalSource for VecSignalSource {
    async fn signals_for(&self, _date: NaiveDate) -> Result<Vec<Value>, FeedError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(self.signals.clone()),
        }
    }
}

/// Bars per instrument; instruments marked failing always error.
#[derive(Default)]
pub struct StaticPriceFeed {
    bars: Mutex<HashMap<String, Vec<PriceBar>>>,
    failing: Mutex<HashMap<String, FeedError>>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bar, replacing any bar for the same instrument and date.
    pub fn set_bar(&self, bar: PriceBar) {
        if let Ok(mut bars) = self.bars.lock() {
            let series = bars.entry(bar.instrument.clone()).or_default();
            series.retain(|b| b.date != bar.date);
            series.push(bar);
            series.sort_by_key(|b| b.date);
        }
    }

    pub fn fail(&self, instrument: &str, error: FeedError) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(instrument.to_string(), error);
        }
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn daily_bars(
        &self,
        instrument: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>, FeedError> {
        if let Some(e) = self.failing.lock().ok().and_then(|f| f.get(instrument).cloned()) {
            return Err(e);
        }
        let bars: Vec<PriceBar> = self
            .bars
            .lock()
            .ok()
            .and_then(|b| b.get(instrument).cloned())
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.date >= from && b.date <= to)
            .collect();
        if bars.is_empty() {
            return Err(FeedError::NoData(instrument.to_string()));
        }
        Ok(bars)
    }
}
