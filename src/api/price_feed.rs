//! Daily OHLC price feed.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::FeedError;
use crate::models::PriceBar;

use super::types::*;

const CHART_API_BASE: &str = "https://query1.finance.yahoo.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of daily bars for an instrument.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Complete bars dated in `from..=to`, oldest first. Never empty.
    async fn daily_bars(
        &self,
        instrument: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>, FeedError>;
}

/// Client for the daily chart endpoint (read-only).
pub struct HttpPriceFeed {
    client: Client,
    base_url: String,
    symbol_suffix: String,
}

impl HttpPriceFeed {
    /// Create a feed against the public chart API.
    pub fn new() -> Result<Self> {
        Self::with_base_url(CHART_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing or a proxy).
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            symbol_suffix: String::new(),
        })
    }

    /// Exchange suffix appended to instruments when building symbols (".NS").
    pub fn with_symbol_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.symbol_suffix = suffix.into();
        self
    }

    fn symbol(&self, instrument: &str) -> String {
        if self.symbol_suffix.is_empty() || instrument.contains('.') {
            instrument.to_string()
        } else {
            format!("{}{}", instrument, self.symbol_suffix)
        }
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn daily_bars(
        &self,
        instrument: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>, FeedError> {
        let start = from.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp());
        let end = to
            .checked_add_days(Days::new(1))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc().timestamp());
        let (Some(start), Some(end)) = (start, end) else {
            return Err(FeedError::NoData(format!("{instrument}: bad range {from}..{to}")));
        };

        let url = format!(
            "{}/v8/finance/chart/{}?period1={}&period2={}&interval=1d",
            self.base_url,
            self.symbol(instrument),
            start,
            end
        );

        debug!(url = %url, "Fetching daily bars");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(FeedError::RateLimited),
            StatusCode::NOT_FOUND => return Err(FeedError::NoData(instrument.to_string())),
            status if !status.is_success() => return Err(FeedError::Upstream(status.as_u16())),
            _ => {}
        }

        let body: ChartResponse = response
            .json()
            .await
            .map_err(|e| FeedError::Malformed(e.to_string()))?;

        parse_bars(instrument, body, from, to)
    }
}

/// Keep the bars with full OHLC dated in `from..=to`.
pub fn parse_bars(
    instrument: &str,
    body: ChartResponse,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<PriceBar>, FeedError> {
    if let Some(err) = body.chart.error {
        return Err(FeedError::NoData(format!(
            "{}: {} {}",
            instrument, err.code, err.description
        )));
    }

    let result = body
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| FeedError::NoData(instrument.to_string()))?;
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let offset = result.meta.gmtoffset;

    let mut bars: Vec<PriceBar> = Vec::new();
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(ts + offset, 0).map(|t| t.date_naive()) else {
            continue;
        };
        if date < from || date > to {
            continue;
        }

        let field = |col: &[Option<f64>]| col.get(i).copied().flatten().and_then(Decimal::from_f64);
        if let (Some(open), Some(high), Some(low), Some(close)) = (
            field(&quote.open),
            field(&quote.high),
            field(&quote.low),
            field(&quote.close),
        ) {
            let bar = PriceBar {
                instrument: instrument.to_string(),
                date,
                open: open.round_dp(4),
                high: high.round_dp(4),
                low: low.round_dp(4),
                close: close.round_dp(4),
            };
            if !bar.is_consistent() {
                return Err(FeedError::Malformed(format!("inconsistent bar for {instrument} on {date}")));
            }
            // A live session can repeat the last day
            match bars.last_mut() {
                Some(last) if last.date == date => *last = bar,
                _ => bars.push(bar),
            }
        }
    }

    if bars.is_empty() {
        return Err(FeedError::NoData(format!("{instrument} between {from} and {to}")));
    }
    Ok(bars)
}
