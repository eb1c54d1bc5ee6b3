//! External data: upstream signals, daily price bars, and the retry policy
//! wrapped around both.

mod price_feed;
mod retry;
mod signal_source;
mod types;

#[cfg(test)]
pub mod fakes;

pub use price_feed::{HttpPriceFeed, PriceFeed};
pub use retry::RetryPolicy;
pub use signal_source::{JsonFileSignalSource, SignalSource};
