//! Bounded exponential-backoff retry for feed calls.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FeedError, PipelineError};

/// Retry settings applied at every SignalSource / PriceFeed call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,

    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval_ms: 500,
            multiplier: 2.0,
            max_interval_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits long.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: 1,
            multiplier: 1.0,
            max_interval_ms: 1,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Transient failures that exhaust the budget become
    /// [`PipelineError::TransientData`]; permanent ones become
    /// [`PipelineError::Feed`] without further attempts.
    pub async fn run<T, F, Fut>(&self, item: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FeedError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let attempts = AtomicU32::new(0);

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_multiplier(self.multiplier)
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_max_elapsed_time(None)
            .build();

        let result = backoff::future::retry_notify(
            backoff,
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let call = op();
                async move {
                    call.await.map_err(|e| {
                        if e.is_transient() && attempt < max_attempts {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: FeedError, wait: Duration| {
                warn!(
                    item,
                    error = %e,
                    retry_in_ms = wait.as_millis() as u64,
                    "Feed call failed, retrying"
                );
            },
        )
        .await;

        result.map_err(|source| {
            let attempts = attempts.load(Ordering::Relaxed);
            if source.is_transient() {
                PipelineError::TransientData {
                    item: item.to_string(),
                    attempts,
                    source,
                }
            } else {
                PipelineError::Feed {
                    item: item.to_string(),
                    source,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = RetryPolicy::immediate(4)
            .run("TCS", move || async move {
                if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(FeedError::RateLimited)
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(tokio_test::assert_ok!(value), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let err = RetryPolicy::immediate(3)
            .run("INFY", || async { Err::<(), _>(FeedError::Upstream(503)) })
            .await
            .unwrap_err();

        match err {
            PipelineError::TransientData { item, attempts, .. } => {
                assert_eq!(item, "INFY");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = RetryPolicy::immediate(5)
            .run("XYZ", move || async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err::<(), _>(FeedError::NoData("XYZ".into()))
            })
            .await;

        tokio_test::assert_err!(&result);
        assert!(matches!(result, Err(PipelineError::Feed { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
