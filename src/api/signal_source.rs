//! Upstream signal records.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use tracing::debug;

use crate::error::FeedError;

/// Producer of the day's signals.
///
/// Records are returned unparsed so a malformed entry rejects only itself.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Signal records for `date`, in producer order.
    async fn signals_for(&self, date: NaiveDate) -> Result<Vec<Value>, FeedError>;
}

/// Reads a JSON file written by the signal producer.
///
/// Accepts either a top-level array or an object with a `signals` array.
/// Records whose timestamp falls on another day are dropped; records without
/// a readable timestamp are passed through for validation to report.
pub struct JsonFileSignalSource {
    path: PathBuf,
}

impl JsonFileSignalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SignalSource for JsonFileSignalSource {
    async fn signals_for(&self, date: NaiveDate) -> Result<Vec<Value>, FeedError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => FeedError::NoData(self.path.display().to_string()),
            _ => FeedError::Request(format!("{}: {}", self.path.display(), e)),
        })?;

        let records = match serde_json::from_str::<Value>(&raw)
            .map_err(|e| FeedError::Malformed(e.to_string()))?
        {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("signals") {
                Some(Value::Array(items)) => items,
                _ => return Err(FeedError::Malformed("expected a `signals` array".to_string())),
            },
            _ => return Err(FeedError::Malformed("expected an array of signals".to_string())),
        };

        let total = records.len();
        let signals: Vec<Value> = records
            .into_iter()
            .filter(|record| match record_date(record) {
                Some(d) => d == date,
                None => true,
            })
            .collect();

        debug!(
            path = %self.path.display(),
            total,
            for_date = signals.len(),
            "Loaded signal file"
        );

        Ok(signals)
    }
}

fn record_date(record: &Value) -> Option<NaiveDate> {
    let ts = record.get("timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(ts).ok().map(|t| t.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_filters_to_requested_day() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"signals": [
                {{"instrument": "TCS", "timestamp": "2025-03-10T09:30:00Z"}},
                {{"instrument": "INFY", "timestamp": "2025-03-11T09:30:00Z"}},
                {{"instrument": "SBIN"}}
            ]}}"#
        )
        .unwrap();

        let source = JsonFileSignalSource::new(file.path());
        let signals = source
            .signals_for(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
            .await
            .unwrap();

        let names: Vec<_> = signals.iter().map(|s| s["instrument"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["TCS", "SBIN"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonFileSignalSource::new(dir.path().join("absent.json"));
        let err = source
            .signals_for(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, FeedError::NoData(_)));
        assert!(!err.is_transient());
    }
}
