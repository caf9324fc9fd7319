use async_trait::async_trait;
use chrono::NaiveDate;
use recon_core::{DateRange, FixtureConfig, Origin, RawRecord};
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::debug;

use crate::{AdapterError, SourceAdapter};

/// JSON array of raw records on disk, for offline runs and demos.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    connector_id: String,
    config: FixtureConfig,
}

impl FixtureAdapter {
    pub fn new(connector_id: String, config: FixtureConfig) -> Self {
        Self {
            connector_id,
            config,
        }
    }
}

/// Calendar day at the head of `YYYY-MM-DD...` or `YYYYMMDD`.
fn leading_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    raw.get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
        .or_else(|| {
            raw.get(..8)
                .and_then(|head| NaiveDate::parse_from_str(head, "%Y%m%d").ok())
        })
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn connector_id(&self) -> &str {
        &self.connector_id
    }

    fn origin(&self) -> Origin {
        self.config.origin
    }

    /// Records dated outside `range` are skipped; undated ones are kept.
    async fn fetch(&self, range: &DateRange) -> Result<Vec<RawRecord>, AdapterError> {
        let path = &self.config.path;
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| AdapterError::Fixture {
                path: path.clone(),
                source,
            })?;
        let payload: JsonValue = serde_json::from_str(&text)
            .map_err(|err| AdapterError::Malformed(format!("{}: {err}", path.display())))?;
        if !payload.is_array() {
            return Err(AdapterError::Malformed(format!(
                "{} is not a list of records",
                path.display()
            )));
        }
        let records: Vec<RawRecord> = serde_json::from_value(payload)
            .map_err(|err| AdapterError::Malformed(format!("{}: {err}", path.display())))?;
        let total = records.len();
        let records: Vec<RawRecord> = records
            .into_iter()
            .filter(|record| match record.date.as_deref().and_then(leading_date) {
                Some(day) => range.contains(day),
                None => true,
            })
            .collect();
        debug!(
            connector_id = %self.connector_id,
            path = %path.display(),
            total,
            kept = records.len(),
            "fixture records loaded"
        );
        Ok(records)
    }
}
