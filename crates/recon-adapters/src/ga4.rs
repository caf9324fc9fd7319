use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{attr, DateRange, Ga4Config, Origin, RawRecord};
use recon_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::{info, info_span, Instrument};

use crate::{expect_array, AdapterError, SourceAdapter};

const API_BASE: &str = "https://analyticsdata.googleapis.com/v1beta";
const PAGE_SIZE: u64 = 10_000;

/// GA4 Data API `runReport` over purchase events, offset-paged.
#[derive(Debug)]
pub struct Ga4Adapter {
    connector_id: String,
    config: Ga4Config,
    http: Arc<HttpFetcher>,
}

impl Ga4Adapter {
    pub fn new(connector_id: String, config: Ga4Config, http: Arc<HttpFetcher>) -> Self {
        Self {
            connector_id,
            config,
            http,
        }
    }

    fn report_request(range: &DateRange, offset: u64) -> JsonValue {
        json!({
            "dateRanges": [{
                "startDate": range.start.to_string(),
                "endDate": range.end.to_string(),
            }],
            "dimensions": [
                {"name": "transactionId"},
                {"name": "date"},
                {"name": "browser"},
                {"name": "deviceCategory"},
            ],
            "metrics": [{"name": "purchaseRevenue"}],
            "limit": PAGE_SIZE,
            "offset": offset,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ga4Page {
    pub records: Vec<RawRecord>,
    /// Total rows of the report across all pages.
    pub row_count: u64,
}

fn cell(row: &JsonValue, group: &str, index: usize) -> Option<String> {
    row.get(group)?
        .get(index)?
        .get("value")?
        .as_str()
        .map(str::to_string)
}

/// A `runReport` response body. Dimension order follows the request.
pub fn parse_ga4_report(payload: &JsonValue) -> Result<Ga4Page, AdapterError> {
    if !payload.is_object() {
        return Err(AdapterError::Malformed("ga4 report is not an object".into()));
    }
    // GA4 omits `rows` entirely for an empty report.
    let rows: &[JsonValue] = match payload.get("rows") {
        Some(rows) => expect_array(rows, "ga4 rows")?.as_slice(),
        None => &[],
    };
    let row_count = payload
        .get("rowCount")
        .and_then(JsonValue::as_u64)
        .unwrap_or(rows.len() as u64);

    let records = rows
        .iter()
        .map(|row| {
            let value = cell(row, "metricValues", 0)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null);
            let mut record = RawRecord::new(cell(row, "dimensionValues", 0).unwrap_or_default(), value);
            record.date = cell(row, "dimensionValues", 1);
            if let Some(browser) = cell(row, "dimensionValues", 2) {
                record = record.with_attribute(attr::BROWSER, browser);
            }
            if let Some(device) = cell(row, "dimensionValues", 3) {
                record = record.with_attribute(attr::DEVICE, device);
            }
            record
        })
        .collect();

    Ok(Ga4Page { records, row_count })
}

#[async_trait]
impl SourceAdapter for Ga4Adapter {
    fn connector_id(&self) -> &str {
        &self.connector_id
    }

    fn origin(&self) -> Origin {
        Origin::Analytics
    }

    async fn fetch(&self, range: &DateRange) -> Result<Vec<RawRecord>, AdapterError> {
        let url = format!("{API_BASE}/properties/{}:runReport", self.config.property_id);
        let span = info_span!("ga4_fetch", connector_id = %self.connector_id, %range);

        async move {
            let mut records = Vec::new();
            let mut offset = 0u64;
            loop {
                let request = self
                    .http
                    .client()
                    .post(&url)
                    .bearer_auth(&self.config.access_token)
                    .json(&Self::report_request(range, offset));
                let resp = self.http.send(&self.connector_id, request).await?;
                let payload: JsonValue = resp.json()?;
                let page = parse_ga4_report(&payload)?;
                let received = page.records.len() as u64;
                records.extend(page.records);
                offset += received;
                if received == 0 || offset >= page.row_count {
                    break;
                }
            }
            info!(rows = records.len(), "ga4 purchase rows fetched");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}
