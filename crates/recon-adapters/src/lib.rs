//! Data-source adapters: commerce backends, GA4 and local fixture files.

mod fixture;
mod ga4;
mod shopify;
mod woocommerce;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{ConfigError, DateRange, Origin, RawRecord, SourceConfig};
use recon_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use fixture::FixtureAdapter;
pub use ga4::{parse_ga4_report, Ga4Adapter, Ga4Page};
pub use shopify::{next_link, parse_shopify_orders, ShopifyAdapter};
pub use woocommerce::{parse_woocommerce_orders, WooCommerceAdapter};

pub const CRATE_NAME: &str = "recon-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Fixture {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("connector config rejected: {0}")]
    Config(#[from] ConfigError),
}

impl AdapterError {
    /// Anything that went wrong talking to a source is worth another attempt;
    /// a rejected config will be rejected again.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            AdapterError::Config(_) => RetryDisposition::NonRetryable,
            AdapterError::Fetch(_) | AdapterError::Fixture { .. } | AdapterError::Malformed(_) => {
                RetryDisposition::Retryable
            }
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn connector_id(&self) -> &str;

    fn origin(&self) -> Origin;

    /// All records in `range`, both bounds inclusive.
    async fn fetch(&self, range: &DateRange) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Builds adapters from resolved connector configs.
pub trait AdapterFactory: Send + Sync {
    fn build(
        &self,
        connector_id: &str,
        config: SourceConfig,
    ) -> Result<Box<dyn SourceAdapter>, AdapterError>;
}

/// Default factory: HTTP adapters share one fetcher.
#[derive(Debug, Clone)]
pub struct HttpAdapterFactory {
    http: Arc<HttpFetcher>,
}

impl HttpAdapterFactory {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(
        &self,
        connector_id: &str,
        config: SourceConfig,
    ) -> Result<Box<dyn SourceAdapter>, AdapterError> {
        config.validate()?;
        let connector_id = connector_id.to_string();
        let adapter: Box<dyn SourceAdapter> = match config {
            SourceConfig::WooCommerce(cfg) => Box::new(WooCommerceAdapter::new(
                connector_id,
                cfg,
                self.http.clone(),
            )),
            SourceConfig::Shopify(cfg) => {
                Box::new(ShopifyAdapter::new(connector_id, cfg, self.http.clone()))
            }
            SourceConfig::Ga4(cfg) => Box::new(Ga4Adapter::new(connector_id, cfg, self.http.clone())),
            SourceConfig::Fixture(cfg) => Box::new(FixtureAdapter::new(connector_id, cfg)),
        };
        Ok(adapter)
    }
}

/// Top-level payload must be an array of objects.
fn expect_array<'a>(payload: &'a JsonValue, what: &str) -> Result<&'a Vec<JsonValue>, AdapterError> {
    payload
        .as_array()
        .ok_or_else(|| AdapterError::Malformed(format!("{what} is not a list")))
}

fn str_field(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Raw id as text whether the source sends a number or a string. Left untrimmed.
fn id_field(value: &JsonValue, key: &str) -> String {
    match value.get(key) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
