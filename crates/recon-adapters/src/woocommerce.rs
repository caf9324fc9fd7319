use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{attr, DateRange, Origin, RawRecord, WooCommerceConfig};
use recon_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};

use crate::{expect_array, id_field, str_field, AdapterError, SourceAdapter};

const PER_PAGE: usize = 100;
const MAX_PAGES: u32 = 100;

/// WooCommerce REST `wc/v3/orders`, paged by `page` until a short page.
#[derive(Debug)]
pub struct WooCommerceAdapter {
    connector_id: String,
    config: WooCommerceConfig,
    http: Arc<HttpFetcher>,
}

impl WooCommerceAdapter {
    pub fn new(connector_id: String, config: WooCommerceConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            connector_id,
            config,
            http,
        }
    }
}

/// One page of the orders endpoint into raw records.
pub fn parse_woocommerce_orders(payload: &JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
    let orders = expect_array(payload, "woocommerce orders page")?;
    Ok(orders
        .iter()
        .map(|order| {
            let mut record = RawRecord::new(
                id_field(order, "id"),
                order.get("total").cloned().unwrap_or(JsonValue::Null),
            );
            record.date = str_field(order, "date_created");
            if let Some(status) = str_field(order, "status") {
                record = record.with_attribute(attr::STATUS, status);
            }
            if let Some(method) =
                str_field(order, "payment_method_title").or_else(|| str_field(order, "payment_method"))
            {
                record = record.with_attribute(attr::PAYMENT_METHOD, method);
            }
            let shipping = order
                .get("shipping_lines")
                .and_then(|lines| lines.get(0))
                .and_then(|line| str_field(line, "method_title"));
            if let Some(shipping) = shipping {
                record = record.with_attribute(attr::SHIPPING_METHOD, shipping);
            }
            record
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for WooCommerceAdapter {
    fn connector_id(&self) -> &str {
        &self.connector_id
    }

    fn origin(&self) -> Origin {
        Origin::Backend
    }

    async fn fetch(&self, range: &DateRange) -> Result<Vec<RawRecord>, AdapterError> {
        let endpoint = format!("{}/wp-json/wc/v3/orders", self.config.base_url());
        let after = format!("{}T00:00:00", range.start);
        let before = format!("{}T23:59:59", range.end);
        let span = info_span!("woocommerce_fetch", connector_id = %self.connector_id, %range);

        async move {
            let mut records = Vec::new();
            let mut page = 1u32;
            let per_page = PER_PAGE.to_string();
            loop {
                let page_no = page.to_string();
                let request = self
                    .http
                    .client()
                    .get(&endpoint)
                    .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
                    .query(&[
                        ("after", after.as_str()),
                        ("before", before.as_str()),
                        ("per_page", per_page.as_str()),
                        ("page", page_no.as_str()),
                    ]);
                let resp = self.http.send(&self.connector_id, request).await?;
                let payload: JsonValue = resp.json()?;
                let batch = parse_woocommerce_orders(&payload)?;
                let short = batch.len() < PER_PAGE;
                records.extend(batch);
                if short {
                    break;
                }
                if page >= MAX_PAGES {
                    warn!(max_pages = MAX_PAGES, "page limit reached, remaining orders skipped");
                    break;
                }
                page += 1;
            }
            info!(orders = records.len(), pages = page, "woocommerce orders fetched");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}
