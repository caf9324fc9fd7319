use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{attr, DateRange, Origin, RawRecord, ShopifyConfig};
use recon_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};

use crate::{expect_array, id_field, str_field, AdapterError, SourceAdapter};

const API_VERSION: &str = "2024-01";
const PAGE_LIMIT: &str = "250";
const MAX_PAGES: u32 = 100;

/// Shopify Admin `orders.json` with cursor pagination through the `Link` header.
#[derive(Debug)]
pub struct ShopifyAdapter {
    connector_id: String,
    config: ShopifyConfig,
    http: Arc<HttpFetcher>,
}

impl ShopifyAdapter {
    pub fn new(connector_id: String, config: ShopifyConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            connector_id,
            config,
            http,
        }
    }
}

/// `rel="next"` target of a `Link` header, if any.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        if !part.contains(r#"rel="next""#) {
            return None;
        }
        let start = part.find('<')?;
        let end = part[start..].find('>')? + start;
        Some(part[start + 1..end].to_string())
    })
}

/// Body of an `orders.json` page into raw records. The order `name` is the
/// id shoppers and analytics see.
pub fn parse_shopify_orders(payload: &JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
    let orders = payload
        .get("orders")
        .ok_or_else(|| AdapterError::Malformed("shopify page has no `orders`".into()))?;
    let orders = expect_array(orders, "shopify orders")?;
    Ok(orders
        .iter()
        .map(|order| {
            let mut record = RawRecord::new(
                id_field(order, "name"),
                order.get("total_price").cloned().unwrap_or(JsonValue::Null),
            );
            record.date = str_field(order, "created_at");
            if let Some(status) = str_field(order, "financial_status") {
                record = record.with_attribute(attr::STATUS, status);
            }
            let gateway = order
                .get("payment_gateway_names")
                .and_then(|names| names.get(0))
                .and_then(JsonValue::as_str)
                .filter(|name| !name.trim().is_empty());
            if let Some(gateway) = gateway {
                record = record.with_attribute(attr::PAYMENT_METHOD, gateway.trim());
            }
            let shipping = order
                .get("shipping_lines")
                .and_then(|lines| lines.get(0))
                .and_then(|line| str_field(line, "title"));
            if let Some(shipping) = shipping {
                record = record.with_attribute(attr::SHIPPING_METHOD, shipping);
            }
            record
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for ShopifyAdapter {
    fn connector_id(&self) -> &str {
        &self.connector_id
    }

    fn origin(&self) -> Origin {
        Origin::Backend
    }

    async fn fetch(&self, range: &DateRange) -> Result<Vec<RawRecord>, AdapterError> {
        let first_url = format!(
            "https://{}/admin/api/{API_VERSION}/orders.json",
            self.config.shop_domain()
        );
        let created_min = format!("{}T00:00:00Z", range.start);
        let created_max = format!("{}T23:59:59Z", range.end);
        let span = info_span!("shopify_fetch", connector_id = %self.connector_id, %range);

        async move {
            let mut records = Vec::new();
            let mut next: Option<String> = None;
            let mut pages = 0u32;
            loop {
                let request = match &next {
                    // Cursor URLs carry their own query.
                    Some(url) => self.http.client().get(url),
                    None => self.http.client().get(&first_url).query(&[
                        ("status", "any"),
                        ("created_at_min", created_min.as_str()),
                        ("created_at_max", created_max.as_str()),
                        ("limit", PAGE_LIMIT),
                    ]),
                }
                .header("X-Shopify-Access-Token", &self.config.access_token);

                let resp = self.http.send(&self.connector_id, request).await?;
                let payload: JsonValue = resp.json()?;
                records.extend(parse_shopify_orders(&payload)?);
                pages += 1;

                next = resp.link.as_deref().and_then(next_link);
                if next.is_none() {
                    break;
                }
                if pages >= MAX_PAGES {
                    warn!(max_pages = MAX_PAGES, "page limit reached, remaining orders skipped");
                    break;
                }
            }
            info!(orders = records.len(), pages, "shopify orders fetched");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}
