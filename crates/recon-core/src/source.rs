use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Origin;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Decrypted connector configuration, one variant per source kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    #[serde(rename = "woocommerce")]
    WooCommerce(WooCommerceConfig),
    Shopify(ShopifyConfig),
    Ga4(Ga4Config),
    Fixture(FixtureConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WooCommerceConfig {
    pub url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopifyConfig {
    pub shop_url: String,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ga4Config {
    pub property_id: String,
    pub access_token: String,
}

/// Local JSON file of `RawRecord`s, used for offline runs and demos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub path: PathBuf,
    pub origin: Origin,
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::WooCommerce(_) => "woocommerce",
            SourceConfig::Shopify(_) => "shopify",
            SourceConfig::Ga4(_) => "ga4",
            SourceConfig::Fixture(_) => "fixture",
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            SourceConfig::WooCommerce(_) | SourceConfig::Shopify(_) => Origin::Backend,
            SourceConfig::Ga4(_) => Origin::Analytics,
            SourceConfig::Fixture(cfg) => cfg.origin,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            SourceConfig::WooCommerce(cfg) => cfg.validate(),
            SourceConfig::Shopify(cfg) => cfg.validate(),
            SourceConfig::Ga4(cfg) => cfg.validate(),
            SourceConfig::Fixture(cfg) => {
                if cfg.path.as_os_str().is_empty() {
                    return Err(ConfigError::invalid("path", "fixture path is empty"));
                }
                Ok(())
            }
        }
    }
}

impl WooCommerceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("https://") || self.url.starts_with("http://")) {
            return Err(ConfigError::invalid("url", "must be an http(s) URL"));
        }
        check_key("consumer_key", &self.consumer_key, "ck_")?;
        check_key("consumer_secret", &self.consumer_secret, "cs_")
    }

    /// Site root without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

fn check_key(field: &'static str, value: &str, prefix: &str) -> Result<(), ConfigError> {
    if value.len() < 10 {
        return Err(ConfigError::invalid(field, "must be at least 10 characters"));
    }
    if !value.starts_with(prefix) {
        return Err(ConfigError::invalid(field, format!("must start with `{prefix}`")));
    }
    Ok(())
}

impl ShopifyConfig {
    /// Shop domain with protocol and trailing slash removed.
    pub fn shop_domain(&self) -> &str {
        let url = self.shop_url.trim();
        let url = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url);
        url.trim_end_matches('/')
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.shop_domain().contains('.') {
            return Err(ConfigError::invalid(
                "shop_url",
                "must be a shop domain such as `store.myshopify.com`",
            ));
        }
        let token = &self.access_token;
        if token.len() < 10 || (!token.starts_with("shpat_") && token.len() < 20) {
            return Err(ConfigError::invalid(
                "access_token",
                "does not look like an Admin API token",
            ));
        }
        Ok(())
    }
}

impl Ga4Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.property_id.is_empty() || !self.property_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::invalid("property_id", "must be numeric"));
        }
        if self.access_token.trim().is_empty() {
            return Err(ConfigError::invalid("access_token", "is empty"));
        }
        Ok(())
    }
}
