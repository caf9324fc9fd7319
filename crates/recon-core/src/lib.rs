//! Core domain model for the reconciliation engine.

mod job;
mod record;
mod report;
mod schedule;
mod source;

pub use job::{Job, JobLogEntry, JobStatus, JobTrigger, LogLevel, TransitionError, MAX_RETRIES_CEILING};
pub use record::{DateRange, Origin, RawRecord, TenantId, TransactionRecord};
pub use report::{
    DailyMatchRate, DimensionalBreakdown, GroupStats, MatchResult, Priority, Recommendation,
    ReconciliationSummary, ShareRow, ValueComparison, ValueDelta,
};
pub use schedule::{DateRangeConfig, Frequency, Schedule};
pub use source::{ConfigError, FixtureConfig, Ga4Config, ShopifyConfig, SourceConfig, WooCommerceConfig};

pub const CRATE_NAME: &str = "recon-core";

/// Attribute keys shared by adapters, the normalizer and the analyzer.
pub mod attr {
    pub const PAYMENT_METHOD: &str = "payment_method";
    pub const SHIPPING_METHOD: &str = "shipping_method";
    pub const STATUS: &str = "status";
    pub const BROWSER: &str = "browser";
    pub const DEVICE: &str = "device";
}
