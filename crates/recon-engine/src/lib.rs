//! Pure reconciliation pipeline: normalize, match, break down, recommend.
//!
//! Nothing in this crate performs I/O or suspends; callers run it on a blocking thread
//! when inputs are large.

pub mod analyzer;
pub mod matching;
pub mod normalize;
pub mod recommend;

use recon_core::{
    attr, DateRange, DimensionalBreakdown, Origin, RawRecord, ReconciliationSummary,
    TransactionRecord,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub use analyzer::{breakdown, daily_match_rates, share_breakdown, UNKNOWN};
pub use matching::{compare_values, match_records, percentage, EXACT_TOLERANCE};
pub use normalize::{clean_id, coerce_value, normalize, parse_date, renormalize, NOT_SET};
pub use recommend::{recommend, LOW_GROUP_RATE, LOW_OVERALL_RATE};

pub const CRATE_NAME: &str = "recon-engine";

/// Browsers beyond this many are left out of the technology breakdown.
pub const BROWSER_LIMIT: usize = 10;

/// Internal inconsistency in a computed result. Retrying the same input reproduces it.
#[derive(Debug, Error, PartialEq)]
pub enum ComputationError {
    #[error("match result is not a partition of the input ids ({backend} backend, {analytics} analytics)")]
    NotAPartition { backend: usize, analytics: usize },
    #[error("{what} rate {rate} is outside 0..=100")]
    RateOutOfRange { what: String, rate: f64 },
    #[error("group `{group}` of `{key}` has no GA4 orders but a non-zero rate {rate}")]
    InconsistentGroup { key: String, group: String, rate: f64 },
}

fn check_rate(what: impl Into<String>, rate: f64) -> Result<(), ComputationError> {
    if rate.is_finite() && (0.0..=100.0).contains(&rate) {
        Ok(())
    } else {
        Err(ComputationError::RateOutOfRange {
            what: what.into(),
            rate,
        })
    }
}

fn check_breakdown(breakdown: &DimensionalBreakdown) -> Result<(), ComputationError> {
    for (group, stats) in &breakdown.groups {
        check_rate(format!("{}={group}", breakdown.key), stats.rate)?;
        if stats.in_ga4 == 0 && stats.total > 0 && stats.rate != 0.0 {
            return Err(ComputationError::InconsistentGroup {
                key: breakdown.key.clone(),
                group: group.clone(),
                rate: stats.rate,
            });
        }
    }
    Ok(())
}

/// Hex SHA-256 over the sorted normalized input of both sides.
pub fn input_digest(backend: &[TransactionRecord], analytics: &[TransactionRecord]) -> String {
    let mut lines: Vec<String> = backend
        .iter()
        .chain(analytics)
        .map(|r| {
            let date = r.date.map(|d| d.to_string()).unwrap_or_default();
            format!("{}|{}|{}|{}", r.origin, r.clean_id, r.value, date)
        })
        .collect();
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Normalize both raw datasets and reconcile them.
pub fn reconcile(
    range: DateRange,
    backend_raw: &[RawRecord],
    analytics_raw: &[RawRecord],
) -> Result<ReconciliationSummary, ComputationError> {
    let backend = normalize(Origin::Backend, backend_raw);
    let analytics = normalize(Origin::Analytics, analytics_raw);
    debug!(
        backend_raw = backend_raw.len(),
        backend = backend.len(),
        analytics_raw = analytics_raw.len(),
        analytics = analytics.len(),
        "records normalized"
    );
    reconcile_records(range, &backend, &analytics)
}

/// Reconcile already normalized records and self-check the result.
pub fn reconcile_records(
    range: DateRange,
    backend: &[TransactionRecord],
    analytics: &[TransactionRecord],
) -> Result<ReconciliationSummary, ComputationError> {
    let matching = match_records(backend, analytics);
    let backend_ids = matching::id_set(backend);
    let analytics_ids = matching::id_set(analytics);
    if !matching.is_partition_of(&backend_ids, &analytics_ids) {
        return Err(ComputationError::NotAPartition {
            backend: backend_ids.len(),
            analytics: analytics_ids.len(),
        });
    }
    check_rate("overall match", matching.overall_match_rate)?;

    let value_comparison = compare_values(backend, analytics, &matching);
    let payment_methods = breakdown(backend, &matching, attr::PAYMENT_METHOD);
    let shipping_methods = breakdown(backend, &matching, attr::SHIPPING_METHOD);
    let statuses = breakdown(backend, &matching, attr::STATUS);
    for b in [&payment_methods, &shipping_methods, &statuses] {
        check_breakdown(b)?;
    }
    let daily = daily_match_rates(backend, &matching);
    for day in &daily {
        check_rate(format!("daily {}", day.date), day.match_rate)?;
    }

    let recommendations = recommend(&payment_methods, matching.overall_match_rate);
    debug!(
        matched = matching.matched.len(),
        backend_only = matching.backend_only.len(),
        analytics_only = matching.analytics_only.len(),
        rate = matching.overall_match_rate,
        recommendations = recommendations.len(),
        "reconciliation computed"
    );

    Ok(ReconciliationSummary {
        date_range: range,
        backend_records: backend.len(),
        analytics_records: analytics.len(),
        input_digest: input_digest(backend, analytics),
        browsers: share_breakdown(analytics, &matching, attr::BROWSER, BROWSER_LIMIT),
        devices: share_breakdown(analytics, &matching, attr::DEVICE, usize::MAX),
        matching,
        value_comparison,
        payment_methods,
        shipping_methods,
        statuses,
        daily,
        recommendations,
    })
}
