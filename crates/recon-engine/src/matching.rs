use std::collections::{BTreeMap, BTreeSet};

use recon_core::{MatchResult, TransactionRecord, ValueComparison, ValueDelta};
use rust_decimal::Decimal;

/// A matched id whose values differ by less than one currency unit counts as exact.
pub const EXACT_TOLERANCE: Decimal = Decimal::ONE;

/// `part / whole * 100` rounded to two places; `0` for an empty whole.
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let raw = part as f64 / whole as f64 * 100.0;
    ((raw * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// Sum of `value` per clean id. Summation makes row order irrelevant.
pub fn totals_by_id(records: &[TransactionRecord]) -> BTreeMap<String, Decimal> {
    let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
    for record in records {
        *totals.entry(record.clean_id.clone()).or_default() += record.value;
    }
    totals
}

/// Partition both id sets and compute a delta for every id seen on both sides.
pub fn match_records(backend: &[TransactionRecord], analytics: &[TransactionRecord]) -> MatchResult {
    let backend_totals = totals_by_id(backend);
    let analytics_totals = totals_by_id(analytics);

    let mut result = MatchResult::default();
    for (id, backend_value) in &backend_totals {
        match analytics_totals.get(id) {
            Some(analytics_value) => {
                let delta = *backend_value - *analytics_value;
                result.matched.insert(id.clone());
                result.value_deltas.insert(
                    id.clone(),
                    ValueDelta {
                        backend_value: *backend_value,
                        analytics_value: *analytics_value,
                        delta,
                        exact: delta.abs() < EXACT_TOLERANCE,
                    },
                );
            }
            None => {
                result.backend_only.insert(id.clone());
            }
        }
    }
    result.analytics_only = analytics_totals
        .keys()
        .filter(|id| !backend_totals.contains_key(*id))
        .cloned()
        .collect();
    result.overall_match_rate = percentage(
        result.matched.len() as u64,
        backend_totals.len() as u64,
    );
    result
}

fn sum_values(records: &[TransactionRecord]) -> Decimal {
    records.iter().map(|r| r.value).sum()
}

/// Dataset totals plus the matched-subset view of `matching`.
pub fn compare_values(
    backend: &[TransactionRecord],
    analytics: &[TransactionRecord],
    matching: &MatchResult,
) -> ValueComparison {
    let matched_backend_value: Decimal =
        matching.value_deltas.values().map(|d| d.backend_value).sum();
    let matched_analytics_value: Decimal =
        matching.value_deltas.values().map(|d| d.analytics_value).sum();
    let exact_matches = matching.value_deltas.values().filter(|d| d.exact).count();

    ValueComparison {
        backend_total_value: sum_values(backend),
        analytics_total_value: sum_values(analytics),
        matched_backend_value,
        matched_analytics_value,
        value_difference: matched_backend_value - matched_analytics_value,
        exact_matches,
        exact_match_rate: percentage(exact_matches as u64, matching.matched.len() as u64),
    }
}

pub fn id_set(records: &[TransactionRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.clean_id.clone()).collect()
}
