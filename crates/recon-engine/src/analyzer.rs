use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use recon_core::{
    DailyMatchRate, DimensionalBreakdown, MatchResult, ShareRow, TransactionRecord,
};

use crate::matching::percentage;

/// Group label for records without the attribute.
pub const UNKNOWN: &str = "unknown";

fn group_label<'a>(record: &'a TransactionRecord, key: &str) -> &'a str {
    record.attribute(key).unwrap_or(UNKNOWN)
}

/// Coverage of backend records per value of `key`.
///
/// A record counts as in GA4 when its clean id is in `matching.matched`.
pub fn breakdown(
    backend: &[TransactionRecord],
    matching: &MatchResult,
    key: &str,
) -> DimensionalBreakdown {
    let mut result = DimensionalBreakdown::new(key);
    for record in backend {
        let stats = result
            .groups
            .entry(group_label(record, key).to_string())
            .or_default();
        stats.total += 1;
        stats.total_value += record.value;
        if matching.matched.contains(&record.clean_id) {
            stats.in_ga4 += 1;
        } else {
            stats.missing_value += record.value;
        }
    }
    for stats in result.groups.values_mut() {
        stats.rate = percentage(stats.in_ga4, stats.total);
    }
    result
}

/// Share of each analytics-side value of `key` among matched rows, largest first.
pub fn share_breakdown(
    analytics: &[TransactionRecord],
    matching: &MatchResult,
    key: &str,
    limit: usize,
) -> Vec<ShareRow> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    let mut considered = 0u64;
    for record in analytics
        .iter()
        .filter(|r| matching.matched.contains(&r.clean_id))
    {
        considered += 1;
        *counts.entry(group_label(record, key)).or_default() += 1;
    }

    let mut rows: Vec<ShareRow> = counts
        .into_iter()
        .map(|(name, count)| ShareRow {
            name: name.to_string(),
            count,
            percentage: percentage(count, considered),
        })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    rows.truncate(limit);
    rows
}

/// Per-day match rate over distinct backend ids. Undated records are left out.
pub fn daily_match_rates(
    backend: &[TransactionRecord],
    matching: &MatchResult,
) -> Vec<DailyMatchRate> {
    let mut days: BTreeMap<NaiveDate, BTreeSet<&str>> = BTreeMap::new();
    for record in backend {
        if let Some(date) = record.date {
            days.entry(date).or_default().insert(&record.clean_id);
        }
    }

    days.into_iter()
        .map(|(date, ids)| {
            let backend_total = ids.len() as u64;
            let matched = ids
                .iter()
                .filter(|id| matching.matched.contains(**id))
                .count() as u64;
            DailyMatchRate {
                date,
                backend_total,
                matched,
                match_rate: percentage(matched, backend_total),
            }
        })
        .collect()
}
