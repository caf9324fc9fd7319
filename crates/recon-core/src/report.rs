use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::record::DateRange;

/// Backend value against summed analytics value for one matched id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueDelta {
    pub backend_value: Decimal,
    pub analytics_value: Decimal,
    pub delta: Decimal,
    /// `|delta| < 1.0`.
    pub exact: bool,
}

/// Partition of backend and analytics clean ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: BTreeSet<String>,
    pub backend_only: BTreeSet<String>,
    pub analytics_only: BTreeSet<String>,
    pub value_deltas: BTreeMap<String, ValueDelta>,
    pub overall_match_rate: f64,
}

impl MatchResult {
    /// True when the three sets are pairwise disjoint and rebuild both id sets exactly.
    pub fn is_partition_of(
        &self,
        backend_ids: &BTreeSet<String>,
        analytics_ids: &BTreeSet<String>,
    ) -> bool {
        let disjoint = self.matched.is_disjoint(&self.backend_only)
            && self.matched.is_disjoint(&self.analytics_only)
            && self.backend_only.is_disjoint(&self.analytics_only);
        let backend: BTreeSet<String> = self.matched.union(&self.backend_only).cloned().collect();
        let analytics: BTreeSet<String> =
            self.matched.union(&self.analytics_only).cloned().collect();
        disjoint && &backend == backend_ids && &analytics == analytics_ids
    }

    pub fn backend_id_count(&self) -> usize {
        self.matched.len() + self.backend_only.len()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueComparison {
    pub backend_total_value: Decimal,
    pub analytics_total_value: Decimal,
    pub matched_backend_value: Decimal,
    pub matched_analytics_value: Decimal,
    pub value_difference: Decimal,
    pub exact_matches: usize,
    pub exact_match_rate: f64,
}

/// Coverage of one attribute value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupStats {
    pub total: u64,
    pub in_ga4: u64,
    /// `in_ga4 / total * 100`, `0` for an empty group.
    pub rate: f64,
    pub total_value: Decimal,
    pub missing_value: Decimal,
}

impl GroupStats {
    pub fn missing(&self) -> u64 {
        self.total.saturating_sub(self.in_ga4)
    }
}

/// Per attribute value coverage, keyed by value for stable ordering.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DimensionalBreakdown {
    pub key: String,
    pub groups: BTreeMap<String, GroupStats>,
}

impl DimensionalBreakdown {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            groups: BTreeMap::new(),
        }
    }
}

/// Share of an analytics-side attribute within the matched subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRow {
    pub name: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMatchRate {
    pub date: NaiveDate,
    pub backend_total: u64,
    pub matched: u64,
    pub match_rate: f64,
}

/// Declaration order is sort order: `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub subject: String,
    pub description: String,
    pub impact_value: Decimal,
}

/// Persisted outcome of a completed reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub date_range: DateRange,
    pub backend_records: usize,
    pub analytics_records: usize,
    /// SHA-256 over the sorted normalized input of both sides.
    pub input_digest: String,
    pub matching: MatchResult,
    pub value_comparison: ValueComparison,
    pub payment_methods: DimensionalBreakdown,
    pub shipping_methods: DimensionalBreakdown,
    pub statuses: DimensionalBreakdown,
    pub browsers: Vec<ShareRow>,
    pub devices: Vec<ShareRow>,
    pub daily: Vec<DailyMatchRate>,
    pub recommendations: Vec<Recommendation>,
}
