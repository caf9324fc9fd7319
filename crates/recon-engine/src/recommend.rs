use recon_core::{DimensionalBreakdown, GroupStats, Priority, Recommendation};

/// Groups below this rate are losing most of their conversions.
pub const LOW_GROUP_RATE: f64 = 50.0;
/// Overall rates below this point at a client-side measurement gap.
pub const LOW_OVERALL_RATE: f64 = 80.0;

fn rule_for(stats: &GroupStats, overall_rate: f64) -> Option<(Priority, String)> {
    // Keyed on the reported rate: a large group with a few tracked orders rounds to 0.00%.
    if stats.total > 0 && stats.rate == 0.0 {
        return Some((
            Priority::Critical,
            format!(
                "{} of {} orders reached GA4. The payment redirect or callback likely drops the tracking session.",
                stats.in_ga4, stats.total
            ),
        ));
    }
    if stats.rate < LOW_GROUP_RATE {
        return Some((
            Priority::High,
            format!(
                "Only {:.2}% of orders reached GA4. Review redirect flows and cross-domain tracking.",
                stats.rate
            ),
        ));
    }
    if overall_rate < LOW_OVERALL_RATE && stats.missing() > 0 {
        return Some((
            Priority::Medium,
            format!(
                "{} orders missing while the overall match rate is {overall_rate:.2}%. Consider server-side tracking via the GA4 Measurement Protocol.",
                stats.missing()
            ),
        ));
    }
    None
}

/// Threshold rules over a payment-method breakdown, most severe and costly first.
pub fn recommend(payment_methods: &DimensionalBreakdown, overall_rate: f64) -> Vec<Recommendation> {
    let mut out: Vec<Recommendation> = payment_methods
        .groups
        .iter()
        .filter_map(|(name, stats)| {
            rule_for(stats, overall_rate).map(|(priority, description)| Recommendation {
                priority,
                subject: name.clone(),
                description,
                impact_value: stats.missing_value,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.impact_value.cmp(&a.impact_value))
            .then_with(|| a.subject.cmp(&b.subject))
    });
    out
}
