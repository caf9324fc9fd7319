use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use recon_core::{Origin, RawRecord, TransactionRecord};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value as JsonValue;

/// GA4 placeholder for a missing dimension value.
pub const NOT_SET: &str = "(not set)";

const VALUE_SCALE: u32 = 2;

/// Backend ids lose one trailing literal `-1`; analytics ids are only trimmed.
pub fn clean_id(origin: Origin, raw_id: &str) -> String {
    let trimmed = raw_id.trim();
    match origin {
        Origin::Backend => trimmed.strip_suffix("-1").unwrap_or(trimmed).to_string(),
        Origin::Analytics => trimmed.to_string(),
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let cleaned: String = text.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned)
        .ok()
        .or_else(|| Decimal::from_scientific(&cleaned).ok())
}

/// Fixed two-place amount. Anything that is not a number becomes zero.
pub fn coerce_value(value: &JsonValue) -> Decimal {
    let parsed = match value {
        JsonValue::Number(n) => {
            parse_decimal(&n.to_string()).or_else(|| n.as_f64().and_then(Decimal::from_f64))
        }
        JsonValue::String(s) => parse_decimal(s),
        _ => None,
    };
    round_amount(parsed.unwrap_or(Decimal::ZERO))
}

fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(VALUE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Calendar day as written by the source; offsets are not converted.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

fn keep_id(clean_id: &str) -> bool {
    !clean_id.is_empty() && clean_id != NOT_SET
}

/// Raw adapter output into transaction records. Rows without a usable id are dropped.
pub fn normalize(origin: Origin, raw: &[RawRecord]) -> Vec<TransactionRecord> {
    raw.iter()
        .filter_map(|record| {
            let clean_id = clean_id(origin, &record.id);
            if !keep_id(&clean_id) {
                return None;
            }
            let attributes = record
                .attributes
                .iter()
                .filter_map(|(k, v)| {
                    let v = v.trim();
                    (!v.is_empty()).then(|| (k.clone(), v.to_string()))
                })
                .collect();
            Some(TransactionRecord {
                origin,
                raw_id: record.id.clone(),
                clean_id,
                value: coerce_value(&record.value),
                date: record.date.as_deref().and_then(parse_date),
                attributes,
            })
        })
        .collect()
}

/// Re-derive `clean_id` from `raw_id`. A no-op on normalizer output.
pub fn renormalize(records: &[TransactionRecord]) -> Vec<TransactionRecord> {
    records
        .iter()
        .filter_map(|record| {
            let clean_id = clean_id(record.origin, &record.raw_id);
            keep_id(&clean_id).then(|| TransactionRecord {
                clean_id,
                value: round_amount(record.value),
                ..record.clone()
            })
        })
        .collect()
}
