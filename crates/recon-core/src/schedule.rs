use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::job::MAX_RETRIES_CEILING;
use crate::record::{DateRange, TenantId};
use crate::source::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        };
        f.write_str(label)
    }
}

/// Which dates a run covers and how often it may be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateRangeConfig {
    pub days: u32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub max_retries: u8,
}

impl Default for DateRangeConfig {
    fn default() -> Self {
        Self {
            days: 30,
            start_date: None,
            end_date: None,
            max_retries: 3,
        }
    }
}

impl DateRangeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=365).contains(&self.days) {
            return Err(ConfigError::invalid("days", "must be within 1..=365"));
        }
        if self.max_retries > MAX_RETRIES_CEILING {
            return Err(ConfigError::invalid(
                "max_retries",
                format!("must be at most {MAX_RETRIES_CEILING}"),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ConfigError::invalid("start_date", "is after end_date"));
            }
        }
        Ok(())
    }

    /// End defaults to `today`, start to `end - days`. Invalid configs are refused
    /// here too, since stored schedules reach this without passing the registry.
    pub fn resolve(&self, today: NaiveDate) -> Result<DateRange, ConfigError> {
        self.validate()?;
        let end = self.end_date.unwrap_or(today);
        let start = match self.start_date {
            Some(start) => start,
            None => {
                DateRange::trailing_days(end, self.days)
                    .ok_or_else(|| {
                        ConfigError::invalid("days", format!("reaches before the calendar from {end}"))
                    })?
                    .start
            }
        };
        DateRange::new(start, end)
            .ok_or_else(|| ConfigError::invalid("start_date", format!("{start} is after {end}")))
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_active() -> bool {
    true
}

/// Per-tenant recurrence, read-only to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub tenant_id: TenantId,
    pub frequency: Frequency,
    #[serde(default)]
    pub time_of_day: Option<NaiveTime>,
    #[serde(default)]
    pub day_of_week: Option<Weekday>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub date_range: DateRangeConfig,
}

impl Schedule {
    pub fn new(tenant_id: TenantId, frequency: Frequency) -> Self {
        Self {
            tenant_id,
            frequency,
            time_of_day: None,
            day_of_week: None,
            timezone: default_timezone(),
            is_active: true,
            date_range: DateRangeConfig::default(),
        }
    }

    /// Wall-clock fire time for daily and weekly schedules, 03:00 when unset.
    pub fn fire_time(&self) -> NaiveTime {
        self.time_of_day
            .unwrap_or_else(|| NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN))
    }

    pub fn fire_weekday(&self) -> Weekday {
        self.day_of_week.unwrap_or(Weekday::Mon)
    }

    /// Next fire instant strictly after `after`, evaluated in `after`'s zone.
    ///
    /// Local times that fall into a DST gap are skipped; ambiguous ones fire
    /// on their earlier instant.
    pub fn next_fire_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let local = after.naive_local();
        match self.frequency {
            Frequency::Hourly => {
                let top = local.date().and_hms_opt(local.hour(), 0, 0)?;
                (1..=48)
                    .map(|h| top + Duration::hours(h))
                    .find_map(|candidate| {
                        tz.from_local_datetime(&candidate)
                            .earliest()
                            .filter(|dt| dt > after)
                    })
            }
            Frequency::Daily | Frequency::Weekly => {
                let time = self.fire_time();
                (0..=15)
                    .map(|d| local.date() + Duration::days(d))
                    .filter(|day| {
                        self.frequency == Frequency::Daily || day.weekday() == self.fire_weekday()
                    })
                    .find_map(|day| {
                        tz.from_local_datetime(&day.and_time(time))
                            .earliest()
                            .filter(|dt| dt > after)
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().expect("valid instant")
    }

    #[test]
    fn hourly_fires_at_the_next_top_of_hour() {
        let schedule = Schedule::new(TenantId::from("acme"), Frequency::Hourly);
        let next = schedule.next_fire_after(&utc(2026, 3, 2, 10, 15)).expect("next");
        assert_eq!(next, utc(2026, 3, 2, 11, 0));
        let next = schedule.next_fire_after(&utc(2026, 3, 2, 11, 0)).expect("next");
        assert_eq!(next, utc(2026, 3, 2, 12, 0));
    }

    #[test]
    fn daily_defaults_to_three_am_and_rolls_over() {
        let schedule = Schedule::new(TenantId::from("acme"), Frequency::Daily);
        assert_eq!(
            schedule.next_fire_after(&utc(2026, 3, 2, 1, 0)),
            Some(utc(2026, 3, 2, 3, 0))
        );
        assert_eq!(
            schedule.next_fire_after(&utc(2026, 3, 2, 3, 0)),
            Some(utc(2026, 3, 3, 3, 0))
        );
    }

    #[test]
    fn weekly_uses_configured_weekday_in_local_time() {
        let mut schedule = Schedule::new(TenantId::from("acme"), Frequency::Weekly);
        schedule.time_of_day = NaiveTime::from_hms_opt(9, 30, 0);
        schedule.day_of_week = Some(Weekday::Fri);
        let tz = FixedOffset::east_opt(2 * 3600).expect("offset");
        // 2026-03-02 is a Monday.
        let after = tz.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().expect("instant");
        let next = schedule.next_fire_after(&after).expect("next");
        assert_eq!(next.weekday(), Weekday::Fri);
        assert_eq!(next.naive_local().time(), NaiveTime::from_hms_opt(9, 30, 0).expect("time"));
        assert_eq!(next.with_timezone(&Utc), utc(2026, 3, 6, 7, 30));
    }

    #[test]
    fn date_range_config_resolves_relative_to_today() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).expect("date");
        let cfg = DateRangeConfig::default();
        let range = cfg.resolve(today).expect("range");
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2026, 3, 1).expect("date"));
        assert_eq!(range.end, today);

        let pinned = DateRangeConfig {
            start_date: NaiveDate::from_ymd_opt(2026, 2, 1),
            end_date: NaiveDate::from_ymd_opt(2026, 2, 28),
            ..DateRangeConfig::default()
        };
        assert_eq!(pinned.resolve(today).expect("range").days(), 28);

        let inverted = DateRangeConfig {
            start_date: NaiveDate::from_ymd_opt(2026, 4, 10),
            ..DateRangeConfig::default()
        };
        assert!(inverted.resolve(today).is_err());
    }

    #[test]
    fn resolve_refuses_out_of_range_days() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).expect("date");
        let huge = DateRangeConfig {
            days: 4_000_000_000,
            ..DateRangeConfig::default()
        };
        assert!(huge.resolve(today).is_err());
        let huge_retries = DateRangeConfig {
            max_retries: 200,
            ..DateRangeConfig::default()
        };
        assert!(huge_retries.resolve(today).is_err());
    }

    #[test]
    fn date_range_config_bounds() {
        let cfg = DateRangeConfig {
            days: 0,
            ..DateRangeConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = DateRangeConfig {
            max_retries: 6,
            ..DateRangeConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(DateRangeConfig::default().validate().is_ok());
    }

    #[test]
    fn schedule_yaml_fills_defaults() {
        let schedule: Schedule =
            serde_json::from_str(r#"{"tenant_id":"acme","frequency":"weekly","day_of_week":"Wed"}"#)
                .expect("schedule");
        assert_eq!(schedule.fire_weekday(), Weekday::Wed);
        assert_eq!(schedule.timezone, "UTC");
        assert!(schedule.is_active);
        assert_eq!(schedule.date_range.max_retries, 3);
    }
}
