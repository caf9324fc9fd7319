use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use recon_core::{DateRange, DateRangeConfig, Job, JobLogEntry, JobStatus, Schedule, TenantId};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{JobStore, ScheduleStore, StoreError};

const JOB_COLUMNS: &str = "id, tenant_id, status, trigger, start_date, end_date, retry_count, \
     max_retries, result_summary, logs, created_at, updated_at, started_at, completed_at";

/// Postgres-backed job and schedule tables.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_schedules
                (tenant_id, frequency, time_of_day, day_of_week, timezone, is_active, date_range, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (tenant_id) DO UPDATE SET
                frequency = EXCLUDED.frequency,
                time_of_day = EXCLUDED.time_of_day,
                day_of_week = EXCLUDED.day_of_week,
                timezone = EXCLUDED.timezone,
                is_active = EXCLUDED.is_active,
                date_range = EXCLUDED.date_range,
                updated_at = NOW()
            "#,
        )
        .bind(schedule.tenant_id.as_str())
        .bind(schedule.frequency.to_string())
        .bind(schedule.time_of_day)
        .bind(schedule.day_of_week.map(|d| d.num_days_from_monday() as i16))
        .bind(&schedule.timezone)
        .bind(schedule.is_active)
        .bind(serde_json::to_value(&schedule.date_range)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_label<T: DeserializeOwned>(column: &str, label: String) -> Result<T, StoreError> {
    serde_json::from_value(JsonValue::String(label.clone()))
        .map_err(|_| StoreError::Corrupt(format!("{column} = `{label}`")))
}

fn small_to_u8(column: &str, value: i16) -> Result<u8, StoreError> {
    u8::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} = {value}")))
}

fn weekday_from_index(index: i16) -> Result<Weekday, StoreError> {
    let days = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    usize::try_from(index)
        .ok()
        .and_then(|i| days.get(i).copied())
        .ok_or_else(|| StoreError::Corrupt(format!("day_of_week = {index}")))
}

fn row_to_job(row: &PgRow) -> Result<Job, StoreError> {
    let start: NaiveDate = row.try_get("start_date")?;
    let end: NaiveDate = row.try_get("end_date")?;
    let date_range = DateRange::new(start, end)
        .ok_or_else(|| StoreError::Corrupt(format!("date range {start} > {end}")))?;
    let summary: Option<JsonValue> = row.try_get("result_summary")?;
    let logs: JsonValue = row.try_get("logs")?;
    let logs: Vec<JobLogEntry> = serde_json::from_value(logs)?;

    Ok(Job {
        id: row.try_get("id")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        status: parse_label::<JobStatus>("status", row.try_get("status")?)?,
        trigger: parse_label("trigger", row.try_get("trigger")?)?,
        date_range,
        retry_count: small_to_u8("retry_count", row.try_get("retry_count")?)?,
        max_retries: small_to_u8("max_retries", row.try_get("max_retries")?)?,
        result_summary: summary.map(serde_json::from_value).transpose()?,
        logs,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_schedule(row: &PgRow) -> Result<Schedule, StoreError> {
    let day_of_week: Option<i16> = row.try_get("day_of_week")?;
    let date_range: JsonValue = row.try_get("date_range")?;
    Ok(Schedule {
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        frequency: parse_label("frequency", row.try_get("frequency")?)?,
        time_of_day: row.try_get::<Option<NaiveTime>, _>("time_of_day")?,
        day_of_week: day_of_week.map(weekday_from_index).transpose()?,
        timezone: row.try_get("timezone")?,
        is_active: row.try_get("is_active")?,
        date_range: serde_json::from_value::<DateRangeConfig>(date_range)?,
    })
}

#[async_trait]
impl JobStore for PgStore {
    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        let summary = job
            .result_summary
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO reconciliation_jobs
                (id, tenant_id, status, trigger, start_date, end_date, retry_count, max_retries,
                 result_summary, logs, created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                result_summary = EXCLUDED.result_summary,
                logs = EXCLUDED.logs,
                updated_at = EXCLUDED.updated_at,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(job.id)
        .bind(job.tenant_id.as_str())
        .bind(job.status.as_str())
        .bind(job.trigger.as_str())
        .bind(job.date_range.start)
        .bind(job.date_range.end)
        .bind(i16::from(job.retry_count))
        .bind(i16::from(job.max_retries))
        .bind(summary)
        .bind(serde_json::to_value(&job.logs)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM reconciliation_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let labels: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM reconciliation_jobs WHERE status = ANY($1) ORDER BY created_at"
        ))
        .bind(labels)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn jobs_for_tenant(&self, tenant: &TenantId, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM reconciliation_jobs WHERE tenant_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(tenant.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn active_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, frequency, time_of_day, day_of_week, timezone, is_active, date_range
              FROM reconciliation_schedules
             WHERE is_active
             ORDER BY tenant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::{Frequency, JobTrigger};

    #[test]
    fn stored_labels_parse_back_into_enums() {
        let status: JobStatus = parse_label("status", "retrying".to_string()).expect("status");
        assert_eq!(status, JobStatus::Retrying);
        let trigger: JobTrigger = parse_label("trigger", "scheduled".to_string()).expect("trigger");
        assert_eq!(trigger, JobTrigger::Scheduled);
        let frequency: Frequency = parse_label("frequency", "weekly".to_string()).expect("freq");
        assert_eq!(frequency, Frequency::Weekly);
        assert!(matches!(
            parse_label::<JobStatus>("status", "paused".to_string()),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn weekday_index_matches_monday_based_numbering() {
        for day in [Weekday::Mon, Weekday::Thu, Weekday::Sun] {
            let index = day.num_days_from_monday() as i16;
            assert_eq!(weekday_from_index(index).expect("weekday"), day);
        }
        assert!(weekday_from_index(7).is_err());
        assert!(small_to_u8("retry_count", -1).is_err());
    }
}
