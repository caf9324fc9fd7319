use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::record::{DateRange, TenantId};
use crate::report::ReconciliationSummary;

/// Upper bound for `max_retries`; keeps the longest backoff at 2^5 seconds.
pub const MAX_RETRIES_CEILING: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Edges of the lifecycle state machine. `Pending -> Failed` and
    /// `Retrying -> Failed` cover interrupted runs.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Failed, Running)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Scheduled => "scheduled",
            JobTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid job transition {from} -> {to}")]
    Invalid { from: JobStatus, to: JobStatus },
    #[error("retries exhausted ({retry_count}/{max_retries})")]
    RetriesExhausted { retry_count: u8, max_retries: u8 },
    #[error("max_retries {0} outside 0..={MAX_RETRIES_CEILING}")]
    MaxRetriesOutOfRange(u8),
}

/// One reconciliation run and its durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub date_range: DateRange,
    pub retry_count: u8,
    pub max_retries: u8,
    pub result_summary: Option<ReconciliationSummary>,
    pub logs: Vec<JobLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        tenant_id: TenantId,
        date_range: DateRange,
        max_retries: u8,
        trigger: JobTrigger,
        now: DateTime<Utc>,
    ) -> Result<Self, TransitionError> {
        if max_retries > MAX_RETRIES_CEILING {
            return Err(TransitionError::MaxRetriesOutOfRange(max_retries));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id,
            status: JobStatus::Pending,
            trigger,
            date_range,
            retry_count: 0,
            max_retries,
            result_summary: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Running | JobStatus::Retrying)
    }

    /// Message of the most recent error entry, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.logs
            .iter()
            .rev()
            .find(|entry| entry.level == LogLevel::Error)
            .map(|entry| entry.message.as_str())
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, now: DateTime<Utc>) {
        self.logs.push(JobLogEntry {
            at: now,
            level,
            message: message.into(),
        });
        self.updated_at = now;
    }

    fn move_to(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// `Pending -> Running` or a manual `Failed -> Running`.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status == JobStatus::Failed && self.retry_count >= self.max_retries {
            return Err(TransitionError::RetriesExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        let rearmed = self.status == JobStatus::Failed;
        self.move_to(JobStatus::Running, now)?;
        self.started_at = Some(now);
        self.completed_at = None;
        if rearmed {
            self.log(
                LogLevel::Info,
                format!(
                    "manual retry accepted ({}/{} retries used)",
                    self.retry_count, self.max_retries
                ),
                now,
            );
        }
        Ok(())
    }

    /// `Running -> Retrying`; returns the new retry count.
    pub fn schedule_retry(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u8, TransitionError> {
        if self.retry_count >= self.max_retries {
            return Err(TransitionError::RetriesExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.move_to(JobStatus::Retrying, now)?;
        self.retry_count += 1;
        self.log(
            LogLevel::Warn,
            format!(
                "attempt failed, retry {}/{}: {reason}",
                self.retry_count, self.max_retries
            ),
            now,
        );
        Ok(self.retry_count)
    }

    /// `Retrying -> Running` once the backoff expired.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Retrying {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        self.move_to(JobStatus::Running, now)
    }

    pub fn complete(
        &mut self,
        summary: ReconciliationSummary,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.move_to(JobStatus::Completed, now)?;
        let rate = summary.matching.overall_match_rate;
        self.result_summary = Some(summary);
        self.completed_at = Some(now);
        self.log(LogLevel::Info, format!("completed, match rate {rate:.2}%"), now);
        Ok(())
    }

    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.move_to(JobStatus::Failed, now)?;
        self.completed_at = Some(now);
        self.log(LogLevel::Error, reason, now);
        Ok(())
    }

    /// Raise the retry ceiling for a manual retry. Never lowers it.
    pub fn raise_ceiling(&mut self, max_retries: u8) -> Result<(), TransitionError> {
        if max_retries > MAX_RETRIES_CEILING {
            return Err(TransitionError::MaxRetriesOutOfRange(max_retries));
        }
        self.max_retries = self.max_retries.max(max_retries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn job(max_retries: u8) -> Job {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        )
        .unwrap();
        Job::new(TenantId::from("acme"), range, max_retries, JobTrigger::Manual, now()).unwrap()
    }

    #[test]
    fn rejects_unbounded_retry_ceiling() {
        let range = job(0).date_range;
        let err = Job::new(TenantId::from("acme"), range, 6, JobTrigger::Manual, now()).unwrap_err();
        assert_eq!(err, TransitionError::MaxRetriesOutOfRange(6));
    }

    #[test]
    fn retry_loop_counts_up_to_ceiling_then_refuses() {
        let mut job = job(2);
        job.begin_attempt(now()).unwrap();
        assert_eq!(job.schedule_retry("timeout", now()).unwrap(), 1);
        job.resume(now()).unwrap();
        assert_eq!(job.schedule_retry("timeout", now()).unwrap(), 2);
        job.resume(now()).unwrap();
        assert!(matches!(
            job.schedule_retry("timeout", now()),
            Err(TransitionError::RetriesExhausted { retry_count: 2, max_retries: 2 })
        ));
        job.fail("Failed after 3 attempts: timeout", now()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.can_retry());
        assert_eq!(job.last_error(), Some("Failed after 3 attempts: timeout"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn terminal_states_only_leave_through_manual_retry() {
        let mut job = job(3);
        job.begin_attempt(now()).unwrap();
        job.fail("boom", now()).unwrap();
        assert!(job.can_retry());
        assert!(job.resume(now()).is_err());

        job.begin_attempt(now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.completed_at.is_none());
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn manual_retry_requires_remaining_budget() {
        let mut job = job(1);
        job.begin_attempt(now()).unwrap();
        job.schedule_retry("503", now()).unwrap();
        job.resume(now()).unwrap();
        job.fail("503", now()).unwrap();
        assert!(matches!(
            job.begin_attempt(now()),
            Err(TransitionError::RetriesExhausted { .. })
        ));

        job.raise_ceiling(0).unwrap();
        assert_eq!(job.max_retries, 1);
        job.raise_ceiling(2).unwrap();
        assert!(job.can_retry());
        job.begin_attempt(now()).unwrap();
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn status_round_trips_through_its_label() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Retrying,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }
}
