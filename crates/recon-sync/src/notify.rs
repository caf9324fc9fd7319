use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{Job, JobStatus, ReconciliationSummary, TenantId};
use recon_storage::HttpFetcher;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Emitted once a job reaches `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ReconciliationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    /// `None` for jobs that are not terminal.
    pub fn from_job(job: &Job) -> Option<Self> {
        if !job.status.is_terminal() {
            return None;
        }
        Some(Self {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            status: job.status,
            summary: job.result_summary.clone(),
            error: match job.status {
                JobStatus::Failed => job.last_error().map(str::to_string),
                _ => None,
            },
            at: job.completed_at.unwrap_or(job.updated_at),
        })
    }

    pub fn name(&self) -> &'static str {
        match self.status {
            JobStatus::Completed => "reconciliation.completed",
            _ => "reconciliation.failed",
        }
    }
}

/// Delivery of terminal job events. Failures are logged by the caller and never
/// touch job state.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &JobEvent) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, event: &JobEvent) -> Result<()> {
        match &event.error {
            Some(error) => warn!(
                job_id = %event.job_id,
                tenant_id = %event.tenant_id,
                error = %error,
                "reconciliation failed"
            ),
            None => info!(
                job_id = %event.job_id,
                tenant_id = %event.tenant_id,
                match_rate = event.summary.as_ref().map(|s| s.matching.overall_match_rate),
                "reconciliation completed"
            ),
        }
        Ok(())
    }
}

/// POSTs `{event, timestamp, data}` to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: Arc<HttpFetcher>,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
        }
    }

    pub fn payload(event: &JobEvent) -> Result<serde_json::Value> {
        Ok(json!({
            "event": event.name(),
            "timestamp": event.at.to_rfc3339(),
            "data": serde_json::to_value(event)?,
        }))
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, event: &JobEvent) -> Result<()> {
        let mut request = self.http.client().post(&self.url).json(&Self::payload(event)?);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        self.http.send("webhook", request).await?;
        info!(job_id = %event.job_id, url = %self.url, "webhook delivered");
        Ok(())
    }
}
