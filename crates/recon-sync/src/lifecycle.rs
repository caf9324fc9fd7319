//! Job lifecycle: trigger acceptance, the attempt/backoff loop and durable transitions.
//!
//! Every state change goes through `JobManager::commit`: the job is cloned, the
//! transition applied to the clone, the clone written to the store, and only then
//! does it replace the in-memory copy. A failed write leaves the caller holding the
//! last durable state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recon_adapters::{AdapterError, AdapterFactory, SourceAdapter};
use recon_core::{
    DateRange, Job, JobStatus, JobTrigger, Origin, RawRecord, ReconciliationSummary,
    TenantId, TransitionError, MAX_RETRIES_CEILING,
};
use recon_engine::ComputationError;
use recon_storage::{BackoffPolicy, CredentialStore, JobStore, RetryDisposition, StoreError};
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::locks::{TenantLocks, TenantPermit};
use crate::notify::{JobEvent, NotificationSink};

/// The pure pipeline a job runs once both sides are fetched.
pub type Reconciler =
    fn(DateRange, &[RawRecord], &[RawRecord]) -> Result<ReconciliationSummary, ComputationError>;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Attempts that may fetch or compute at the same time, across tenants.
    pub workers: usize,
    pub fetch_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            fetch_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Rejection of a run or retry request. Nothing was started.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("tenant `{0}` already has an active run")]
    Conflict(TenantId),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} cannot be retried: {reason}")]
    NotRetryable { job_id: Uuid, reason: String },
    #[error("max_retries {0} outside 0..={MAX_RETRIES_CEILING}")]
    InvalidMaxRetries(u8),
    #[error("job manager is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A run that stopped without reaching a terminal state.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("persisting job transition: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("job task ended without reporting")]
    Aborted,
}

/// How one attempt went wrong.
#[derive(Debug)]
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

impl AttemptError {
    fn from_adapter(connector_id: &str, err: AdapterError) -> Self {
        let message = format!("{connector_id}: {err}");
        match err.disposition() {
            RetryDisposition::Retryable => AttemptError::Retryable(message),
            RetryDisposition::NonRetryable => AttemptError::Fatal(message),
        }
    }
}

/// An accepted trigger. `wait` resolves once the run is terminal or aborted.
#[derive(Debug)]
pub struct Accepted {
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    outcome: oneshot::Receiver<Result<Job, LifecycleError>>,
}

impl Accepted {
    pub async fn wait(self) -> Result<Job, LifecycleError> {
        self.outcome.await.unwrap_or(Err(LifecycleError::Aborted))
    }
}

struct Inner {
    jobs: Arc<dyn JobStore>,
    credentials: Arc<dyn CredentialStore>,
    adapters: Arc<dyn AdapterFactory>,
    notifier: Arc<dyn NotificationSink>,
    reconciler: Reconciler,
    locks: TenantLocks,
    workers: Arc<Semaphore>,
    config: LifecycleConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

/// Sole writer of job records.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        adapters: Arc<dyn AdapterFactory>,
        notifier: Arc<dyn NotificationSink>,
        config: LifecycleConfig,
    ) -> Self {
        Self::with_reconciler(
            jobs,
            credentials,
            adapters,
            notifier,
            config,
            recon_engine::reconcile,
        )
    }

    pub fn with_reconciler(
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        adapters: Arc<dyn AdapterFactory>,
        notifier: Arc<dyn NotificationSink>,
        config: LifecycleConfig,
        reconciler: Reconciler,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                jobs,
                credentials,
                adapters,
                notifier,
                reconciler,
                locks: TenantLocks::new(),
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                config,
                shutdown,
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn locks(&self) -> &TenantLocks {
        &self.inner.locks
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.inner.jobs
    }

    fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Start a run for `tenant` unless one is already active.
    pub async fn run_now(
        &self,
        tenant: TenantId,
        range: DateRange,
        max_retries: u8,
        trigger: JobTrigger,
    ) -> Result<Accepted, TriggerError> {
        if self.is_shutting_down() {
            return Err(TriggerError::ShuttingDown);
        }
        if max_retries > MAX_RETRIES_CEILING {
            return Err(TriggerError::InvalidMaxRetries(max_retries));
        }
        let permit = self
            .inner
            .locks
            .try_acquire(&tenant)
            .await
            .ok_or_else(|| TriggerError::Conflict(tenant.clone()))?;

        let job = Job::new(tenant, range, max_retries, trigger, Utc::now())
            .map_err(|_| TriggerError::InvalidMaxRetries(max_retries))?;
        self.inner.jobs.upsert_job(&job).await?;
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            trigger = job.trigger.as_str(),
            range = %job.date_range,
            max_retries,
            "run accepted"
        );
        self.spawn(job, permit).await
    }

    /// Re-arm a `Failed` job. `max_retries` may raise its ceiling, never lower it.
    /// The retry count is kept.
    pub async fn retry(&self, job_id: Uuid, max_retries: Option<u8>) -> Result<Accepted, TriggerError> {
        if self.is_shutting_down() {
            return Err(TriggerError::ShuttingDown);
        }
        if let Some(max) = max_retries.filter(|m| *m > MAX_RETRIES_CEILING) {
            return Err(TriggerError::InvalidMaxRetries(max));
        }
        let tenant = self
            .inner
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(TriggerError::NotFound(job_id))?
            .tenant_id;
        let permit = self
            .inner
            .locks
            .try_acquire(&tenant)
            .await
            .ok_or_else(|| TriggerError::Conflict(tenant.clone()))?;

        // Read again under the lock; the first read only located the tenant.
        let mut job = self
            .inner
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(TriggerError::NotFound(job_id))?;
        if job.status != JobStatus::Failed {
            return Err(TriggerError::NotRetryable {
                job_id,
                reason: format!("status is {}", job.status),
            });
        }
        if let Some(max) = max_retries {
            job.raise_ceiling(max)
                .map_err(|_| TriggerError::InvalidMaxRetries(max))?;
        }
        if !job.can_retry() {
            return Err(TriggerError::NotRetryable {
                job_id,
                reason: format!(
                    "retries exhausted ({}/{})",
                    job.retry_count, job.max_retries
                ),
            });
        }
        info!(%job_id, tenant_id = %job.tenant_id, max_retries = job.max_retries, "manual retry accepted");
        self.spawn(job, permit).await
    }

    async fn spawn(&self, mut job: Job, permit: TenantPermit) -> Result<Accepted, TriggerError> {
        let mut tasks = self.inner.tasks.lock().await;
        // `shutdown` drains the set under this lock; a task added afterwards is never joined.
        if self.is_shutting_down() {
            drop(tasks);
            if job.status == JobStatus::Pending && job.fail("rejected: shutting down", Utc::now()).is_ok() {
                self.inner.jobs.upsert_job(&job).await?;
            }
            drop(permit);
            return Err(TriggerError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        let accepted = Accepted {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            outcome: rx,
        };
        let span = info_span!("job", job_id = %job.id, tenant_id = %job.tenant_id);
        let manager = self.clone();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(
            async move {
                let outcome = manager.drive(job, permit).await;
                if let Err(err) = &outcome {
                    error!(error = %err, "run aborted");
                }
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );
        Ok(accepted)
    }

    /// Apply `transition` to a copy of `job`, persist it, then adopt it.
    async fn commit<T>(
        &self,
        job: &mut Job,
        transition: impl FnOnce(&mut Job) -> Result<T, TransitionError>,
    ) -> Result<T, LifecycleError> {
        let mut next = job.clone();
        let out = transition(&mut next)?;
        self.inner.jobs.upsert_job(&next).await?;
        *job = next;
        Ok(out)
    }

    async fn finish(&self, job: Job) -> Result<Job, LifecycleError> {
        if let Some(event) = JobEvent::from_job(&job) {
            if let Err(err) = self.inner.notifier.notify(&event).await {
                warn!(job_id = %job.id, error = %err, "notification failed");
            }
        }
        Ok(job)
    }

    /// Holds the tenant permit from the first attempt until the job is terminal,
    /// backoff waits included.
    async fn drive(&self, mut job: Job, permit: TenantPermit) -> Result<Job, LifecycleError> {
        let _permit = permit;
        let mut shutdown = self.inner.shutdown.subscribe();
        self.commit(&mut job, |j| j.begin_attempt(Utc::now())).await?;

        loop {
            info!(attempt = job.retry_count + 1, "attempt started");
            let failure = match self.attempt(&job).await {
                Ok(summary) => {
                    self.commit(&mut job, |j| j.complete(summary, Utc::now()))
                        .await?;
                    info!(
                        match_rate = job
                            .result_summary
                            .as_ref()
                            .map(|s| s.matching.overall_match_rate),
                        "run completed"
                    );
                    return self.finish(job).await;
                }
                Err(failure) => failure,
            };

            let reason = match failure {
                AttemptError::Fatal(reason) => {
                    error!(%reason, "attempt failed, not retrying");
                    self.commit(&mut job, |j| j.fail(&reason, Utc::now())).await?;
                    return self.finish(job).await;
                }
                AttemptError::Retryable(reason) => reason,
            };

            if job.retry_count >= job.max_retries {
                let message = format!(
                    "giving up after {} retries: {reason}",
                    job.retry_count
                );
                error!(retry_count = job.retry_count, %reason, "retries exhausted");
                self.commit(&mut job, |j| j.fail(&message, Utc::now())).await?;
                return self.finish(job).await;
            }

            let retry_count = self
                .commit(&mut job, |j| j.schedule_retry(&reason, Utc::now()))
                .await?;
            let delay = self.inner.config.backoff.delay_for_retry(retry_count);
            warn!(retry_count, delay_secs = delay.as_secs(), %reason, "attempt failed, backing off");

            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => true,
            };
            if interrupted {
                warn!("backoff interrupted by shutdown");
                self.commit(&mut job, |j| {
                    j.fail("interrupted during retry backoff by shutdown", Utc::now())
                })
                .await?;
                return self.finish(job).await;
            }
            self.commit(&mut job, |j| j.resume(Utc::now())).await?;
        }
    }

    /// Fetch both sides and reconcile. Holds a worker slot for the duration.
    async fn attempt(&self, job: &Job) -> Result<ReconciliationSummary, AttemptError> {
        let _worker = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AttemptError::Fatal("worker pool closed".into()))?;

        let adapters = self.adapters_for(&job.tenant_id).await?;
        let (backend, analytics): (Vec<_>, Vec<_>) = adapters
            .into_iter()
            .partition(|adapter| adapter.origin() == Origin::Backend);
        if backend.is_empty() || analytics.is_empty() {
            return Err(AttemptError::Fatal(format!(
                "tenant `{}` needs a backend and an analytics connector",
                job.tenant_id
            )));
        }

        let range = job.date_range;
        let (backend_raw, analytics_raw) = tokio::join!(
            self.fetch_side(&backend, &range),
            self.fetch_side(&analytics, &range)
        );
        let (backend_raw, analytics_raw) = (backend_raw?, analytics_raw?);

        let reconciler = self.inner.reconciler;
        tokio::task::spawn_blocking(move || reconciler(range, &backend_raw, &analytics_raw))
            .await
            .map_err(|err| AttemptError::Fatal(format!("reconciliation panicked: {err}")))?
            .map_err(|err| AttemptError::Fatal(format!("reconciliation failed: {err}")))
    }

    async fn adapters_for(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<Box<dyn SourceAdapter>>, AttemptError> {
        let connectors = self
            .inner
            .credentials
            .connectors_for(tenant)
            .await
            .map_err(|err| AttemptError::Retryable(format!("loading connectors: {err}")))?;
        let mut adapters = Vec::with_capacity(connectors.len());
        for connector_id in connectors {
            let config = match self.inner.credentials.resolve(&connector_id).await {
                Ok(config) => config,
                Err(StoreError::UnknownConnector(id)) => {
                    return Err(AttemptError::Fatal(format!("connector `{id}` has no credentials")))
                }
                Err(err) => {
                    return Err(AttemptError::Retryable(format!(
                        "resolving `{connector_id}`: {err}"
                    )))
                }
            };
            let adapter = self
                .inner
                .adapters
                .build(&connector_id, config)
                .map_err(|err| AttemptError::from_adapter(&connector_id, err))?;
            adapters.push(adapter);
        }
        Ok(adapters)
    }

    /// Every adapter of one side, each bounded by the fetch timeout.
    async fn fetch_side(
        &self,
        adapters: &[Box<dyn SourceAdapter>],
        range: &DateRange,
    ) -> Result<Vec<RawRecord>, AttemptError> {
        let timeout = self.inner.config.fetch_timeout;
        let mut records = Vec::new();
        for adapter in adapters {
            let id = adapter.connector_id();
            match tokio::time::timeout(timeout, adapter.fetch(range)).await {
                Ok(Ok(batch)) => {
                    info!(connector_id = id, origin = %adapter.origin(), records = batch.len(), "fetched");
                    records.extend(batch);
                }
                Ok(Err(err)) => return Err(AttemptError::from_adapter(id, err)),
                Err(_) => {
                    return Err(AttemptError::Retryable(format!(
                        "{id}: fetch timed out after {}s",
                        timeout.as_secs()
                    )))
                }
            }
        }
        Ok(records)
    }

    /// Fail jobs a previous process left non-terminal. Run before accepting triggers.
    pub async fn recover_orphans(&self) -> Result<usize, LifecycleError> {
        let orphans = self
            .inner
            .jobs
            .jobs_with_status(&[JobStatus::Pending, JobStatus::Running, JobStatus::Retrying])
            .await?;
        let mut recovered = 0;
        for mut job in orphans {
            if self.inner.locks.is_held(&job.tenant_id).await {
                continue;
            }
            let previous = job.status;
            self.commit(&mut job, |j| {
                j.fail(
                    &format!("interrupted: process stopped while job was {previous}"),
                    Utc::now(),
                )
            })
            .await?;
            warn!(job_id = %job.id, tenant_id = %job.tenant_id, %previous, "orphaned job failed");
            self.finish(job).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Refuse new triggers, interrupt backoff waits and wait for running attempts.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let mut tasks = self.inner.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        info!("job manager stopped");
    }
}
