use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use recon_adapters::{AdapterError, AdapterFactory, HttpAdapterFactory, SourceAdapter};
use recon_core::{
    ConfigError, DateRange, FixtureConfig, Frequency, Job, JobStatus, JobTrigger, Origin,
    Priority, RawRecord, ReconciliationSummary, Schedule, SourceConfig, TenantId,
};
use recon_engine::ComputationError;
use recon_storage::{
    HttpClientConfig, HttpFetcher, JobStore, MemoryStore, StaticCredentialStore, StoreError,
};
use recon_sync::{
    fire_schedule, JobEvent, JobManager, LifecycleConfig, LifecycleError, NotificationSink,
    Reconciler, TriggerError,
};
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

const BACKEND: &str = "acme-backend";
const ANALYTICS: &str = "acme-ga4";

fn acme() -> TenantId {
    TenantId::from("acme")
}

fn january() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
        NaiveDate::from_ymd_opt(2026, 1, 31).expect("date"),
    )
    .expect("range")
}

/// Canned fetch behaviour for one connector.
struct Script {
    records: Vec<RawRecord>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    /// Each fetch consumes one permit when set.
    gate: Option<Arc<Semaphore>>,
}

impl Script {
    fn ok(records: Vec<RawRecord>) -> Arc<Self> {
        Arc::new(Self {
            records,
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    fn failing(times: usize, records: Vec<RawRecord>) -> Arc<Self> {
        Arc::new(Self {
            records,
            failures_left: AtomicUsize::new(times),
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    fn gated(gate: Arc<Semaphore>, records: Vec<RawRecord>) -> Arc<Self> {
        Arc::new(Self {
            records,
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }
}

struct ScriptedAdapter {
    id: String,
    origin: Origin,
    script: Arc<Script>,
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn connector_id(&self) -> &str {
        &self.id
    }

    fn origin(&self) -> Origin {
        self.origin
    }

    async fn fetch(&self, _range: &DateRange) -> Result<Vec<RawRecord>, AdapterError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.script.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        let left = self.script.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.script.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(AdapterError::Malformed("scripted outage".into()));
        }
        Ok(self.script.records.clone())
    }
}

struct ScriptedFactory {
    scripts: HashMap<String, Arc<Script>>,
}

impl AdapterFactory for ScriptedFactory {
    fn build(
        &self,
        connector_id: &str,
        config: SourceConfig,
    ) -> Result<Box<dyn SourceAdapter>, AdapterError> {
        let script = self
            .scripts
            .get(connector_id)
            .cloned()
            .ok_or_else(|| ConfigError::invalid("connector", "no script"))?;
        Ok(Box::new(ScriptedAdapter {
            id: connector_id.to_string(),
            origin: config.origin(),
            script,
        }))
    }
}

/// Memory store that remembers every written status and can refuse one of them.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    written: Mutex<Vec<JobStatus>>,
    refuse: Option<JobStatus>,
}

impl RecordingStore {
    async fn written(&self) -> Vec<JobStatus> {
        self.written.lock().await.clone()
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        if self.refuse == Some(job.status) {
            return Err(StoreError::Unavailable(format!("refusing {}", job.status)));
        }
        self.written.lock().await.push(job.status);
        self.inner.upsert_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        self.inner.jobs_with_status(statuses).await
    }

    async fn jobs_for_tenant(&self, tenant: &TenantId, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.jobs_for_tenant(tenant, limit).await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<JobEvent>>,
    broken: bool,
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, event: &JobEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        if self.broken {
            anyhow::bail!("smtp relay down");
        }
        Ok(())
    }
}

fn credentials() -> StaticCredentialStore {
    let fixture = |origin| {
        SourceConfig::Fixture(FixtureConfig {
            path: "unused.json".into(),
            origin,
        })
    };
    StaticCredentialStore::new()
        .with_connector(&acme(), BACKEND, fixture(Origin::Backend))
        .with_connector(&acme(), ANALYTICS, fixture(Origin::Analytics))
}

fn scenario_a_backend() -> Vec<RawRecord> {
    vec![
        RawRecord::new("1", json!(10)),
        RawRecord::new("2", json!(20)),
        RawRecord::new("3", json!(30)),
    ]
}

fn scenario_a_analytics() -> Vec<RawRecord> {
    vec![
        RawRecord::new("2", json!(20)),
        RawRecord::new("3", json!(30)),
        RawRecord::new("4", json!(40)),
    ]
}

struct Harness {
    manager: JobManager,
    store: Arc<RecordingStore>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(
    backend: Arc<Script>,
    analytics: Arc<Script>,
    store: RecordingStore,
    notifier: RecordingNotifier,
    reconciler: Option<Reconciler>,
) -> Harness {
    let store = Arc::new(store);
    let notifier = Arc::new(notifier);
    let factory = ScriptedFactory {
        scripts: HashMap::from([(BACKEND.to_string(), backend), (ANALYTICS.to_string(), analytics)]),
    };
    let config = LifecycleConfig {
        workers: 2,
        fetch_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let manager = JobManager::with_reconciler(
        store.clone(),
        Arc::new(credentials()),
        Arc::new(factory),
        notifier.clone(),
        config,
        reconciler.unwrap_or(recon_engine::reconcile),
    );
    Harness {
        manager,
        store,
        notifier,
    }
}

fn healthy() -> Harness {
    harness(
        Script::ok(scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        None,
    )
}

#[tokio::test]
async fn successful_run_completes_and_notifies() {
    let h = healthy();
    let accepted = h
        .manager
        .run_now(acme(), january(), 3, JobTrigger::Manual)
        .await
        .expect("accepted");
    let job = accepted.wait().await.expect("run");

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    let summary = job.result_summary.as_ref().expect("summary");
    assert_eq!(summary.matching.overall_match_rate, 66.67);
    assert_eq!(
        h.store.written().await,
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
    );

    let events = h.notifier.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, JobStatus::Completed);
    assert!(events[0].summary.is_some());
    assert!(!h.manager.locks().is_held(&acme()).await);
}

#[tokio::test(start_paused = true)]
async fn failing_fetch_walks_the_backoff_ladder() {
    let backend = Script::failing(usize::MAX, Vec::new());
    let h = harness(
        backend.clone(),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        None,
    );
    let started = tokio::time::Instant::now();
    let job = h
        .manager
        .run_now(acme(), january(), 2, JobTrigger::Manual)
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");
    let elapsed = started.elapsed();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert!(!job.can_retry());
    assert!(job.last_error().expect("error").contains("giving up after 2 retries"));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    // 2s after the first failure, 4s after the second.
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    assert_eq!(
        h.store.written().await,
        vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Retrying,
            JobStatus::Running,
            JobStatus::Retrying,
            JobStatus::Running,
            JobStatus::Failed,
        ]
    );
    assert_eq!(h.notifier.events.lock().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fetch_timeout_feeds_the_retry_loop() {
    let never = Arc::new(Semaphore::new(0));
    let h = harness(
        Script::gated(never, Vec::new()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        None,
    );
    let started = tokio::time::Instant::now();
    let job = h
        .manager
        .run_now(acme(), january(), 1, JobTrigger::Manual)
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(job.last_error().expect("error").contains("timed out after 5s"));
    // Two 5s timeouts around one 2s backoff.
    assert!(started.elapsed() >= Duration::from_secs(12));
}

#[tokio::test]
async fn concurrent_triggers_admit_one_run() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        Script::gated(gate.clone(), scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        None,
    );

    let (first, second) = tokio::join!(
        h.manager.run_now(acme(), january(), 3, JobTrigger::Manual),
        h.manager.run_now(acme(), january(), 3, JobTrigger::Scheduled),
    );
    let (accepted, rejected) = match (first, second) {
        (Ok(accepted), Err(err)) | (Err(err), Ok(accepted)) => (accepted, err),
        other => panic!("expected exactly one accepted trigger, got {other:?}"),
    };
    assert!(matches!(rejected, TriggerError::Conflict(ref t) if t == &acme()));
    assert!(h.manager.locks().is_held(&acme()).await);

    // Other tenants are unaffected.
    let other = h
        .manager
        .run_now(TenantId::from("globex"), january(), 0, JobTrigger::Manual)
        .await
        .expect("independent tenant");

    gate.add_permits(16);
    assert_eq!(accepted.wait().await.expect("run").status, JobStatus::Completed);
    // No connectors configured for globex.
    let globex = other.wait().await.expect("run");
    assert_eq!(globex.status, JobStatus::Failed);
    assert_eq!(globex.retry_count, 0);

    h.manager
        .run_now(acme(), january(), 3, JobTrigger::Manual)
        .await
        .expect("tenant free again");
}

fn broken_reconciler(
    _range: DateRange,
    _backend: &[RawRecord],
    _analytics: &[RawRecord],
) -> Result<ReconciliationSummary, ComputationError> {
    Err(ComputationError::NotAPartition {
        backend: 3,
        analytics: 3,
    })
}

#[tokio::test]
async fn computation_error_fails_without_retry() {
    let h = harness(
        Script::ok(scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        Some(broken_reconciler),
    );
    let job = h
        .manager
        .run_now(acme(), january(), 3, JobTrigger::Manual)
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(job.can_retry());
    assert!(job.last_error().expect("error").contains("reconciliation failed"));
    assert_eq!(
        h.store.written().await,
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Failed]
    );
}

#[tokio::test]
async fn persistence_error_aborts_and_keeps_last_durable_state() {
    let h = harness(
        Script::ok(scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore {
            refuse: Some(JobStatus::Completed),
            ..RecordingStore::default()
        },
        RecordingNotifier::default(),
        None,
    );
    let accepted = h
        .manager
        .run_now(acme(), january(), 3, JobTrigger::Manual)
        .await
        .expect("accepted");
    let job_id = accepted.job_id;
    let err = accepted.wait().await.expect_err("store refuses completion");
    assert!(matches!(err, LifecycleError::Store(_)));

    let stored = h.store.get_job(job_id).await.expect("read").expect("job");
    assert_eq!(stored.status, JobStatus::Running);
    assert!(stored.result_summary.is_none());
    assert!(h.notifier.events.lock().await.is_empty());
    assert!(!h.manager.locks().is_held(&acme()).await);
}

#[tokio::test]
async fn notifier_failure_does_not_change_job_state() {
    let h = harness(
        Script::ok(scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier {
            broken: true,
            ..RecordingNotifier::default()
        },
        None,
    );
    let accepted = h
        .manager
        .run_now(acme(), january(), 3, JobTrigger::Manual)
        .await
        .expect("accepted");
    let job_id = accepted.job_id;
    let job = accepted.wait().await.expect("run");
    assert_eq!(job.status, JobStatus::Completed);
    let stored = h.store.get_job(job_id).await.expect("read").expect("job");
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(h.notifier.events.lock().await.len(), 1);
}

#[tokio::test]
async fn manual_retry_raises_ceiling_but_keeps_count() {
    let h = harness(
        Script::failing(1, scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        None,
    );
    let failed = h
        .manager
        .run_now(acme(), january(), 0, JobTrigger::Manual)
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(!failed.can_retry());

    assert!(matches!(
        h.manager.retry(failed.id, None).await,
        Err(TriggerError::NotRetryable { .. })
    ));
    assert!(matches!(
        h.manager.retry(failed.id, Some(9)).await,
        Err(TriggerError::InvalidMaxRetries(9))
    ));
    assert!(matches!(
        h.manager.retry(Uuid::new_v4(), Some(1)).await,
        Err(TriggerError::NotFound(_))
    ));

    let retried = h
        .manager
        .retry(failed.id, Some(1))
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");
    assert_eq!(retried.id, failed.id);
    assert_eq!(retried.status, JobStatus::Completed);
    assert_eq!(retried.retry_count, 0);
    assert_eq!(retried.max_retries, 1);
    assert!(retried.logs.iter().any(|l| l.message.contains("manual retry accepted")));

    assert!(matches!(
        h.manager.retry(failed.id, Some(5)).await,
        Err(TriggerError::NotRetryable { .. })
    ));
}

#[tokio::test]
async fn retry_conflicts_with_an_active_run() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        Script::gated(gate.clone(), scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        Some(broken_reconciler),
    );
    gate.add_permits(1);
    let failed = h
        .manager
        .run_now(acme(), january(), 2, JobTrigger::Manual)
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");
    assert_eq!(failed.status, JobStatus::Failed);

    let running = h
        .manager
        .run_now(acme(), january(), 2, JobTrigger::Manual)
        .await
        .expect("accepted");
    assert!(matches!(
        h.manager.retry(failed.id, None).await,
        Err(TriggerError::Conflict(_))
    ));
    gate.add_permits(1);
    running.wait().await.expect("run");
}

#[tokio::test]
async fn orphaned_jobs_fail_on_recovery() {
    let h = healthy();
    let now = Utc::now();
    let mut orphan = Job::new(acme(), january(), 3, JobTrigger::Scheduled, now).expect("job");
    orphan.begin_attempt(now).expect("start");
    h.store.upsert_job(&orphan).await.expect("seed");
    let done = h
        .manager
        .run_now(TenantId::from("acme"), january(), 0, JobTrigger::Manual)
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");

    assert_eq!(h.manager.recover_orphans().await.expect("recover"), 1);
    let recovered = h.store.get_job(orphan.id).await.expect("read").expect("job");
    assert_eq!(recovered.status, JobStatus::Failed);
    assert!(recovered.last_error().expect("error").contains("interrupted"));
    assert!(recovered.can_retry());
    let untouched = h.store.get_job(done.id).await.expect("read").expect("job");
    assert_eq!(untouched.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_backoff_wait() {
    let h = harness(
        Script::failing(usize::MAX, Vec::new()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        None,
    );
    let accepted = h
        .manager
        .run_now(acme(), january(), 3, JobTrigger::Manual)
        .await
        .expect("accepted");
    tokio::time::sleep(Duration::from_millis(500)).await;

    h.manager.shutdown().await;
    let job = accepted.wait().await.expect("run");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(job
        .last_error()
        .expect("error")
        .contains("interrupted during retry backoff"));
    assert!(matches!(
        h.manager
            .run_now(acme(), january(), 3, JobTrigger::Manual)
            .await,
        Err(TriggerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn scheduled_fire_is_dropped_while_tenant_busy() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        Script::gated(gate.clone(), scenario_a_backend()),
        Script::ok(scenario_a_analytics()),
        RecordingStore::default(),
        RecordingNotifier::default(),
        None,
    );
    let schedule = Schedule::new(acme(), Frequency::Daily);

    let first = fire_schedule(&h.manager, &schedule, Utc::now()).await;
    assert!(first.is_some());
    assert!(fire_schedule(&h.manager, &schedule, Utc::now()).await.is_none());

    gate.add_permits(1);
    let jobs = h.store.jobs_for_tenant(&acme(), 10).await.expect("jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, JobTrigger::Scheduled);
    assert_eq!(jobs[0].date_range.days(), 31);
}

#[tokio::test]
async fn stored_schedule_with_bad_range_is_skipped() {
    let h = healthy();
    let mut schedule = Schedule::new(acme(), Frequency::Daily);
    schedule.date_range = serde_json::from_value(json!({ "days": 4_000_000_000u32 }))
        .expect("stored date range");

    assert!(fire_schedule(&h.manager, &schedule, Utc::now()).await.is_none());
    assert!(h.store.written().await.is_empty());
    assert!(!h.manager.locks().is_held(&acme()).await);

    schedule.date_range.days = 7;
    assert!(fire_schedule(&h.manager, &schedule, Utc::now()).await.is_some());
}

#[tokio::test]
async fn fixture_tenant_reconciles_end_to_end() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/acme");
    let credentials = StaticCredentialStore::new()
        .with_connector(
            &acme(),
            BACKEND,
            SourceConfig::Fixture(FixtureConfig {
                path: root.join("backend.json"),
                origin: Origin::Backend,
            }),
        )
        .with_connector(
            &acme(),
            ANALYTICS,
            SourceConfig::Fixture(FixtureConfig {
                path: root.join("analytics.json"),
                origin: Origin::Analytics,
            }),
        );
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client"));
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = JobManager::new(
        Arc::new(MemoryStore::new()),
        Arc::new(credentials),
        Arc::new(HttpAdapterFactory::new(http)),
        notifier.clone(),
        LifecycleConfig::default(),
    );

    let job = manager
        .run_now(acme(), january(), 3, JobTrigger::Manual)
        .await
        .expect("accepted")
        .wait()
        .await
        .expect("run");
    assert_eq!(job.status, JobStatus::Completed);
    let summary = job.result_summary.expect("summary");
    assert_eq!(summary.matching.matched.len(), 6);
    assert_eq!(summary.matching.overall_match_rate, 60.0);
    assert!(summary.matching.analytics_only.contains("9001"));
    assert!(!summary.matching.value_deltas["5109"].exact);

    let first = &summary.recommendations[0];
    assert_eq!(first.priority, Priority::Critical);
    assert_eq!(first.subject, "Bank Transfer");
    assert_eq!(first.impact_value.to_string(), "1115.25");
    assert_eq!(notifier.events.lock().await.len(), 1);
}
