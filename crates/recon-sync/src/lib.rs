//! Job orchestration: lifecycle manager, per-tenant locks, scheduler and notifications.

mod config;
mod lifecycle;
mod locks;
mod notify;
mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use recon_adapters::HttpAdapterFactory;
use recon_storage::{
    CredentialStore, HttpClientConfig, HttpFetcher, JobStore, MemoryStore, PgStore, ScheduleStore,
};
use tracing::info;

pub use config::{ConnectorEntry, ReconConfig, ScheduleEntry, TenantEntry, TenantRegistry};
pub use lifecycle::{
    Accepted, JobManager, LifecycleConfig, LifecycleError, Reconciler, TriggerError,
};
pub use locks::{TenantLocks, TenantPermit};
pub use notify::{JobEvent, NotificationSink, TracingNotifier, WebhookNotifier};
pub use scheduler::{
    cron_for, fire_schedule, next_fire_utc, plan_triggers, resolve_timezone, CronTriggerRuntime,
    Scheduler, TriggerPlan, TriggerRuntime,
};

pub const CRATE_NAME: &str = "recon-sync";

/// Everything a process needs to accept triggers, wired from configuration.
pub struct ReconService {
    pub config: ReconConfig,
    pub registry: TenantRegistry,
    pub manager: JobManager,
    pub schedules: Arc<dyn ScheduleStore>,
    pub persistence: &'static str,
}

impl ReconService {
    /// Postgres when `DATABASE_URL` is set, in-memory tables otherwise. Registry
    /// schedules are written into whichever schedule table is in use.
    pub async fn from_config(config: ReconConfig) -> Result<Self> {
        let registry = TenantRegistry::load(&config.registry_path).await?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let (jobs, schedules, persistence): (Arc<dyn JobStore>, Arc<dyn ScheduleStore>, _) =
            match &config.database_url {
                Some(url) => {
                    let pg = Arc::new(
                        PgStore::connect(url)
                            .await
                            .context("connecting to postgres")?,
                    );
                    pg.migrate().await.context("running migrations")?;
                    for schedule in registry.schedules() {
                        pg.upsert_schedule(&schedule)
                            .await
                            .with_context(|| format!("seeding schedule of {}", schedule.tenant_id))?;
                    }
                    let jobs: Arc<dyn JobStore> = pg.clone();
                    let schedules: Arc<dyn ScheduleStore> = pg;
                    (jobs, schedules, "postgres")
                }
                None => {
                    let mem = Arc::new(MemoryStore::new());
                    for schedule in registry.schedules() {
                        mem.put_schedule(schedule).await;
                    }
                    let jobs: Arc<dyn JobStore> = mem.clone();
                    let schedules: Arc<dyn ScheduleStore> = mem;
                    (jobs, schedules, "memory")
                }
            };

        let notifier: Arc<dyn NotificationSink> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(
                http.clone(),
                url.clone(),
                config.webhook_token.clone(),
            )),
            None => Arc::new(TracingNotifier),
        };
        let credentials: Arc<dyn CredentialStore> = Arc::new(registry.credentials());
        let manager = JobManager::new(
            jobs,
            credentials,
            Arc::new(HttpAdapterFactory::new(http)),
            notifier,
            LifecycleConfig {
                workers: config.workers,
                fetch_timeout: config.fetch_timeout,
                ..Default::default()
            },
        );
        info!(
            persistence,
            tenants = registry.tenants.len(),
            workers = config.workers,
            "reconciliation service ready"
        );
        Ok(Self {
            config,
            registry,
            manager,
            schedules,
            persistence,
        })
    }
}
