use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use recon_core::{Frequency, JobTrigger, Schedule, TenantId};
use recon_storage::ScheduleStore;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::lifecycle::{JobManager, TriggerError};

/// IANA zone of a schedule, UTC when the name is unknown.
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = name, "unknown timezone, falling back to UTC");
            Tz::UTC
        }
    }
}

/// Six-field cron (`sec min hour dom month dow`) in the schedule's own zone.
pub fn cron_for(schedule: &Schedule) -> String {
    let time = schedule.fire_time();
    match schedule.frequency {
        Frequency::Hourly => "0 0 * * * *".to_string(),
        Frequency::Daily => format!("{} {} {} * * *", time.second(), time.minute(), time.hour()),
        Frequency::Weekly => format!(
            "{} {} {} * * {}",
            time.second(),
            time.minute(),
            time.hour(),
            schedule.fire_weekday()
        ),
    }
}

/// Next fire instant after `now`, in UTC.
pub fn next_fire_utc(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz = resolve_timezone(&schedule.timezone);
    schedule
        .next_fire_after(&now.with_timezone(&tz))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Start a scheduled run. A tenant that is already running is skipped, not queued.
pub async fn fire_schedule(
    manager: &JobManager,
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Option<Uuid> {
    let tz = resolve_timezone(&schedule.timezone);
    let today = now.with_timezone(&tz).date_naive();
    let tenant = &schedule.tenant_id;
    let range = match schedule.date_range.resolve(today) {
        Ok(range) => range,
        Err(err) => {
            warn!(tenant_id = %tenant, error = %err, "schedule date range invalid, fire skipped");
            return None;
        }
    };
    match manager
        .run_now(
            tenant.clone(),
            range,
            schedule.date_range.max_retries,
            JobTrigger::Scheduled,
        )
        .await
    {
        Ok(accepted) => {
            info!(tenant_id = %tenant, job_id = %accepted.job_id, %range, "scheduled run started");
            Some(accepted.job_id)
        }
        Err(TriggerError::Conflict(_)) => {
            info!(tenant_id = %tenant, "run already active, scheduled fire skipped");
            None
        }
        Err(err) => {
            warn!(tenant_id = %tenant, error = %err, "scheduled fire rejected");
            None
        }
    }
}

/// Where triggers live. The scheduler only decides which ones should exist.
#[async_trait]
pub trait TriggerRuntime: Send + Sync {
    async fn install(&self, schedule: &Schedule) -> Result<Uuid>;

    async fn remove(&self, trigger: Uuid) -> Result<()>;
}

/// Triggers backed by `tokio-cron-scheduler`, firing into a [`JobManager`].
#[derive(Clone)]
pub struct CronTriggerRuntime {
    sched: JobScheduler,
    manager: JobManager,
}

impl CronTriggerRuntime {
    pub async fn new(manager: JobManager) -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self { sched, manager })
    }

    pub async fn start(&self) -> Result<()> {
        self.sched.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut sched = self.sched.clone();
        sched.shutdown().await.context("stopping scheduler")
    }
}

#[async_trait]
impl TriggerRuntime for CronTriggerRuntime {
    async fn install(&self, schedule: &Schedule) -> Result<Uuid> {
        let cron = cron_for(schedule);
        let tz = resolve_timezone(&schedule.timezone);
        let manager = self.manager.clone();
        let schedule = schedule.clone();
        let job = CronJob::new_async_tz(cron.as_str(), tz, move |_uuid, _l| {
            let manager = manager.clone();
            let schedule = schedule.clone();
            Box::pin(async move {
                fire_schedule(&manager, &schedule, Utc::now()).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        self.sched.add(job).await.context("adding scheduler job")
    }

    async fn remove(&self, trigger: Uuid) -> Result<()> {
        self.sched
            .remove(&trigger)
            .await
            .with_context(|| format!("removing scheduler job {trigger}"))
    }
}

/// Difference between installed and desired triggers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerPlan {
    pub add: Vec<Schedule>,
    pub replace: Vec<Schedule>,
    pub remove: Vec<TenantId>,
}

impl TriggerPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.replace.is_empty() && self.remove.is_empty()
    }
}

/// Pure diff. Inactive desired schedules count as absent.
pub fn plan_triggers(active: &BTreeMap<TenantId, Schedule>, desired: &[Schedule]) -> TriggerPlan {
    let desired: BTreeMap<&TenantId, &Schedule> = desired
        .iter()
        .filter(|s| s.is_active)
        .map(|s| (&s.tenant_id, s))
        .collect();

    let mut plan = TriggerPlan::default();
    for (tenant, schedule) in &desired {
        match active.get(*tenant) {
            None => plan.add.push((*schedule).clone()),
            Some(current) if current != *schedule => plan.replace.push((*schedule).clone()),
            Some(_) => {}
        }
    }
    plan.remove = active
        .keys()
        .filter(|tenant| !desired.contains_key(tenant))
        .cloned()
        .collect();
    plan
}

struct InstalledTrigger {
    schedule: Schedule,
    handle: Uuid,
}

/// Periodic reload of schedules into the trigger runtime.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    runtime: Arc<dyn TriggerRuntime>,
    installed: Mutex<BTreeMap<TenantId, InstalledTrigger>>,
    reload_every: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        runtime: Arc<dyn TriggerRuntime>,
        reload_every: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            installed: Mutex::new(BTreeMap::new()),
            reload_every,
        }
    }

    pub async fn installed_tenants(&self) -> Vec<TenantId> {
        self.installed.lock().await.keys().cloned().collect()
    }

    /// One reload: read schedules, diff, apply. A trigger that fails to install is
    /// left out and tried again on the next reload.
    pub async fn reconcile_once(&self) -> Result<TriggerPlan> {
        let desired = self
            .store
            .active_schedules()
            .await
            .context("loading active schedules")?;
        let mut installed = self.installed.lock().await;
        let current: BTreeMap<TenantId, Schedule> = installed
            .iter()
            .map(|(tenant, t)| (tenant.clone(), t.schedule.clone()))
            .collect();
        let plan = plan_triggers(&current, &desired);
        if plan.is_empty() {
            debug!(schedules = desired.len(), "schedules unchanged");
            return Ok(plan);
        }

        for tenant in plan.remove.iter().chain(plan.replace.iter().map(|s| &s.tenant_id)) {
            if let Some(old) = installed.remove(tenant) {
                if let Err(err) = self.runtime.remove(old.handle).await {
                    warn!(tenant_id = %tenant, error = %err, "removing trigger failed");
                }
            }
        }
        for schedule in plan.replace.iter().chain(plan.add.iter()) {
            match self.runtime.install(schedule).await {
                Ok(handle) => {
                    installed.insert(
                        schedule.tenant_id.clone(),
                        InstalledTrigger {
                            schedule: schedule.clone(),
                            handle,
                        },
                    );
                }
                Err(err) => {
                    warn!(tenant_id = %schedule.tenant_id, error = %err, "installing trigger failed");
                }
            }
        }
        info!(
            added = plan.add.len(),
            replaced = plan.replace.len(),
            removed = plan.remove.len(),
            installed = installed.len(),
            "schedules reloaded"
        );
        Ok(plan)
    }

    /// Reload every `reload_every` until `shutdown` turns true, then drop all triggers.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.reload_every);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.reconcile_once().await {
                        warn!(error = %format!("{err:#}"), "schedule reload failed");
                    }
                }
                // The `watch::Ref` must not outlive this arm; it is not `Send`.
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
        let mut installed = self.installed.lock().await;
        for (tenant, trigger) in std::mem::take(&mut *installed) {
            if let Err(err) = self.runtime.remove(trigger.handle).await {
                warn!(tenant_id = %tenant, error = %err, "removing trigger failed");
            }
        }
        info!("scheduler stopped");
    }
}
