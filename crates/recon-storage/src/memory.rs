use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use recon_core::{Job, JobStatus, Schedule, SourceConfig, TenantId};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{CredentialStore, JobStore, ScheduleStore, StoreError};

/// In-process job and schedule tables, used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    schedules: RwLock<BTreeMap<TenantId, Schedule>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// One schedule per tenant; a second put replaces the first.
    pub async fn put_schedule(&self, schedule: Schedule) {
        self.schedules
            .write()
            .await
            .insert(schedule.tenant_id.clone(), schedule);
    }

    pub async fn remove_schedule(&self, tenant: &TenantId) -> Option<Schedule> {
        self.schedules.write().await.remove(tenant)
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn jobs_for_tenant(&self, tenant: &TenantId, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| &job.tenant_id == tenant)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn active_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }
}

/// Connector configs loaded once from the tenant registry.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialStore {
    by_tenant: HashMap<TenantId, Vec<String>>,
    configs: HashMap<String, SourceConfig>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(
        mut self,
        tenant: &TenantId,
        connector_id: impl Into<String>,
        config: SourceConfig,
    ) -> Self {
        self.insert(tenant, connector_id, config);
        self
    }

    pub fn insert(&mut self, tenant: &TenantId, connector_id: impl Into<String>, config: SourceConfig) {
        let connector_id = connector_id.into();
        self.by_tenant
            .entry(tenant.clone())
            .or_default()
            .push(connector_id.clone());
        self.configs.insert(connector_id, config);
    }

    pub fn tenants(&self) -> impl Iterator<Item = &TenantId> {
        self.by_tenant.keys()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn connectors_for(&self, tenant: &TenantId) -> Result<Vec<String>, StoreError> {
        Ok(self.by_tenant.get(tenant).cloned().unwrap_or_default())
    }

    async fn resolve(&self, connector_id: &str) -> Result<SourceConfig, StoreError> {
        self.configs
            .get(connector_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownConnector(connector_id.to_string()))
    }
}
