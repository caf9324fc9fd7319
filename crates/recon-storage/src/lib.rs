//! Persistence contracts, in-process and Postgres stores, and the shared HTTP fetcher.

mod http;
mod memory;
mod postgres;

use async_trait::async_trait;
use recon_core::{Job, JobStatus, Schedule, SourceConfig, TenantId};
use thiserror::Error;
use uuid::Uuid;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::{MemoryStore, StaticCredentialStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "recon-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding stored row: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("connector `{0}` not found")]
    UnknownConnector(String),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Whole-row persistence of jobs. An `upsert` either lands completely or fails.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError>;

    /// Most recent first.
    async fn jobs_for_tenant(&self, tenant: &TenantId, limit: usize) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn active_schedules(&self) -> Result<Vec<Schedule>, StoreError>;
}

/// Decrypted connector configuration lookup. Encryption is the store's business.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn connectors_for(&self, tenant: &TenantId) -> Result<Vec<String>, StoreError>;

    async fn resolve(&self, connector_id: &str) -> Result<SourceConfig, StoreError>;
}
