use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveTime, Weekday};
use recon_core::{DateRangeConfig, Frequency, Schedule, SourceConfig, TenantId};
use recon_storage::StaticCredentialStore;
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub database_url: Option<String>,
    pub registry_path: PathBuf,
    pub scheduler_enabled: bool,
    pub schedule_reload: Duration,
    pub workers: usize,
    pub fetch_timeout: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            registry_path: PathBuf::from("./tenants.yaml"),
            scheduler_enabled: true,
            schedule_reload: Duration::from_secs(300),
            workers: 4,
            fetch_timeout: Duration::from_secs(60),
            http_timeout: Duration::from_secs(30),
            user_agent: "recon-engine/0.1".to_string(),
            webhook_url: None,
            webhook_token: None,
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl ReconConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_nonempty("DATABASE_URL"),
            registry_path: std::env::var("RECON_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            scheduler_enabled: std::env::var("RECON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            schedule_reload: env_secs("RECON_SCHEDULE_RELOAD_SECS", defaults.schedule_reload),
            workers: std::env::var("RECON_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.workers),
            fetch_timeout: env_secs("RECON_FETCH_TIMEOUT_SECS", defaults.fetch_timeout),
            http_timeout: env_secs("RECON_HTTP_TIMEOUT_SECS", defaults.http_timeout),
            user_agent: std::env::var("RECON_USER_AGENT").unwrap_or(defaults.user_agent),
            webhook_url: env_nonempty("RECON_WEBHOOK_URL"),
            webhook_token: env_nonempty("RECON_WEBHOOK_TOKEN"),
        }
    }
}

/// `tenants.yaml`: tenants, their connectors and optional schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantRegistry {
    pub tenants: Vec<TenantEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantEntry {
    pub id: TenantId,
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
    #[serde(default)]
    pub schedule: Option<ScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorEntry {
    pub id: String,
    #[serde(flatten)]
    pub config: SourceConfig,
}

/// A tenant's schedule; the tenant id comes from the enclosing entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub frequency: Frequency,
    #[serde(default)]
    pub time_of_day: Option<NaiveTime>,
    #[serde(default)]
    pub day_of_week: Option<Weekday>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub date_range: DateRangeConfig,
}

impl ScheduleEntry {
    fn to_schedule(&self, tenant: &TenantId) -> Schedule {
        let mut schedule = Schedule::new(tenant.clone(), self.frequency);
        schedule.time_of_day = self.time_of_day;
        schedule.day_of_week = self.day_of_week;
        if let Some(tz) = &self.timezone {
            schedule.timezone = tz.clone();
        }
        schedule.is_active = self.is_active.unwrap_or(true);
        schedule.date_range = self.date_range.clone();
        schedule
    }
}

impl TenantRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry = Self::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(registry.rooted_at(path.parent().unwrap_or_else(|| Path::new("."))))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Connector configs are checked here so a bad entry never reaches a run.
    pub fn validate(&self) -> Result<()> {
        let mut tenants = HashSet::new();
        let mut connectors = HashSet::new();
        for tenant in &self.tenants {
            if !tenants.insert(&tenant.id) {
                bail!("tenant `{}` is declared twice", tenant.id);
            }
            for connector in &tenant.connectors {
                if !connectors.insert(connector.id.as_str()) {
                    bail!("connector `{}` is declared twice", connector.id);
                }
                connector
                    .config
                    .validate()
                    .with_context(|| format!("connector `{}` of tenant `{}`", connector.id, tenant.id))?;
            }
            if let Some(schedule) = &tenant.schedule {
                schedule
                    .date_range
                    .validate()
                    .with_context(|| format!("schedule of tenant `{}`", tenant.id))?;
            }
        }
        Ok(())
    }

    /// Relative fixture paths resolve against the registry file's directory.
    fn rooted_at(mut self, root: &Path) -> Self {
        for connector in self.tenants.iter_mut().flat_map(|t| t.connectors.iter_mut()) {
            if let SourceConfig::Fixture(cfg) = &mut connector.config {
                if cfg.path.is_relative() {
                    cfg.path = root.join(&cfg.path);
                }
            }
        }
        self
    }

    pub fn tenant(&self, id: &TenantId) -> Option<&TenantEntry> {
        self.tenants.iter().find(|t| &t.id == id)
    }

    pub fn credentials(&self) -> StaticCredentialStore {
        let mut store = StaticCredentialStore::new();
        for tenant in &self.tenants {
            for connector in &tenant.connectors {
                store.insert(&tenant.id, connector.id.clone(), connector.config.clone());
            }
        }
        store
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.tenants
            .iter()
            .filter_map(|t| t.schedule.as_ref().map(|s| s.to_schedule(&t.id)))
            .collect()
    }
}
