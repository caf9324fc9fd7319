use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use recon_adapters::{FixtureAdapter, SourceAdapter};
use recon_core::{DateRangeConfig, FixtureConfig, JobTrigger, Origin, TenantId};
use recon_storage::PgStore;
use recon_sync::{
    cron_for, next_fire_utc, CronTriggerRuntime, ReconConfig, ReconService, Scheduler,
    TenantRegistry,
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Backend/analytics transaction reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and job workers until interrupted.
    Serve,
    /// Start a manual run for one tenant and wait for it.
    RunNow {
        #[arg(long)]
        tenant: String,
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, default_value_t = 3)]
        max_retries: u8,
    },
    /// Re-run a failed job, optionally raising its retry ceiling.
    Retry {
        job_id: Uuid,
        #[arg(long)]
        max_retries: Option<u8>,
    },
    /// Reconcile two JSON record files without touching any store.
    Reconcile {
        #[arg(long)]
        backend: PathBuf,
        #[arg(long)]
        analytics: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
    },
    Migrate,
    /// Print the next fire time of every registry schedule.
    NextRuns,
}

#[derive(Debug, clap::Args)]
struct RangeArgs {
    #[arg(long, default_value_t = 30)]
    days: u32,
    #[arg(long)]
    start: Option<NaiveDate>,
    #[arg(long)]
    end: Option<NaiveDate>,
}

impl RangeArgs {
    fn resolve(&self, max_retries: u8) -> Result<recon_core::DateRange> {
        let config = DateRangeConfig {
            days: self.days,
            start_date: self.start,
            end_date: self.end,
            max_retries,
        };
        config.validate()?;
        Ok(config.resolve(Utc::now().date_naive())?)
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("RECON_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ReconConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::RunNow {
            tenant,
            range,
            max_retries,
        } => {
            let range = range.resolve(max_retries)?;
            let service = ReconService::from_config(config).await?;
            let accepted = service
                .manager
                .run_now(TenantId::new(tenant), range, max_retries, JobTrigger::Manual)
                .await?;
            println!("job {} accepted for {}", accepted.job_id, accepted.tenant_id);
            let job = accepted.wait().await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Retry {
            job_id,
            max_retries,
        } => {
            let service = ReconService::from_config(config).await?;
            let job = service.manager.retry(job_id, max_retries).await?.wait().await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Reconcile {
            backend,
            analytics,
            range,
        } => {
            let range = range.resolve(0)?;
            let backend = FixtureAdapter::new(
                "backend".into(),
                FixtureConfig {
                    path: backend,
                    origin: Origin::Backend,
                },
            );
            let analytics = FixtureAdapter::new(
                "analytics".into(),
                FixtureConfig {
                    path: analytics,
                    origin: Origin::Analytics,
                },
            );
            let backend = backend.fetch(&range).await?;
            let analytics = analytics.fetch(&range).await?;
            let summary = recon_engine::reconcile(range, &backend, &analytics)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL is not set");
            };
            let store = PgStore::connect(&url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::NextRuns => {
            let registry = TenantRegistry::load(&config.registry_path).await?;
            let now = Utc::now();
            for schedule in registry.schedules() {
                let next = next_fire_utc(&schedule, now)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                let state = if schedule.is_active { "active" } else { "paused" };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    schedule.tenant_id,
                    state,
                    cron_for(&schedule),
                    schedule.timezone,
                    next
                );
            }
        }
    }

    Ok(())
}

async fn serve(config: ReconConfig) -> Result<()> {
    let scheduler_enabled = config.scheduler_enabled;
    let reload = config.schedule_reload;
    let service = ReconService::from_config(config).await?;
    let recovered = service.manager.recover_orphans().await?;
    if recovered > 0 {
        info!(recovered, "orphaned jobs marked failed");
    }

    let (stop, stopped) = watch::channel(false);
    let mut background = None;
    if scheduler_enabled {
        let runtime = CronTriggerRuntime::new(service.manager.clone()).await?;
        runtime.start().await?;
        let scheduler = Scheduler::new(service.schedules.clone(), Arc::new(runtime.clone()), reload);
        let task = tokio::spawn(async move { scheduler.run(stopped).await });
        background = Some((runtime, task));
    }
    info!(persistence = service.persistence, scheduler_enabled, "serving");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    stop.send_replace(true);
    if let Some((runtime, task)) = background {
        task.await.context("scheduler task")?;
        runtime.shutdown().await?;
    }
    service.manager.shutdown().await;
    Ok(())
}
