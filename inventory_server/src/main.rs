//! VCS Inventory daemon.
//!
//! Registers the configured instances, then runs the daily full inventory and
//! the periodic fast inventory until interrupted. With `--dry-run` (or
//! `DRY_RUN=true`) it runs one full inventory against the configured
//! database, capped at `DRY_RUN_LIMIT` submissions per pool, and exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use vcs_inventory::config::InventoryConfig;
use vcs_inventory::providers::{Connector, HttpConnector};
use vcs_inventory::services::inventory_service::{register_instances, PassMode, SyncOptions};
use vcs_inventory::services::scheduler::{InventoryRunner, JobLock, Scheduler};
use vcs_inventory::settings::{Settings, DEFAULT_SETTINGS_FILE};
use vcs_inventory::store::{Gateway, InventoryStore, PgStore};

#[derive(Parser)]
#[command(name = "vcs-inventory", about = "GitLab / Bitbucket inventory daemon")]
struct Cli {
    /// VCS instances file
    #[arg(long, env = "VCS_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// One full inventory capped at DRY_RUN_LIMIT submissions per pool, then exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vcs_inventory::logging::init_tracing();

    let cli = Cli::parse();
    let mut config = InventoryConfig::from_env();
    config.dry_run |= cli.dry_run;

    tracing::info!(dry_run = config.dry_run, "Starting VCS inventory...");
    let settings = Arc::new(Settings::load(&cli.settings)?);
    let connector: Arc<dyn Connector> = Arc::new(HttpConnector {
        rate_limit_backoff: config.rate_limit_backoff,
    });
    let options = SyncOptions::from_config(&config);

    let db_url = cli
        .database_url
        .unwrap_or_else(|| vcs_inventory::DEFAULT_DATABASE_URL.to_string());
    let pool_size = config.project_workers + config.group_workers;
    let store: Arc<dyn InventoryStore> = Arc::new(PgStore::connect(&db_url, pool_size).await?);
    tracing::info!(pool_size, "Database connected, schema ready");

    let created = register_instances(store.as_ref(), &settings).await?;
    tracing::info!(configured = settings.len(), created, "VCS instances registered");

    let gateway = Gateway::new(store, config.insert_chunk_size);
    let runner = InventoryRunner::new(gateway, settings, connector, options);

    if config.dry_run {
        let outcome = runner
            .run_job(&JobLock::new("dry-run"), PassMode::Full)
            .await;
        tracing::info!(
            ?outcome,
            limit = config.dry_run_limit,
            "Dry run finished"
        );
        return Ok(());
    }

    vcs_inventory::metrics::init_metrics();

    let scheduler = Scheduler::new(
        Arc::new(runner),
        config.start_time,
        Duration::from_secs(config.fast_interval_min * 60),
    );
    scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
