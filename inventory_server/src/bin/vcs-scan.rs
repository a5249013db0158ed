//! One-shot secret scan over the inventoried repositories.
//!
//! Exits non-zero when the tool, its config, the SSH key or the settings are
//! unusable. Individual targets that fail are logged and skipped.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use vcs_inventory::config::InventoryConfig;
use vcs_inventory::services::clone_service::GitCloner;
use vcs_inventory::services::inventory_service::register_instances;
use vcs_inventory::services::scan_service::{preflight, resolve_tool, ScanOptions, ScanRun};
use vcs_inventory::settings::{Settings, DEFAULT_SETTINGS_FILE};
use vcs_inventory::store::{Gateway, InventoryStore, PgStore, ScanFilter};

#[derive(Parser)]
#[command(name = "vcs-scan", about = "Scan inventoried repositories for secrets")]
struct Cli {
    /// SSH private key for ssh:// clone urls
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// `default` (new activity since last scan) or `force` (everything)
    #[arg(short, long)]
    filter: ScanFilter,

    /// Scanner name
    #[arg(short, long)]
    tool: String,

    /// Scanner configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// VCS instances file
    #[arg(long, env = "VCS_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    vcs_inventory::logging::init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Scan run aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = InventoryConfig::from_env();

    let (tool, parser) = resolve_tool(&cli.tool)?;
    preflight(tool, &cli.config, cli.key.as_deref())?;
    let settings = Settings::load(&cli.settings)?;

    tracing::info!(tool = %cli.tool, filter = ?cli.filter, "Starting scan run...");
    let db_url = cli
        .database_url
        .unwrap_or_else(|| vcs_inventory::DEFAULT_DATABASE_URL.to_string());
    let store: Arc<dyn InventoryStore> =
        Arc::new(PgStore::connect(&db_url, config.scan_workers + 1).await?);
    register_instances(store.as_ref(), &settings).await?;

    let scan = ScanRun::new(
        *tool,
        parser,
        ScanOptions {
            config: cli.config,
            ssh_key: cli.key,
            work_root: config.scan_work_dir,
            timeout: config.scan_timeout,
            workers: config.scan_workers,
        },
        Arc::new(GitCloner),
        Gateway::new(store, config.insert_chunk_size),
    );
    scan.run_all(&settings, cli.filter).await?;
    Ok(())
}
