//! Inventory configuration: loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct InventoryConfig {
    /// Worker count for project-class tasks.
    pub project_workers: usize,
    /// Worker count for group-class tasks.
    pub group_workers: usize,
    /// ISO weekday (1 = Monday) on which secondary entities are refreshed.
    pub full_update_day: u32,
    /// Time of day of the daily full inventory.
    pub start_time: NaiveTime,
    /// Minutes between fast inventories.
    pub fast_interval_min: u64,
    /// Rows per upsert statement.
    pub insert_chunk_size: usize,
    /// Run one capped full inventory and exit.
    pub dry_run: bool,
    /// Cap on accepted submissions per pool during a dry run.
    pub dry_run_limit: usize,
    pub process_projects: bool,
    pub process_groups: bool,
    pub process_registries: bool,
    pub process_users: bool,
    /// Overrides the remote top project id when non-zero.
    pub debug_last_id: i64,
    /// Wall-clock limit of one scanner subprocess.
    pub scan_timeout: Duration,
    /// Targets scanned concurrently.
    pub scan_workers: usize,
    /// Root of clone working directories.
    pub scan_work_dir: PathBuf,
    /// Pause before the single retry on HTTP 429.
    pub rate_limit_backoff: Duration,
}

impl InventoryConfig {
    pub fn from_env() -> Self {
        let project_workers = env_parse("PROJECT_WORKERS_COUNT", 20usize).max(1);
        let group_workers = env_parse("GROUP_WORKERS_COUNT", 10usize).max(1);
        let mut full_update_day = env_parse("FULL_UPDATE_DAY", 6u32);
        let start_raw = std::env::var("START_TIME").unwrap_or_else(|_| "09:45".to_string());
        let fast_interval_min = env_parse("FAST_INVENTORY_INTERVAL", 1u64).max(1);
        let insert_chunk_size = env_parse("INSERT_CHUNK_SIZE", 1000usize).max(1);
        let dry_run = env_flag("DRY_RUN", false);
        let dry_run_limit = env_parse("DRY_RUN_LIMIT", 100usize);
        let process_projects = env_flag("PROCESS_PROJECTS", true);
        let process_groups = env_flag("PROCESS_GROUPS", true);
        let process_registries = env_flag("PROCESS_REGISTRIES", false);
        let process_users = env_flag("PROCESS_USERS", false);
        let debug_last_id = env_parse("DEBUG_LAST_ID", 0i64);
        let scan_timeout = Duration::from_secs(env_parse("SCAN_TIMEOUT", 300u64));
        let scan_workers = env_parse("SCAN_WORKERS", 1usize).max(1);
        let scan_work_dir =
            PathBuf::from(std::env::var("SCAN_WORK_DIR").unwrap_or_else(|_| "/tmp/scan".to_string()));
        let rate_limit_backoff = Duration::from_millis(env_parse("RATE_LIMIT_BACKOFF_MS", 2000u64));

        let start_time = match NaiveTime::parse_from_str(start_raw.trim(), "%H:%M") {
            Ok(t) => t,
            Err(_) => {
                tracing::warn!(value = %start_raw, "START_TIME is not HH:MM -- using 09:45");
                NaiveTime::from_hms_opt(9, 45, 0).unwrap_or_default()
            }
        };
        if !(1..=7).contains(&full_update_day) {
            tracing::warn!(
                value = full_update_day,
                "FULL_UPDATE_DAY must be an ISO weekday (1-7) -- using 6"
            );
            full_update_day = 6;
        }
        if debug_last_id > 0 {
            tracing::warn!(debug_last_id, "DEBUG_LAST_ID set -- remote top project id is overridden");
        }

        Self {
            project_workers,
            group_workers,
            full_update_day,
            start_time,
            fast_interval_min,
            insert_chunk_size,
            dry_run,
            dry_run_limit,
            process_projects,
            process_groups,
            process_registries,
            process_users,
            debug_last_id,
            scan_timeout,
            scan_workers,
            scan_work_dir,
            rate_limit_backoff,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            project_workers: 20,
            group_workers: 10,
            full_update_day: 6,
            start_time: NaiveTime::from_hms_opt(9, 45, 0).unwrap_or_default(),
            fast_interval_min: 1,
            insert_chunk_size: 1000,
            dry_run: false,
            dry_run_limit: 100,
            process_projects: true,
            process_groups: true,
            process_registries: false,
            process_users: false,
            debug_last_id: 0,
            scan_timeout: Duration::from_secs(300),
            scan_workers: 1,
            scan_work_dir: PathBuf::from("/tmp/scan"),
            rate_limit_backoff: Duration::from_millis(2000),
        }
    }
}
