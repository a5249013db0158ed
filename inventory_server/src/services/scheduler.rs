//! Job scheduling: a daily full inventory and a periodic fast inventory.
//!
//! Each job owns a non-blocking lock: a trigger that fires while the previous
//! run of the same job is still going is skipped with a warning.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::providers::Connector;
use crate::services::inventory_service::{InstanceSync, PassMode, SyncOptions};
use crate::settings::Settings;
use crate::store::Gateway;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct JobLock {
    name: &'static str,
    inner: Arc<Mutex<()>>,
}

impl JobLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `None` while another run holds the lock.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Skipped,
    Completed { instances: usize },
}

/// Runs one inventory job over every registered instance.
pub struct InventoryRunner {
    gateway: Gateway,
    settings: Arc<Settings>,
    connector: Arc<dyn Connector>,
    options: SyncOptions,
}

impl InventoryRunner {
    pub fn new(
        gateway: Gateway,
        settings: Arc<Settings>,
        connector: Arc<dyn Connector>,
        options: SyncOptions,
    ) -> Self {
        Self {
            gateway,
            settings,
            connector,
            options,
        }
    }

    pub async fn run_job(&self, lock: &JobLock, mode: PassMode) -> JobOutcome {
        let Some(_guard) = lock.try_acquire() else {
            tracing::warn!(job = lock.name(), "Job is already running, skipping this execution");
            return JobOutcome::Skipped;
        };
        tracing::info!(job = lock.name(), mode = %mode, "Job started");

        let instances = match self.gateway.store().instances().await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!(job = lock.name(), error = %e, "Cannot load VCS instances");
                return JobOutcome::Completed { instances: 0 };
            }
        };

        let mut processed = 0;
        for instance in instances {
            let Some(settings) = self.settings.get(&instance.mnemonic) else {
                tracing::error!(
                    instance = %instance.mnemonic,
                    url = %instance.url,
                    "Instance is not configured in settings, skipping"
                );
                continue;
            };
            let provider = match self.connector.connect(settings).await {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::error!(instance = %instance.mnemonic, error = %e, "Cannot connect, skipping instance");
                    continue;
                }
            };

            let mnemonic = instance.mnemonic.clone();
            let sync = InstanceSync::new(
                instance,
                provider,
                self.gateway.clone(),
                self.options.clone(),
            );
            match sync.run(mode).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    tracing::error!(instance = %mnemonic, mode = %mode, error = %e, "Inventory pass failed");
                }
            }
        }

        crate::metrics::instances_processed(processed);
        tracing::info!(job = lock.name(), instances = processed, "Job finished");
        JobOutcome::Completed {
            instances: processed,
        }
    }
}

/// Next wall-clock time `at` strictly after `after`.
pub fn next_daily_run(after: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = after.date().and_time(at);
    if today > after {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

pub struct Scheduler {
    runner: Arc<InventoryRunner>,
    full_lock: JobLock,
    fast_lock: JobLock,
    start_time: NaiveTime,
    fast_interval: Duration,
}

impl Scheduler {
    pub fn new(runner: Arc<InventoryRunner>, start_time: NaiveTime, fast_interval: Duration) -> Self {
        Self {
            runner,
            full_lock: JobLock::new("full-inventory"),
            fast_lock: JobLock::new("fast-inventory"),
            start_time,
            fast_interval,
        }
    }

    fn spawn_job(&self, lock: &JobLock, mode: PassMode) {
        let runner = self.runner.clone();
        let lock = lock.clone();
        tokio::spawn(async move {
            runner.run_job(&lock, mode).await;
        });
    }

    /// Poll the triggers until `shutdown` resolves.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) {
        let mut next_full = next_daily_run(Local::now().naive_local(), self.start_time);
        let mut next_fast = tokio::time::Instant::now() + self.fast_interval;
        tracing::info!(
            next_full = %next_full,
            fast_interval_secs = self.fast_interval.as_secs(),
            "Scheduler started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let now = Local::now().naive_local();
            if now >= next_full {
                self.spawn_job(&self.full_lock, PassMode::Full);
                next_full = next_daily_run(now, self.start_time);
            }
            if tokio::time::Instant::now() >= next_fast {
                self.spawn_job(&self.fast_lock, PassMode::Fast);
                next_fast = tokio::time::Instant::now() + self.fast_interval;
            }
        }
    }
}
