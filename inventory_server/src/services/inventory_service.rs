//! Inventory passes over one VCS instance.
//!
//! The full pass walks every listed project and group. The fast pass only
//! looks up ids between the highest stored id and the highest remote id,
//! which makes it cheap enough to run every minute.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, Local};
use futures::StreamExt;

use crate::config::InventoryConfig;
use crate::errors::ProviderError;
use crate::models::{NewGroup, VcsInstance};
use crate::providers::Provider;
use crate::services::fanout::{PoolReport, WorkerPool};
use crate::services::project_service::{self, ProjectContext};
use crate::settings::Settings;
use crate::store::{Gateway, InventoryStore, ProjectIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    Full,
    Fast,
}

impl PassMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Fast => "fast",
        }
    }
}

impl fmt::Display for PassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub project_workers: usize,
    pub group_workers: usize,
    pub full_update_day: u32,
    pub process_projects: bool,
    pub process_groups: bool,
    pub process_registries: bool,
    pub process_users: bool,
    /// Cap on accepted submissions per pool (dry runs only).
    pub submission_limit: Option<usize>,
    /// Replaces the remote top project id.
    pub debug_last_id: Option<i64>,
}

impl SyncOptions {
    pub fn from_config(config: &InventoryConfig) -> Self {
        Self {
            project_workers: config.project_workers,
            group_workers: config.group_workers,
            full_update_day: config.full_update_day,
            process_projects: config.process_projects,
            process_groups: config.process_groups,
            process_registries: config.process_registries,
            process_users: config.process_users,
            submission_limit: config.dry_run.then_some(config.dry_run_limit),
            debug_last_id: (config.debug_last_id > 0).then_some(config.debug_last_id),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&InventoryConfig::default())
    }
}

/// Position of the local watermark relative to the remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// Ids `from..=to` are unseen.
    Ahead { from: i64, to: i64 },
    UpToDate,
    /// The store holds ids the remote no longer reports.
    Regressed { stored: i64, remote: i64 },
}

/// Missing watermarks count as zero.
pub fn delta_range(stored: Option<i64>, remote: Option<i64>) -> Delta {
    let stored = stored.unwrap_or(0);
    let remote = remote.unwrap_or(0);
    if remote > stored {
        Delta::Ahead {
            from: stored + 1,
            to: remote,
        }
    } else if remote == stored {
        Delta::UpToDate
    } else {
        Delta::Regressed { stored, remote }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub projects: PoolReport,
    pub groups: PoolReport,
}

/// Register every configured instance. Known urls are left untouched.
pub async fn register_instances(
    store: &dyn InventoryStore,
    settings: &Settings,
) -> anyhow::Result<usize> {
    let mut created = 0;
    for instance in settings.iter() {
        let (stored, is_new) = store.ensure_instance(instance.to_new_instance()).await?;
        if is_new {
            created += 1;
            tracing::info!(instance = %stored.mnemonic, id = stored.id, url = %stored.url, "Registered VCS instance");
        }
    }
    Ok(created)
}

/// Runs passes for one instance.
pub struct InstanceSync {
    instance: VcsInstance,
    provider: Arc<dyn Provider>,
    gateway: Gateway,
    options: SyncOptions,
    full_update: bool,
}

impl InstanceSync {
    pub fn new(
        instance: VcsInstance,
        provider: Arc<dyn Provider>,
        gateway: Gateway,
        options: SyncOptions,
    ) -> Self {
        let full_update = Local::now().weekday().number_from_monday() == options.full_update_day;
        Self {
            instance,
            provider,
            gateway,
            options,
            full_update,
        }
    }

    pub fn with_full_update(mut self, full_update: bool) -> Self {
        self.full_update = full_update;
        self
    }

    pub async fn run(&self, mode: PassMode) -> anyhow::Result<PassSummary> {
        let started = Instant::now();
        tracing::info!(
            instance = %self.instance.mnemonic,
            mode = %mode,
            full_update = self.full_update,
            "Inventory pass started"
        );

        let summary = match mode {
            PassMode::Full => self.full_pass().await?,
            PassMode::Fast => self.fast_pass().await?,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        crate::metrics::pass_duration(mode.as_str(), elapsed_ms);
        tracing::info!(
            instance = %self.instance.mnemonic,
            mode = %mode,
            projects = summary.projects.succeeded,
            projects_failed = summary.projects.failed,
            groups = summary.groups.succeeded,
            groups_failed = summary.groups.failed,
            elapsed_ms,
            "Inventory pass finished"
        );
        Ok(summary)
    }

    fn project_context(&self, index: ProjectIndex) -> Arc<ProjectContext> {
        Arc::new(ProjectContext {
            instance_id: self.instance.id,
            provider: self.provider.clone(),
            gateway: self.gateway.clone(),
            index: Arc::new(index),
            full_update: self.full_update,
            process_registries: self.options.process_registries,
            process_users: self.options.process_users,
        })
    }

    async fn remote_top_project(&self) -> Result<Option<i64>, ProviderError> {
        if let Some(id) = self.options.debug_last_id {
            return Ok(Some(id));
        }
        self.provider.top_project_id().await
    }

    async fn full_pass(&self) -> anyhow::Result<PassSummary> {
        let mut summary = PassSummary::default();
        let store = self.gateway.store();

        if self.options.process_projects {
            let mut index = store.project_index(self.instance.id).await?;
            if self.provider.supports_id_lookup() {
                let stored = store.last_project_id(self.instance.id).await?;
                match self.remote_top_project().await {
                    Ok(remote) => {
                        if let Delta::Regressed { stored, remote } = delta_range(stored, remote) {
                            tracing::warn!(
                                instance = %self.instance.mnemonic,
                                stored,
                                remote,
                                "Stored project id is ahead of the remote, treating every project as new"
                            );
                            index.clear();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            instance = %self.instance.mnemonic,
                            error = %e,
                            "Cannot read the remote top project id, keeping the stored index"
                        );
                    }
                }
            }
            let ctx = self.project_context(index);
            let mut pool = WorkerPool::new(
                "project",
                self.options.project_workers,
                self.options.submission_limit,
            );

            let mut projects = self.provider.projects();
            while let Some(item) = projects.next().await {
                let project = match item {
                    Ok(project) => project,
                    Err(e) => {
                        tracing::error!(instance = %self.instance.mnemonic, error = %e, "Project listing failed");
                        break;
                    }
                };
                let ctx = ctx.clone();
                let label = format!("project {} ({})", project.path, project.id);
                let accepted = pool
                    .submit(label, move |worker| async move {
                        let is_new = ctx.is_new(project.id);
                        project_service::process_project(&ctx, &project, is_new, worker).await
                    })
                    .await;
                if !accepted {
                    break;
                }
            }
            drop(projects);
            summary.projects = pool.drain().await;
        }

        if self.options.process_groups {
            let mut pool = WorkerPool::new(
                "group",
                self.options.group_workers,
                self.options.submission_limit,
            );
            let mut groups = self.provider.groups();
            while let Some(item) = groups.next().await {
                let group = match item {
                    Ok(group) => group,
                    Err(e) => {
                        tracing::error!(instance = %self.instance.mnemonic, error = %e, "Group listing failed");
                        break;
                    }
                };
                let gateway = self.gateway.clone();
                let row = NewGroup::from_remote(self.instance.id, &group);
                let label = format!("group {} ({})", group.path, group.id);
                let accepted = pool
                    .submit(label, move |_worker| store_group(gateway, row))
                    .await;
                if !accepted {
                    break;
                }
            }
            drop(groups);
            summary.groups = pool.drain().await;
        }

        Ok(summary)
    }

    async fn fast_pass(&self) -> anyhow::Result<PassSummary> {
        let mut summary = PassSummary::default();
        if !self.provider.supports_id_lookup() {
            tracing::debug!(
                instance = %self.instance.mnemonic,
                vcs = %self.provider.kind(),
                "No id lookup, fast pass skipped"
            );
            return Ok(summary);
        }
        let store = self.gateway.store();

        if self.options.process_projects {
            let stored = store.last_project_id(self.instance.id).await?;
            let remote = self.remote_top_project().await?;
            if let Some((from, to)) = self.pending_range("project", stored, remote) {
                let ctx = self.project_context(ProjectIndex::new());
                let mut pool = WorkerPool::new(
                    "project",
                    self.options.project_workers,
                    self.options.submission_limit,
                );
                for id in from..=to {
                    let ctx = ctx.clone();
                    let accepted = pool
                        .submit(format!("project id {id}"), move |worker| async move {
                            match ctx.provider.project(id).await? {
                                Some(project) => {
                                    project_service::process_project(&ctx, &project, true, worker)
                                        .await
                                }
                                None => {
                                    tracing::debug!(id, "Project id not found, skipping");
                                    Ok(())
                                }
                            }
                        })
                        .await;
                    if !accepted {
                        break;
                    }
                }
                summary.projects = pool.drain().await;
            }
        }

        if self.options.process_groups {
            let stored = store.last_group_id(self.instance.id).await?;
            let remote = self.provider.top_group_id().await?;
            if let Some((from, to)) = self.pending_range("group", stored, remote) {
                let mut pool = WorkerPool::new(
                    "group",
                    self.options.group_workers,
                    self.options.submission_limit,
                );
                for id in from..=to {
                    let provider = self.provider.clone();
                    let gateway = self.gateway.clone();
                    let instance_id = self.instance.id;
                    let accepted = pool
                        .submit(format!("group id {id}"), move |_worker| async move {
                            match provider.group(id).await? {
                                Some(group) => {
                                    store_group(gateway, NewGroup::from_remote(instance_id, &group))
                                        .await
                                }
                                None => {
                                    tracing::debug!(id, "Group id not found, skipping");
                                    Ok(())
                                }
                            }
                        })
                        .await;
                    if !accepted {
                        break;
                    }
                }
                summary.groups = pool.drain().await;
            }
        }

        Ok(summary)
    }

    fn pending_range(
        &self,
        entity: &'static str,
        stored: Option<i64>,
        remote: Option<i64>,
    ) -> Option<(i64, i64)> {
        match delta_range(stored, remote) {
            Delta::Ahead { from, to } => {
                tracing::info!(instance = %self.instance.mnemonic, entity, from, to, "New ids to fetch");
                Some((from, to))
            }
            Delta::UpToDate => {
                tracing::debug!(instance = %self.instance.mnemonic, entity, "Up to date");
                None
            }
            Delta::Regressed { stored, remote } => {
                tracing::warn!(
                    instance = %self.instance.mnemonic,
                    entity,
                    stored,
                    remote,
                    "Stored id is ahead of the remote, nothing fetched"
                );
                None
            }
        }
    }
}

async fn store_group(gateway: Gateway, row: NewGroup) -> anyhow::Result<()> {
    let path = row.path.clone();
    let report = gateway.upsert(vec![row]).await;
    if !report.is_complete() {
        anyhow::bail!("group row for '{path}' was not stored");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::{NewVcsInstance, VcsKind};
    use crate::services::test_support::{group, FakeProvider};
    use crate::store::MemoryStore;

    async fn instance(store: &MemoryStore) -> VcsInstance {
        let (stored, _) = store
            .ensure_instance(NewVcsInstance {
                url: "https://git.example.com".to_string(),
                vcs_type: VcsKind::GitLab.as_str().to_string(),
                mnemonic: "main".to_string(),
            })
            .await
            .unwrap();
        stored
    }

    fn options(workers: usize) -> SyncOptions {
        SyncOptions {
            project_workers: workers,
            group_workers: workers,
            submission_limit: None,
            debug_last_id: None,
            ..SyncOptions::default()
        }
    }

    fn sync(
        instance: VcsInstance,
        provider: Arc<FakeProvider>,
        store: Arc<MemoryStore>,
        options: SyncOptions,
    ) -> InstanceSync {
        InstanceSync::new(instance, provider, Gateway::new(store, 100), options)
            .with_full_update(false)
    }

    fn repo_ids(store: &MemoryStore) -> Vec<i64> {
        let mut ids: Vec<i64> = store.repositories().iter().map(|r| r.vcs_id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn delta_range_covers_only_unseen_ids() {
        assert_eq!(
            delta_range(Some(100), Some(103)),
            Delta::Ahead { from: 101, to: 103 }
        );
        assert_eq!(delta_range(None, Some(2)), Delta::Ahead { from: 1, to: 2 });
        assert_eq!(delta_range(Some(7), Some(7)), Delta::UpToDate);
        assert_eq!(delta_range(None, None), Delta::UpToDate);
        assert_eq!(
            delta_range(Some(9), Some(4)),
            Delta::Regressed { stored: 9, remote: 4 }
        );
    }

    #[tokio::test]
    async fn fast_pass_fetches_each_new_id_once() {
        for workers in [1, 4, 16] {
            let store = Arc::new(MemoryStore::new());
            let instance = instance(&store).await;
            let seed = Arc::new(FakeProvider::with_projects([100]));
            sync(instance.clone(), seed, store.clone(), options(workers))
                .run(PassMode::Full)
                .await
                .unwrap();

            let provider = Arc::new(FakeProvider::with_projects((98..=103).filter(|id| *id != 102)));
            let summary = sync(instance, provider.clone(), store.clone(), options(workers))
                .run(PassMode::Fast)
                .await
                .unwrap();

            assert_eq!(provider.looked_up_projects(), vec![101, 102, 103]);
            assert_eq!(summary.projects.submitted, 3);
            assert_eq!(summary.projects.failed, 0);
            assert_eq!(repo_ids(&store), vec![100, 101, 103]);
        }
    }

    #[tokio::test]
    async fn repeated_fast_pass_fetches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        sync(
            instance.clone(),
            Arc::new(FakeProvider::with_projects([100])),
            store.clone(),
            options(4),
        )
        .run(PassMode::Full)
        .await
        .unwrap();

        let provider = Arc::new(FakeProvider::with_projects(95..=103));
        let fast = sync(instance, provider.clone(), store.clone(), options(4));
        fast.run(PassMode::Fast).await.unwrap();
        assert_eq!(repo_ids(&store).iter().filter(|id| **id > 100).count(), 3);

        let again = fast.run(PassMode::Fast).await.unwrap();
        assert_eq!(again.projects, PoolReport::default());
        assert_eq!(provider.looked_up_projects(), vec![101, 102, 103]);
    }

    #[tokio::test]
    async fn regressed_watermark_fetches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        sync(
            instance.clone(),
            Arc::new(FakeProvider::with_projects([50])),
            store.clone(),
            options(2),
        )
        .run(PassMode::Full)
        .await
        .unwrap();

        let provider = Arc::new(FakeProvider::with_projects([10, 20]));
        let summary = sync(instance, provider.clone(), store, options(2))
            .run(PassMode::Fast)
            .await
            .unwrap();
        assert_eq!(summary.projects.submitted, 0);
        assert!(provider.looked_up_projects().is_empty());
    }

    #[tokio::test]
    async fn full_pass_stores_projects_and_groups() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        let mut provider = FakeProvider::with_projects(1..=5);
        provider.groups = (1..=3).map(|id| (id, group(id))).collect();

        let summary = sync(instance, Arc::new(provider), store.clone(), options(3))
            .run(PassMode::Full)
            .await
            .unwrap();

        assert_eq!(summary.projects.succeeded, 5);
        assert_eq!(summary.groups.succeeded, 3);
        assert_eq!(repo_ids(&store), vec![1, 2, 3, 4, 5]);
        assert_eq!(store.groups().len(), 3);
    }

    #[tokio::test]
    async fn disabled_groups_are_not_touched() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        let mut provider = FakeProvider::with_projects(1..=2);
        provider.groups = (1..=3).map(|id| (id, group(id))).collect();

        let summary = sync(
            instance,
            Arc::new(provider),
            store.clone(),
            SyncOptions {
                process_groups: false,
                ..options(2)
            },
        )
        .run(PassMode::Full)
        .await
        .unwrap();

        assert_eq!(summary.groups, PoolReport::default());
        assert!(store.groups().is_empty());
    }

    #[tokio::test]
    async fn submission_limit_caps_full_pass() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        let summary = sync(
            instance,
            Arc::new(FakeProvider::with_projects(1..=20)),
            store.clone(),
            SyncOptions {
                submission_limit: Some(4),
                ..options(2)
            },
        )
        .run(PassMode::Full)
        .await
        .unwrap();

        assert_eq!(summary.projects.submitted, 4);
        assert_eq!(repo_ids(&store), vec![17, 18, 19, 20]);
    }

    #[tokio::test]
    async fn fast_pass_picks_up_new_groups() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        let mut seed = FakeProvider::default();
        seed.groups = [(4, group(4))].into_iter().collect();
        sync(instance.clone(), Arc::new(seed), store.clone(), options(2))
            .run(PassMode::Full)
            .await
            .unwrap();

        let mut provider = FakeProvider::default();
        provider.groups = (1..=6).map(|id| (id, group(id))).collect();
        let provider = Arc::new(provider);
        sync(instance, provider.clone(), store.clone(), options(2))
            .run(PassMode::Fast)
            .await
            .unwrap();

        assert_eq!(provider.looked_up_groups(), vec![5, 6]);
        assert_eq!(store.groups().len(), 3);
    }

    #[tokio::test]
    async fn fast_pass_skipped_without_id_lookup() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        let provider = Arc::new(FakeProvider {
            bitbucket: true,
            ..FakeProvider::with_projects(1..=3)
        });

        let summary = sync(instance, provider.clone(), store.clone(), options(2))
            .run(PassMode::Fast)
            .await
            .unwrap();
        assert_eq!(summary, PassSummary::default());
        assert!(store.repositories().is_empty());
    }

    fn with_secondaries(workers: usize) -> SyncOptions {
        SyncOptions {
            process_registries: true,
            process_users: true,
            ..options(workers)
        }
    }

    #[tokio::test]
    async fn regressed_watermark_makes_full_pass_treat_all_as_new() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        sync(
            instance.clone(),
            Arc::new(FakeProvider::with_projects(1..=50)),
            store.clone(),
            options(4),
        )
        .run(PassMode::Full)
        .await
        .unwrap();

        let provider = Arc::new(FakeProvider {
            top_project: Some(10),
            ..FakeProvider::with_projects(1..=10)
        });
        let summary = sync(instance, provider.clone(), store, with_secondaries(4))
            .run(PassMode::Full)
            .await
            .unwrap();

        let all: Vec<i64> = (1..=10).collect();
        assert_eq!(summary.projects.succeeded, 10);
        assert_eq!(provider.registries_listed_for(), all);
        assert_eq!(provider.members_listed_for(), all);
    }

    #[tokio::test]
    async fn full_pass_survives_failing_top_id_lookup() {
        let store = Arc::new(MemoryStore::new());
        let instance = instance(&store).await;
        sync(
            instance.clone(),
            Arc::new(FakeProvider::with_projects(1..=2)),
            store.clone(),
            options(2),
        )
        .run(PassMode::Full)
        .await
        .unwrap();

        let provider = Arc::new(FakeProvider {
            top_project_status: Some(502),
            ..FakeProvider::with_projects(1..=3)
        });
        let summary = sync(instance, provider.clone(), store.clone(), with_secondaries(2))
            .run(PassMode::Full)
            .await
            .unwrap();

        assert_eq!(summary.projects.succeeded, 3);
        assert_eq!(repo_ids(&store), vec![1, 2, 3]);
        // stored projects stay known, only the new one gets secondaries
        assert_eq!(provider.members_listed_for(), vec![3]);
    }
}
