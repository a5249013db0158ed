//! In-memory store for dry runs and tests. Same merge semantics as the
//! PostgreSQL backend: rows are keyed by natural key and re-observation
//! merges the mutable columns.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{InventoryStore, ProjectIndex, ScanFilter, ScanTarget, StoredProject, UpsertBatch};
use crate::models::{
    NewContributor, NewFinding, NewGroup, NewImage, NewRegistry, NewRepository,
    NewRepositoryMember, NewUser, NewVcsInstance, Upsertable, VcsInstance,
};

type Table<T> = HashMap<<T as Upsertable>::Key, T>;

#[derive(Default)]
struct Tables {
    instances: Vec<VcsInstance>,
    groups: Table<NewGroup>,
    repositories: Table<NewRepository>,
    registries: Table<NewRegistry>,
    images: Table<NewImage>,
    users: Table<NewUser>,
    members: Table<NewRepositoryMember>,
    contributors: Table<NewContributor>,
    findings: Table<NewFinding>,
    scanned: HashMap<(i64, i64), DateTime<Utc>>,
    chunks_received: usize,
    #[cfg(test)]
    failing_chunk: Option<(&'static str, usize)>,
}

/// Row counts per entity, logged at the end of a dry run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub groups: usize,
    pub repositories: usize,
    pub registries: usize,
    pub images: usize,
    pub users: usize,
    pub members: usize,
    pub contributors: usize,
    pub findings: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn merge_rows<T: Upsertable>(table: &mut Table<T>, rows: Vec<T>) -> usize {
    let written = rows.len();
    for row in rows {
        match table.entry(row.natural_key()) {
            Entry::Occupied(mut existing) => row.merge_into(existing.get_mut()),
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
        }
    }
    written
}

fn sorted<K: Ord, T: Clone>(table: &HashMap<K, T>) -> Vec<T> {
    let mut entries: Vec<(&K, &T)> = table.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, row)| row.clone()).collect()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn summary(&self) -> StoreSummary {
        let t = self.lock();
        StoreSummary {
            groups: t.groups.len(),
            repositories: t.repositories.len(),
            registries: t.registries.len(),
            images: t.images.len(),
            users: t.users.len(),
            members: t.members.len(),
            contributors: t.contributors.len(),
            findings: t.findings.len(),
        }
    }

    pub fn groups(&self) -> Vec<NewGroup> {
        sorted(&self.lock().groups)
    }

    pub fn repositories(&self) -> Vec<NewRepository> {
        sorted(&self.lock().repositories)
    }

    pub fn images(&self) -> Vec<NewImage> {
        sorted(&self.lock().images)
    }

    pub fn users(&self) -> Vec<NewUser> {
        sorted(&self.lock().users)
    }

    pub fn members(&self) -> Vec<NewRepositoryMember> {
        sorted(&self.lock().members)
    }

    pub fn contributors(&self) -> Vec<NewContributor> {
        sorted(&self.lock().contributors)
    }

    pub fn findings(&self) -> Vec<NewFinding> {
        sorted(&self.lock().findings)
    }

    pub fn last_scanned(&self, instance_id: i64, repo_id: i64) -> Option<DateTime<Utc>> {
        self.lock().scanned.get(&(instance_id, repo_id)).copied()
    }

    /// Number of chunks received by `upsert_chunks` so far.
    pub fn chunks_received(&self) -> usize {
        self.lock().chunks_received
    }

    /// Make the chunk at `index` of every later upsert of `entity` fail.
    #[cfg(test)]
    pub fn fail_chunk(&self, entity: &'static str, index: usize) {
        self.lock().failing_chunk = Some((entity, index));
    }

    #[cfg(test)]
    fn should_fail(tables: &Tables, entity: &str, index: usize) -> bool {
        tables
            .failing_chunk
            .is_some_and(|(e, i)| e == entity && i == index)
    }

    #[cfg(not(test))]
    fn should_fail(_: &Tables, _: &str, _: usize) -> bool {
        false
    }

    fn write(tables: &mut Tables, batch: UpsertBatch) -> usize {
        match batch {
            UpsertBatch::Groups(rows) => merge_rows(&mut tables.groups, rows),
            UpsertBatch::Repositories(rows) => merge_rows(&mut tables.repositories, rows),
            UpsertBatch::Registries(rows) => merge_rows(&mut tables.registries, rows),
            UpsertBatch::Images(rows) => merge_rows(&mut tables.images, rows),
            UpsertBatch::Users(rows) => merge_rows(&mut tables.users, rows),
            UpsertBatch::Members(rows) => merge_rows(&mut tables.members, rows),
            UpsertBatch::Contributors(rows) => merge_rows(&mut tables.contributors, rows),
            UpsertBatch::Findings(rows) => merge_rows(&mut tables.findings, rows),
        }
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn ensure_instance(
        &self,
        instance: NewVcsInstance,
    ) -> anyhow::Result<(VcsInstance, bool)> {
        let mut t = self.lock();
        if let Some(existing) = t.instances.iter().find(|i| i.url == instance.url) {
            return Ok((existing.clone(), false));
        }
        let stored = VcsInstance {
            id: t.instances.len() as i64 + 1,
            url: instance.url,
            vcs_type: instance.vcs_type,
            mnemonic: instance.mnemonic,
        };
        t.instances.push(stored.clone());
        Ok((stored, true))
    }

    async fn instances(&self) -> anyhow::Result<Vec<VcsInstance>> {
        Ok(self.lock().instances.clone())
    }

    async fn last_project_id(&self, instance_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(self
            .lock()
            .repositories
            .keys()
            .filter(|(inst, _)| *inst == instance_id)
            .map(|(_, vcs_id)| *vcs_id)
            .max())
    }

    async fn last_group_id(&self, instance_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(self
            .lock()
            .groups
            .keys()
            .filter(|(inst, _)| *inst == instance_id)
            .map(|(_, vcs_id)| *vcs_id)
            .max())
    }

    async fn project_index(&self, instance_id: i64) -> anyhow::Result<ProjectIndex> {
        Ok(self
            .lock()
            .repositories
            .values()
            .filter(|r| r.vcs_instance_id == instance_id)
            .map(|r| {
                (
                    r.vcs_id,
                    StoredProject {
                        path: r.path.clone(),
                        parents: r.parents.clone(),
                    },
                )
            })
            .collect())
    }

    async fn image_paths(
        &self,
        instance_id: i64,
        repo_id: i64,
        registry_id: i64,
    ) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .lock()
            .images
            .values()
            .filter(|i| {
                i.vcs_instance_id == instance_id
                    && i.repo_id == repo_id
                    && i.registry_id == registry_id
            })
            .map(|i| i.path.clone())
            .collect())
    }

    async fn scan_targets(
        &self,
        instance_id: i64,
        filter: ScanFilter,
    ) -> anyhow::Result<Vec<ScanTarget>> {
        let t = self.lock();
        let mut targets: Vec<ScanTarget> = t
            .repositories
            .values()
            .filter(|r| r.vcs_instance_id == instance_id)
            .filter(|r| {
                let scanned = t.scanned.get(&(r.vcs_instance_id, r.vcs_id)).copied();
                filter.selects(r.last_activity, scanned)
            })
            .map(|r| ScanTarget {
                vcs_id: r.vcs_id,
                git_url: r.git_url.clone(),
                vcs_instance_id: r.vcs_instance_id,
            })
            .collect();
        targets.sort_by_key(|target| target.vcs_id);
        Ok(targets)
    }

    async fn mark_scanned(
        &self,
        instance_id: i64,
        repo_id: i64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut t = self.lock();
        if !t.repositories.contains_key(&(instance_id, repo_id)) {
            anyhow::bail!("repository {repo_id} not found for instance {instance_id}");
        }
        t.scanned.insert((instance_id, repo_id), at);
        Ok(())
    }

    async fn upsert_chunks(
        &self,
        chunks: Vec<UpsertBatch>,
    ) -> anyhow::Result<Vec<anyhow::Result<usize>>> {
        let mut t = self.lock();
        t.chunks_received += chunks.len();
        let results = chunks
            .into_iter()
            .enumerate()
            .map(|(index, batch)| {
                let entity = batch.entity();
                if Self::should_fail(&t, entity, index) {
                    anyhow::bail!("injected failure for {entity} chunk {index}");
                }
                Ok(Self::write(&mut t, batch))
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repo(vcs_id: i64, last_activity: DateTime<Utc>) -> NewRepository {
        NewRepository {
            vcs_instance_id: 1,
            vcs_id,
            path: format!("team/repo{vcs_id}"),
            group_id: 10,
            parents: Some(vec![10]),
            web_url: format!("https://git.example.com/team/repo{vcs_id}"),
            git_url: format!("https://git.example.com/team/repo{vcs_id}.git"),
            forks_count: 0,
            created: None,
            default_branch: Some("main".to_string()),
            visibility: "private".to_string(),
            is_archived: false,
            last_activity,
            last_commit_at: None,
            last_time_checked: last_activity,
        }
    }

    #[tokio::test]
    async fn ensure_instance_is_idempotent() {
        let store = MemoryStore::new();
        let new = NewVcsInstance {
            url: "https://git.example.com".to_string(),
            vcs_type: "gitlab".to_string(),
            mnemonic: "main".to_string(),
        };
        let (first, created) = store.ensure_instance(new.clone()).await.unwrap();
        let (second, created_again) = store.ensure_instance(new).await.unwrap();
        assert!(created);
        assert!(!created_again);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn scan_targets_follow_eligibility() {
        let store = MemoryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        store
            .upsert_chunks(vec![UpsertBatch::Repositories(vec![
                repo(1, t1),
                repo(2, t2),
                repo(3, t2),
            ])])
            .await
            .unwrap();

        // 1: scanned after its last activity → skipped
        store.mark_scanned(1, 1, t2).await.unwrap();
        // 2: active after its last scan → selected
        store.mark_scanned(1, 2, t1).await.unwrap();
        // 3: never scanned → selected

        let ids: Vec<i64> = store
            .scan_targets(1, ScanFilter::Default)
            .await
            .unwrap()
            .iter()
            .map(|t| t.vcs_id)
            .collect();
        assert_eq!(ids, vec![2, 3]);

        let forced = store.scan_targets(1, ScanFilter::Force).await.unwrap();
        assert_eq!(forced.len(), 3);
        assert!(store.scan_targets(2, ScanFilter::Force).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repository_merge_preserves_scan_timestamp() {
        let store = MemoryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        store
            .upsert_chunks(vec![UpsertBatch::Repositories(vec![repo(7, t1)])])
            .await
            .unwrap();
        store.mark_scanned(1, 7, t1).await.unwrap();

        let mut renamed = repo(7, t1);
        renamed.path = "team/renamed".to_string();
        store
            .upsert_chunks(vec![UpsertBatch::Repositories(vec![renamed])])
            .await
            .unwrap();

        assert_eq!(store.repositories()[0].path, "team/renamed");
        assert_eq!(store.last_scanned(1, 7), Some(t1));
        assert_eq!(store.last_project_id(1).await.unwrap(), Some(7));
    }
}
