//! Per-project synchronization: the repository row and its secondary
//! entities (registries, images, members, contributors).
//!
//! Secondary entities are only refreshed for projects seen for the first
//! time, or for every project on the weekly full-update day.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::TryStreamExt;

use crate::models::repository::ProjectObservation;
use crate::models::{
    NewContributor, NewImage, NewRegistry, NewRepository, NewRepositoryMember, NewUser,
};
use crate::providers::{Provider, RemoteContribution, RemoteProject, RemoteRegistry, RemoteTagRef};
use crate::services::fanout::WorkerId;
use crate::store::{Gateway, ProjectIndex};

/// Shared state for every project task of one pass.
pub struct ProjectContext {
    pub instance_id: i64,
    pub provider: Arc<dyn Provider>,
    pub gateway: Gateway,
    /// Stored projects at the start of the pass.
    pub index: Arc<ProjectIndex>,
    pub full_update: bool,
    pub process_registries: bool,
    pub process_users: bool,
}

/// What happened to one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOutcome {
    Synced {
        fetched: usize,
        skipped: usize,
        failed: usize,
    },
    EmptyRegistry,
    Failed(String),
}

impl ProjectContext {
    /// A project is new when it was not stored before this pass started.
    pub fn is_new(&self, project_id: i64) -> bool {
        !self.index.contains_key(&project_id)
    }

    fn refresh_secondaries(&self, is_new: bool) -> bool {
        is_new || self.full_update
    }
}

/// Parent chain from the stored index when the path is unchanged, otherwise
/// resolved live.
pub async fn resolve_parents(
    ctx: &ProjectContext,
    project: &RemoteProject,
) -> anyhow::Result<Option<Vec<i64>>> {
    if let Some(stored) = ctx.index.get(&project.id) {
        if stored.path == project.path && stored.parents.is_some() {
            return Ok(stored.parents.clone());
        }
    }
    let parents = ctx.provider.project_ancestors(project).await?;
    Ok(Some(parents))
}

/// Upsert the repository row, then its secondaries when due.
pub async fn process_project(
    ctx: &ProjectContext,
    project: &RemoteProject,
    is_new: bool,
    worker: WorkerId,
) -> anyhow::Result<()> {
    tracing::debug!(worker = %worker, project = %project.path, id = project.id, is_new, "Processing project");
    sync_repository(ctx, project).await?;

    if !ctx.refresh_secondaries(is_new) {
        return Ok(());
    }
    if ctx.process_registries {
        if let Err(e) = sync_registries(ctx, project).await {
            tracing::error!(worker = %worker, project = %project.path, error = %e, "Registry sync failed");
        }
    }
    if ctx.process_users {
        if let Err(e) = sync_members(ctx, project).await {
            tracing::error!(worker = %worker, project = %project.path, error = %e, "Member sync failed");
        }
        if let Err(e) = sync_contributors(ctx, project).await {
            tracing::error!(worker = %worker, project = %project.path, error = %e, "Contributor sync failed");
        }
    }
    Ok(())
}

pub async fn sync_repository(ctx: &ProjectContext, project: &RemoteProject) -> anyhow::Result<()> {
    let parents = resolve_parents(ctx, project).await?;

    let last_commit_at = match ctx.provider.latest_commit_at(project).await {
        Ok(at) => at,
        Err(e) => {
            tracing::warn!(project = %project.path, error = %e, "Cannot read latest commit");
            None
        }
    };
    let default_branch = match ctx.provider.default_branch(project).await {
        Ok(branch) => branch,
        Err(e) => {
            tracing::warn!(project = %project.path, error = %e, "Cannot read default branch");
            None
        }
    };

    let row = NewRepository::from_remote(
        ctx.instance_id,
        project,
        ProjectObservation {
            parents,
            default_branch,
            last_commit_at,
        },
        Utc::now(),
    );
    let report = ctx.gateway.upsert(vec![row]).await;
    if !report.is_complete() {
        anyhow::bail!("repository row for '{}' was not stored", project.path);
    }
    Ok(())
}

/// One outcome per registry, in listing order. A failed registry does not
/// stop the ones after it.
pub async fn sync_registries(
    ctx: &ProjectContext,
    project: &RemoteProject,
) -> anyhow::Result<Vec<RegistryOutcome>> {
    let registries = ctx.provider.registries(project.id).await?;
    if registries.is_empty() {
        tracing::debug!(project = %project.path, "No registries");
        return Ok(Vec::new());
    }

    let mut outcomes = Vec::with_capacity(registries.len());
    for registry in &registries {
        let outcome = sync_registry(ctx, registry).await;
        match &outcome {
            RegistryOutcome::Synced {
                fetched,
                skipped,
                failed,
            } => {
                tracing::debug!(
                    registry = %registry.location,
                    fetched,
                    skipped,
                    failed,
                    "Registry synced"
                );
            }
            RegistryOutcome::EmptyRegistry => {
                tracing::debug!(registry = %registry.location, "Registry has no tags");
            }
            RegistryOutcome::Failed(reason) => {
                tracing::error!(
                    project = %project.path,
                    registry = %registry.location,
                    error = %reason,
                    "Registry failed"
                );
            }
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Store the registry row and its tags. Tags whose path is already stored are
/// skipped unless this is a full-update pass.
pub async fn sync_registry(ctx: &ProjectContext, registry: &RemoteRegistry) -> RegistryOutcome {
    let checked_at = Utc::now();
    let report = ctx
        .gateway
        .upsert(vec![NewRegistry::from_remote(ctx.instance_id, registry, checked_at)])
        .await;
    if !report.is_complete() {
        return RegistryOutcome::Failed("registry row was not stored".to_string());
    }

    let tags: Vec<RemoteTagRef> = match ctx.provider.tags(registry).try_collect::<Vec<_>>().await {
        Ok(tags) => tags,
        Err(e) => return RegistryOutcome::Failed(format!("tag listing: {e}")),
    };
    if tags.is_empty() {
        return RegistryOutcome::EmptyRegistry;
    }

    let known = match ctx
        .gateway
        .store()
        .image_paths(ctx.instance_id, registry.project_id, registry.id)
        .await
    {
        Ok(paths) => paths,
        Err(e) => return RegistryOutcome::Failed(format!("stored images: {e}")),
    };

    let mut rows = Vec::new();
    let mut skipped = 0;
    let mut failed = 0;
    for tag in &tags {
        if !ctx.full_update && known.contains(&tag.path) {
            skipped += 1;
            continue;
        }
        match ctx.provider.tag(registry, &tag.name).await {
            Ok(detail) => rows.push(NewImage::from_remote(
                ctx.instance_id,
                registry,
                &detail,
                checked_at,
            )),
            Err(e) => {
                failed += 1;
                tracing::warn!(image = %tag.location, error = %e, "Tag detail failed");
            }
        }
    }

    let fetched = rows.len();
    let report = ctx.gateway.upsert(rows).await;
    if !report.is_complete() {
        return RegistryOutcome::Failed(format!(
            "{} image chunk(s) were not stored",
            report.failed_chunks
        ));
    }
    RegistryOutcome::Synced {
        fetched,
        skipped,
        failed,
    }
}

/// Users and memberships. A member listed twice keeps its first entry.
pub async fn sync_members(ctx: &ProjectContext, project: &RemoteProject) -> anyhow::Result<usize> {
    let members = ctx.provider.members(project).await?;
    let mut seen = HashSet::new();
    let members: Vec<_> = members.into_iter().filter(|m| seen.insert(m.id)).collect();

    let users = members
        .iter()
        .map(|m| NewUser::from_remote(ctx.instance_id, m))
        .collect();
    let memberships = members
        .iter()
        .map(|m| NewRepositoryMember::from_remote(ctx.instance_id, project.id, m))
        .collect();

    let users = ctx.gateway.upsert::<NewUser>(users).await;
    let memberships = ctx.gateway.upsert::<NewRepositoryMember>(memberships).await;
    if !users.is_complete() || !memberships.is_complete() {
        anyhow::bail!("member rows for '{}' were not fully stored", project.path);
    }
    Ok(members.len())
}

/// One row per email with summed counters.
pub fn aggregate_contributions(
    instance_id: i64,
    repo_id: i64,
    contributions: &[RemoteContribution],
) -> Vec<NewContributor> {
    let mut totals: BTreeMap<&str, (i64, i64, i64)> = BTreeMap::new();
    for c in contributions {
        let entry = totals.entry(c.email.as_str()).or_default();
        entry.0 += c.commits;
        entry.1 += c.additions;
        entry.2 += c.deletions;
    }
    totals
        .into_iter()
        .map(|(email, (commits, additions, deletions))| NewContributor {
            vcs_instance_id: instance_id,
            repo_id,
            email: email.to_string(),
            commits,
            additions,
            deletions,
        })
        .collect()
}

pub async fn sync_contributors(
    ctx: &ProjectContext,
    project: &RemoteProject,
) -> anyhow::Result<usize> {
    let contributions = ctx.provider.contributions(project).await?;
    let rows = aggregate_contributions(ctx.instance_id, project.id, &contributions);
    let count = rows.len();
    let report = ctx.gateway.upsert(rows).await;
    if !report.is_complete() {
        anyhow::bail!("contributor rows for '{}' were not fully stored", project.path);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::services::test_support::{self, member, registry, tag_ref, FakeProvider};
    use crate::store::{MemoryStore, StoredProject};

    fn context(
        provider: Arc<FakeProvider>,
        store: Arc<MemoryStore>,
        index: ProjectIndex,
        full_update: bool,
    ) -> ProjectContext {
        ProjectContext {
            instance_id: 1,
            provider,
            gateway: Gateway::new(store, 100),
            index: Arc::new(index),
            full_update,
            process_registries: true,
            process_users: true,
        }
    }

    fn contribution(email: &str, commits: i64) -> RemoteContribution {
        RemoteContribution {
            email: email.to_string(),
            commits,
            additions: commits * 10,
            deletions: commits,
        }
    }

    #[tokio::test]
    async fn stored_parents_are_reused_when_path_matches() {
        let provider = Arc::new(FakeProvider::with_projects([5, 6]));
        let store = Arc::new(MemoryStore::new());
        let mut index = ProjectIndex::new();
        index.insert(
            5,
            StoredProject {
                path: "team/app5".to_string(),
                parents: Some(vec![1, 7]),
            },
        );
        index.insert(
            6,
            StoredProject {
                path: "old/place/app6".to_string(),
                parents: Some(vec![99]),
            },
        );
        let ctx = context(provider.clone(), store, index, false);

        let kept = resolve_parents(&ctx, &test_support::project(5)).await.unwrap();
        assert_eq!(kept, Some(vec![1, 7]));
        assert_eq!(provider.ancestor_calls.load(Ordering::SeqCst), 0);

        let moved = resolve_parents(&ctx, &test_support::project(6)).await.unwrap();
        assert_eq!(moved, Some(vec![7]));
        assert_eq!(provider.ancestor_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn known_tags_are_skipped_outside_full_update() {
        let reg = registry(40, 5);
        let mut provider = FakeProvider::with_projects([5]);
        provider
            .tags
            .insert(40, vec![tag_ref(&reg, "1.0"), tag_ref(&reg, "1.1")]);
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStore::new());

        let ctx = context(provider.clone(), store.clone(), ProjectIndex::new(), false);
        let first = sync_registry(&ctx, &reg).await;
        assert_eq!(
            first,
            RegistryOutcome::Synced {
                fetched: 2,
                skipped: 0,
                failed: 0
            }
        );

        let second = sync_registry(&ctx, &reg).await;
        assert_eq!(
            second,
            RegistryOutcome::Synced {
                fetched: 0,
                skipped: 2,
                failed: 0
            }
        );
        assert_eq!(provider.tag_details.load(Ordering::SeqCst), 2);

        let full = context(provider.clone(), store.clone(), ProjectIndex::new(), true);
        sync_registry(&full, &reg).await;
        assert_eq!(provider.tag_details.load(Ordering::SeqCst), 4);
        assert_eq!(store.images().len(), 2);
    }

    #[tokio::test]
    async fn registry_without_tags_is_reported_empty() {
        let provider = Arc::new(FakeProvider::with_projects([5]));
        let store = Arc::new(MemoryStore::new());
        let ctx = context(provider, store.clone(), ProjectIndex::new(), false);

        let outcome = sync_registry(&ctx, &registry(41, 5)).await;
        assert_eq!(outcome, RegistryOutcome::EmptyRegistry);
        assert_eq!(store.summary().registries, 1);
        assert!(store.images().is_empty());
    }

    #[tokio::test]
    async fn duplicate_members_keep_first_entry() {
        let mut provider = FakeProvider::with_projects([5]);
        provider.members.insert(
            5,
            vec![member(1, "Maintainer"), member(2, "Developer"), member(1, "Guest")],
        );
        let store = Arc::new(MemoryStore::new());
        let ctx = context(Arc::new(provider), store.clone(), ProjectIndex::new(), false);

        let count = sync_members(&ctx, &test_support::project(5)).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.users().len(), 2);
        let levels: Vec<String> = store
            .members()
            .into_iter()
            .filter(|m| m.user_id == 1)
            .map(|m| m.access_level)
            .collect();
        assert_eq!(levels, vec!["Maintainer".to_string()]);
    }

    #[test]
    fn contributions_are_summed_per_email() {
        let rows = aggregate_contributions(
            1,
            5,
            &[
                contribution("a@example.com", 2),
                contribution("b@example.com", 1),
                contribution("a@example.com", 3),
            ],
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].email, "a@example.com");
        assert_eq!(rows[0].commits, 5);
        assert_eq!(rows[0].additions, 50);
        assert_eq!(rows[1].commits, 1);
    }

    #[tokio::test]
    async fn secondaries_skipped_for_known_project_on_regular_day() {
        let reg = registry(40, 5);
        let mut provider = FakeProvider::with_projects([5]);
        provider.registries.insert(5, vec![reg.clone()]);
        provider.tags.insert(40, vec![tag_ref(&reg, "1.0")]);
        provider.members.insert(5, vec![member(1, "Developer")]);
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStore::new());
        let ctx = context(provider.clone(), store.clone(), ProjectIndex::new(), false);
        let project = test_support::project(5);

        process_project(&ctx, &project, false, WorkerId(0)).await.unwrap();
        let summary = store.summary();
        assert_eq!(summary.repositories, 1);
        assert_eq!(summary.registries, 0);
        assert_eq!(summary.users, 0);

        process_project(&ctx, &project, true, WorkerId(0)).await.unwrap();
        let summary = store.summary();
        assert_eq!(summary.registries, 1);
        assert_eq!(summary.images, 1);
        assert_eq!(summary.users, 1);
        assert_eq!(summary.members, 1);
    }

    #[tokio::test]
    async fn failing_registry_does_not_stop_the_next() {
        let broken = registry(40, 5);
        let healthy = registry(41, 5);
        let mut provider = FakeProvider::with_projects([5]);
        provider
            .registries
            .insert(5, vec![broken.clone(), healthy.clone()]);
        provider.tags.insert(40, vec![tag_ref(&broken, "1.0")]);
        provider
            .tags
            .insert(41, vec![tag_ref(&healthy, "2.0"), tag_ref(&healthy, "2.1")]);
        provider.failing_tag_listings.insert(40);
        let store = Arc::new(MemoryStore::new());
        let ctx = context(Arc::new(provider), store.clone(), ProjectIndex::new(), false);

        let outcomes = sync_registries(&ctx, &test_support::project(5)).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(&outcomes[0], RegistryOutcome::Failed(reason) if reason.contains("tag listing")));
        assert_eq!(
            outcomes[1],
            RegistryOutcome::Synced {
                fetched: 2,
                skipped: 0,
                failed: 0
            }
        );
        let mut tags: Vec<(i64, String)> = store
            .images()
            .into_iter()
            .map(|image| (image.registry_id, image.tag))
            .collect();
        tags.sort();
        assert_eq!(tags, vec![(41, "2.0".to_string()), (41, "2.1".to_string())]);
    }
}
