//! PostgreSQL backend (diesel-async over a deadpool pool).

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use super::{InventoryStore, ProjectIndex, ScanFilter, ScanTarget, StoredProject, UpsertBatch};
use crate::migration::run_migration;
use crate::models::{
    NewContributor, NewFinding, NewGroup, NewImage, NewRegistry, NewRepository,
    NewRepositoryMember, NewUser, NewVcsInstance, VcsInstance,
};
use crate::schema::{
    contributors, findings, groups, images, registries, repositories, repository_users, users,
    vcs_instances,
};

pub struct PgStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgStore {
    /// Build the pool and run the inventory migration.
    pub async fn connect(database_url: &str, max_connections: usize) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_connections.max(1))
            .build()?;
        let store = Self { pool };

        let mut conn = store.conn().await?;
        tracing::info!("Running inventory migration...");
        run_migration(&mut conn).await?;
        tracing::info!("Inventory migration completed.");

        Ok(store)
    }

    async fn conn(&self) -> anyhow::Result<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))
    }
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn ensure_instance(
        &self,
        instance: NewVcsInstance,
    ) -> anyhow::Result<(VcsInstance, bool)> {
        let mut conn = self.conn().await?;
        let existing = vcs_instances::table
            .filter(vcs_instances::url.eq(&instance.url))
            .select(VcsInstance::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        if let Some(found) = existing {
            return Ok((found, false));
        }

        let created = diesel::insert_into(vcs_instances::table)
            .values(&instance)
            .returning(VcsInstance::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok((created, true))
    }

    async fn instances(&self) -> anyhow::Result<Vec<VcsInstance>> {
        let mut conn = self.conn().await?;
        let rows = vcs_instances::table
            .order(vcs_instances::id.asc())
            .select(VcsInstance::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn last_project_id(&self, instance_id: i64) -> anyhow::Result<Option<i64>> {
        let mut conn = self.conn().await?;
        let max = repositories::table
            .filter(repositories::vcs_instance_id.eq(instance_id))
            .select(diesel::dsl::max(repositories::vcs_id))
            .first::<Option<i64>>(&mut conn)
            .await?;
        Ok(max)
    }

    async fn last_group_id(&self, instance_id: i64) -> anyhow::Result<Option<i64>> {
        let mut conn = self.conn().await?;
        let max = groups::table
            .filter(groups::vcs_instance_id.eq(instance_id))
            .select(diesel::dsl::max(groups::vcs_id))
            .first::<Option<i64>>(&mut conn)
            .await?;
        Ok(max)
    }

    async fn project_index(&self, instance_id: i64) -> anyhow::Result<ProjectIndex> {
        let mut conn = self.conn().await?;
        let rows = repositories::table
            .filter(repositories::vcs_instance_id.eq(instance_id))
            .select((
                repositories::vcs_id,
                repositories::path,
                repositories::parents,
            ))
            .load::<(i64, String, Option<Vec<i64>>)>(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(vcs_id, path, parents)| (vcs_id, StoredProject { path, parents }))
            .collect())
    }

    async fn image_paths(
        &self,
        instance_id: i64,
        repo_id: i64,
        registry_id: i64,
    ) -> anyhow::Result<HashSet<String>> {
        let mut conn = self.conn().await?;
        let paths = images::table
            .filter(images::vcs_instance_id.eq(instance_id))
            .filter(images::repo_id.eq(repo_id))
            .filter(images::registry_id.eq(registry_id))
            .select(images::path)
            .load::<String>(&mut conn)
            .await?;
        Ok(paths.into_iter().collect())
    }

    async fn scan_targets(
        &self,
        instance_id: i64,
        filter: ScanFilter,
    ) -> anyhow::Result<Vec<ScanTarget>> {
        let mut conn = self.conn().await?;
        let mut query = repositories::table
            .filter(repositories::vcs_instance_id.eq(instance_id))
            .select((
                repositories::vcs_id,
                repositories::git_url,
                repositories::vcs_instance_id,
            ))
            .order(repositories::vcs_id.asc())
            .into_boxed();
        if filter == ScanFilter::Default {
            query = query.filter(
                repositories::last_time_scanned.is_null().or(repositories::last_activity
                    .gt(repositories::last_time_scanned.assume_not_null())),
            );
        }
        let rows = query.load::<(i64, String, i64)>(&mut conn).await?;
        Ok(rows
            .into_iter()
            .map(|(vcs_id, git_url, vcs_instance_id)| ScanTarget {
                vcs_id,
                git_url,
                vcs_instance_id,
            })
            .collect())
    }

    async fn mark_scanned(
        &self,
        instance_id: i64,
        repo_id: i64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            repositories::table
                .filter(repositories::vcs_instance_id.eq(instance_id))
                .filter(repositories::vcs_id.eq(repo_id)),
        )
        .set(repositories::last_time_scanned.eq(Some(at)))
        .execute(&mut conn)
        .await?;
        if updated == 0 {
            anyhow::bail!("repository {repo_id} not found for instance {instance_id}");
        }
        Ok(())
    }

    async fn upsert_chunks(
        &self,
        chunks: Vec<UpsertBatch>,
    ) -> anyhow::Result<Vec<anyhow::Result<usize>>> {
        let mut conn = self.conn().await?;
        let mut results = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let result = match chunk {
                UpsertBatch::Groups(rows) => upsert_groups(&mut conn, &rows).await,
                UpsertBatch::Repositories(rows) => upsert_repositories(&mut conn, &rows).await,
                UpsertBatch::Registries(rows) => upsert_registries(&mut conn, &rows).await,
                UpsertBatch::Images(rows) => upsert_images(&mut conn, &rows).await,
                UpsertBatch::Users(rows) => upsert_users(&mut conn, &rows).await,
                UpsertBatch::Members(rows) => upsert_members(&mut conn, &rows).await,
                UpsertBatch::Contributors(rows) => upsert_contributors(&mut conn, &rows).await,
                UpsertBatch::Findings(rows) => upsert_findings(&mut conn, &rows).await,
            };
            results.push(result.map_err(anyhow::Error::from));
        }
        Ok(results)
    }
}

async fn upsert_groups(conn: &mut AsyncPgConnection, rows: &[NewGroup]) -> QueryResult<usize> {
    diesel::insert_into(groups::table)
        .values(rows)
        .on_conflict((groups::vcs_instance_id, groups::vcs_id))
        .do_update()
        .set((
            groups::path.eq(excluded(groups::path)),
            groups::parent_id.eq(excluded(groups::parent_id)),
            groups::visibility.eq(excluded(groups::visibility)),
        ))
        .execute(conn)
        .await
}

async fn upsert_repositories(
    conn: &mut AsyncPgConnection,
    rows: &[NewRepository],
) -> QueryResult<usize> {
    use crate::schema::repositories::dsl as r;

    diesel::insert_into(r::repositories)
        .values(rows)
        .on_conflict((r::vcs_instance_id, r::vcs_id))
        .do_update()
        .set((
            r::path.eq(excluded(r::path)),
            r::group_id.eq(excluded(r::group_id)),
            r::parents.eq(excluded(r::parents)),
            r::web_url.eq(excluded(r::web_url)),
            r::git_url.eq(excluded(r::git_url)),
            r::visibility.eq(excluded(r::visibility)),
            r::is_archived.eq(excluded(r::is_archived)),
            r::forks_count.eq(excluded(r::forks_count)),
            r::default_branch.eq(excluded(r::default_branch)),
            r::last_activity.eq(excluded(r::last_activity)),
            r::last_commit_at.eq(excluded(r::last_commit_at)),
            r::last_time_checked.eq(excluded(r::last_time_checked)),
        ))
        .execute(conn)
        .await
}

async fn upsert_registries(
    conn: &mut AsyncPgConnection,
    rows: &[NewRegistry],
) -> QueryResult<usize> {
    diesel::insert_into(registries::table)
        .values(rows)
        .on_conflict((
            registries::vcs_instance_id,
            registries::vcs_id,
            registries::repo_id,
        ))
        .do_update()
        .set((
            registries::path.eq(excluded(registries::path)),
            registries::name.eq(excluded(registries::name)),
            registries::location.eq(excluded(registries::location)),
            registries::last_time_checked.eq(excluded(registries::last_time_checked)),
        ))
        .execute(conn)
        .await
}

async fn upsert_images(conn: &mut AsyncPgConnection, rows: &[NewImage]) -> QueryResult<usize> {
    diesel::insert_into(images::table)
        .values(rows)
        .on_conflict((
            images::vcs_instance_id,
            images::image,
            images::repo_id,
            images::registry_id,
        ))
        .do_update()
        .set((
            images::path.eq(excluded(images::path)),
            images::tag.eq(excluded(images::tag)),
            images::digest.eq(excluded(images::digest)),
            images::revision.eq(excluded(images::revision)),
            images::total_size.eq(excluded(images::total_size)),
            images::created_at.eq(excluded(images::created_at)),
            images::last_time_checked.eq(excluded(images::last_time_checked)),
        ))
        .execute(conn)
        .await
}

async fn upsert_users(conn: &mut AsyncPgConnection, rows: &[NewUser]) -> QueryResult<usize> {
    diesel::insert_into(users::table)
        .values(rows)
        .on_conflict((users::vcs_instance_id, users::vcs_id))
        .do_update()
        .set((
            users::username.eq(excluded(users::username)),
            users::name.eq(excluded(users::name)),
            users::state.eq(excluded(users::state)),
            users::locked.eq(excluded(users::locked)),
            users::web_url.eq(excluded(users::web_url)),
        ))
        .execute(conn)
        .await
}

async fn upsert_members(
    conn: &mut AsyncPgConnection,
    rows: &[NewRepositoryMember],
) -> QueryResult<usize> {
    diesel::insert_into(repository_users::table)
        .values(rows)
        .on_conflict((
            repository_users::vcs_instance_id,
            repository_users::repo_id,
            repository_users::user_id,
            repository_users::access_level,
        ))
        .do_update()
        .set(repository_users::access_level.eq(excluded(repository_users::access_level)))
        .execute(conn)
        .await
}

async fn upsert_contributors(
    conn: &mut AsyncPgConnection,
    rows: &[NewContributor],
) -> QueryResult<usize> {
    diesel::insert_into(contributors::table)
        .values(rows)
        .on_conflict((
            contributors::vcs_instance_id,
            contributors::repo_id,
            contributors::email,
        ))
        .do_update()
        .set((
            contributors::commits.eq(excluded(contributors::commits)),
            contributors::additions.eq(excluded(contributors::additions)),
            contributors::deletions.eq(excluded(contributors::deletions)),
        ))
        .execute(conn)
        .await
}

async fn upsert_findings(conn: &mut AsyncPgConnection, rows: &[NewFinding]) -> QueryResult<usize> {
    diesel::insert_into(findings::table)
        .values(rows)
        .on_conflict((
            findings::vcs_instance_id,
            findings::repo_id,
            findings::fingerprint,
        ))
        .do_update()
        .set((
            findings::author.eq(excluded(findings::author)),
            findings::email.eq(excluded(findings::email)),
            findings::commit.eq(excluded(findings::commit)),
            findings::commit_date.eq(excluded(findings::commit_date)),
            findings::found_date.eq(excluded(findings::found_date)),
        ))
        .execute(conn)
        .await
}
