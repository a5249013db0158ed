//! GitLab (REST v4) adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::http::{ApiClient, Auth, HttpOptions};
use super::{
    ItemStream, Provider, RemoteContribution, RemoteGroup, RemoteMember, RemoteProject,
    RemoteRegistry, RemoteTag, RemoteTagRef,
};
use crate::errors::{AdapterInitError, ProviderError};
use crate::models::VcsKind;

const PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
struct GlGroup {
    id: i64,
    full_path: String,
    parent_id: Option<i64>,
    #[serde(default)]
    visibility: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlNamespace {
    id: i64,
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct GlProject {
    id: i64,
    path: String,
    path_with_namespace: String,
    namespace: GlNamespace,
    web_url: String,
    http_url_to_repo: String,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    forks_count: i32,
    default_branch: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GlRegistry {
    id: i64,
    name: String,
    path: String,
    project_id: i64,
    location: String,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GlTagRef {
    name: String,
    path: String,
    location: String,
}

#[derive(Debug, Deserialize)]
struct GlTag {
    name: String,
    path: String,
    location: String,
    digest: Option<String>,
    revision: Option<String>,
    total_size: Option<i64>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GlMember {
    id: i64,
    username: String,
    name: String,
    state: String,
    #[serde(default)]
    locked: bool,
    web_url: String,
    access_level: i64,
}

#[derive(Debug, Deserialize)]
struct GlContributor {
    email: String,
    commits: i64,
    additions: i64,
    deletions: i64,
}

#[derive(Debug, Deserialize)]
struct GlCommit {
    committed_date: Option<DateTime<Utc>>,
}

/// GitLab numeric access level → role name.
pub fn access_level_name(level: i64) -> String {
    match level {
        5 => "minimal_access".to_string(),
        10 => "guest".to_string(),
        20 => "reporter".to_string(),
        30 => "developer".to_string(),
        40 => "maintainer".to_string(),
        50 => "owner".to_string(),
        other => other.to_string(),
    }
}

impl From<GlGroup> for RemoteGroup {
    fn from(g: GlGroup) -> Self {
        Self {
            id: g.id,
            path: g.full_path,
            parent_id: g.parent_id,
            visibility: g.visibility.unwrap_or_else(|| "private".to_string()),
        }
    }
}

impl From<GlProject> for RemoteProject {
    fn from(p: GlProject) -> Self {
        Self {
            id: p.id,
            path: p.path_with_namespace,
            namespace: p.namespace.full_path,
            slug: p.path,
            group_id: p.namespace.id,
            web_url: p.web_url,
            git_url: p.http_url_to_repo,
            visibility: p.visibility.unwrap_or_else(|| "private".to_string()),
            archived: p.archived,
            forks_count: p.forks_count,
            default_branch: p.default_branch,
            created_at: p.created_at,
            last_activity_at: p.last_activity_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitLabProvider {
    api: ApiClient,
}

impl GitLabProvider {
    /// Build the client and verify the token against `/api/v4/user`.
    pub async fn connect(
        url: &str,
        token: &str,
        options: &HttpOptions,
    ) -> Result<Self, AdapterInitError> {
        let init_err = |source| AdapterInitError {
            url: url.to_string(),
            source,
        };
        let api = ApiClient::new(url, Auth::PrivateToken(token.to_string()), options, "gitlab")
            .map_err(init_err)?;
        api.get("/api/v4/user", &[]).await.map_err(init_err)?;
        tracing::info!(url = %url, "Authenticated against GitLab");
        Ok(Self { api })
    }

    fn paged<'a, T>(&'a self, path: String, query: Vec<(&'static str, String)>) -> ItemStream<'a, T>
    where
        T: DeserializeOwned + Send + 'a,
    {
        stream::try_unfold(Some(1u32), move |page| {
            let path = path.clone();
            let mut query = query.clone();
            async move {
                let Some(page) = page else {
                    return Ok::<_, ProviderError>(None);
                };
                query.push(("per_page", PER_PAGE.to_string()));
                query.push(("page", page.to_string()));
                let resp = self.api.get(&path, &query).await?;
                let next = resp
                    .headers()
                    .get("x-next-page")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u32>().ok());
                let items: Vec<T> = resp.json().await?;
                Ok::<_, ProviderError>(Some((items, next)))
            }
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, ProviderError>)))
        .try_flatten()
        .boxed()
    }

    fn id_desc() -> Vec<(&'static str, String)> {
        vec![
            ("order_by", "id".to_string()),
            ("sort", "desc".to_string()),
        ]
    }

    fn groups_query() -> Vec<(&'static str, String)> {
        let mut query = Self::id_desc();
        query.push(("all_available", "true".to_string()));
        query
    }

    async fn first_id<T>(&self, path: &str, query: Vec<(&'static str, String)>) -> Result<Option<i64>, ProviderError>
    where
        T: DeserializeOwned + HasId,
    {
        let mut query = query;
        query.push(("per_page", "1".to_string()));
        let items: Vec<T> = self.api.get_json(path, &query).await?;
        Ok(items.first().map(HasId::id))
    }
}

trait HasId {
    fn id(&self) -> i64;
}

impl HasId for GlGroup {
    fn id(&self) -> i64 {
        self.id
    }
}

impl HasId for GlProject {
    fn id(&self) -> i64 {
        self.id
    }
}

#[async_trait]
impl Provider for GitLabProvider {
    fn kind(&self) -> VcsKind {
        VcsKind::GitLab
    }

    fn groups(&self) -> ItemStream<'_, RemoteGroup> {
        self.paged::<GlGroup>("/api/v4/groups".to_string(), Self::groups_query())
            .map_ok(RemoteGroup::from)
            .boxed()
    }

    async fn group(&self, id: i64) -> Result<Option<RemoteGroup>, ProviderError> {
        let group: Option<GlGroup> = self
            .api
            .get_optional(&format!("/api/v4/groups/{id}"), &[])
            .await?;
        Ok(group.map(RemoteGroup::from))
    }

    fn projects(&self) -> ItemStream<'_, RemoteProject> {
        self.paged::<GlProject>("/api/v4/projects".to_string(), Self::id_desc())
            .map_ok(RemoteProject::from)
            .boxed()
    }

    async fn project(&self, id: i64) -> Result<Option<RemoteProject>, ProviderError> {
        let project: Option<GlProject> = self
            .api
            .get_optional(&format!("/api/v4/projects/{id}"), &[])
            .await?;
        Ok(project.map(RemoteProject::from))
    }

    async fn top_project_id(&self) -> Result<Option<i64>, ProviderError> {
        self.first_id::<GlProject>("/api/v4/projects", Self::id_desc())
            .await
    }

    async fn top_group_id(&self) -> Result<Option<i64>, ProviderError> {
        self.first_id::<GlGroup>("/api/v4/groups", Self::groups_query())
            .await
    }

    async fn project_ancestors(&self, project: &RemoteProject) -> Result<Vec<i64>, ProviderError> {
        let groups: Vec<GlGroup> = self
            .paged(format!("/api/v4/projects/{}/groups", project.id), Vec::new())
            .try_collect()
            .await?;
        Ok(groups.into_iter().map(|g| g.id).collect())
    }

    async fn registries(&self, project_id: i64) -> Result<Vec<RemoteRegistry>, ProviderError> {
        let path = format!("/api/v4/projects/{project_id}/registry/repositories");
        let listed: Result<Vec<GlRegistry>, ProviderError> =
            self.paged(path, Vec::new()).try_collect().await;
        match listed {
            Ok(registries) => Ok(registries
                .into_iter()
                .map(|r| RemoteRegistry {
                    id: r.id,
                    project_id: r.project_id,
                    path: r.path,
                    name: r.name,
                    location: r.location,
                    created_at: r.created_at,
                })
                .collect()),
            Err(ProviderError::Forbidden { .. }) => {
                tracing::debug!(project_id, "Registry listing forbidden, treating as none");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn tags<'a>(&'a self, registry: &'a RemoteRegistry) -> ItemStream<'a, RemoteTagRef> {
        let path = format!(
            "/api/v4/projects/{}/registry/repositories/{}/tags",
            registry.project_id, registry.id
        );
        self.paged::<GlTagRef>(path, Vec::new())
            .map_ok(|t| RemoteTagRef {
                name: t.name,
                path: t.path,
                location: t.location,
            })
            .boxed()
    }

    async fn tag(&self, registry: &RemoteRegistry, name: &str) -> Result<RemoteTag, ProviderError> {
        let path = format!(
            "/api/v4/projects/{}/registry/repositories/{}/tags/{}",
            registry.project_id, registry.id, name
        );
        let tag: GlTag = self.api.get_json(&path, &[]).await?;
        Ok(RemoteTag {
            name: tag.name,
            path: tag.path,
            location: tag.location,
            digest: tag.digest,
            revision: tag.revision,
            total_size: tag.total_size,
            created_at: tag.created_at,
        })
    }

    async fn members(&self, project: &RemoteProject) -> Result<Vec<RemoteMember>, ProviderError> {
        let members: Vec<GlMember> = self
            .paged(format!("/api/v4/projects/{}/members/all", project.id), Vec::new())
            .try_collect()
            .await?;
        Ok(members
            .into_iter()
            .map(|m| RemoteMember {
                id: m.id,
                username: m.username,
                name: m.name,
                state: m.state,
                locked: m.locked,
                web_url: m.web_url,
                access_level: access_level_name(m.access_level),
            })
            .collect())
    }

    async fn contributions(
        &self,
        project: &RemoteProject,
    ) -> Result<Vec<RemoteContribution>, ProviderError> {
        let path = format!("/api/v4/projects/{}/repository/contributors", project.id);
        let contributors: Vec<GlContributor> = self.paged(path, Vec::new()).try_collect().await?;
        Ok(contributors
            .into_iter()
            .map(|c| RemoteContribution {
                email: c.email,
                commits: c.commits,
                additions: c.additions,
                deletions: c.deletions,
            })
            .collect())
    }

    async fn latest_commit_at(
        &self,
        project: &RemoteProject,
    ) -> Result<Option<DateTime<Utc>>, ProviderError> {
        let path = format!("/api/v4/projects/{}/repository/commits", project.id);
        let commits: Option<Vec<GlCommit>> = self
            .api
            .get_optional(&path, &[("per_page", "1".to_string())])
            .await?;
        Ok(commits
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.committed_date))
    }
}
