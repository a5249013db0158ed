//! Bitbucket Server (REST 1.0) adapter.
//!
//! Bitbucket projects are inventoried as groups and repositories as projects.
//! There is no lookup by numeric id, so this adapter only serves full passes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
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

const PAGE_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    values: Vec<T>,
    #[serde(default = "default_last_page")]
    is_last_page: bool,
    next_page_start: Option<u32>,
}

fn default_last_page() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct Link {
    href: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default, rename = "self")]
    self_: Vec<Link>,
    #[serde(default, rename = "clone")]
    clone_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct BbProject {
    id: i64,
    key: String,
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Deserialize)]
struct BbRepo {
    id: i64,
    slug: String,
    project: BbProject,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbUser {
    id: i64,
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct BbPermission {
    user: BbUser,
    permission: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbAuthor {
    #[serde(default)]
    email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbCommit {
    author: BbAuthor,
    author_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbBranch {
    display_id: String,
}

fn visibility(public: bool) -> String {
    let value = if public { "public" } else { "private" };
    value.to_string()
}

impl From<BbProject> for RemoteGroup {
    fn from(p: BbProject) -> Self {
        Self {
            id: p.id,
            path: p.key,
            parent_id: None,
            visibility: visibility(p.public),
        }
    }
}

impl From<BbRepo> for RemoteProject {
    fn from(r: BbRepo) -> Self {
        let web_url = r
            .links
            .self_
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_default();
        let git_url = r
            .links
            .clone_links
            .iter()
            .find(|l| l.name.as_deref() == Some("http"))
            .or_else(|| r.links.clone_links.first())
            .map(|l| l.href.clone())
            .unwrap_or_default();

        Self {
            id: r.id,
            path: format!("{}/{}", r.project.key, r.slug),
            namespace: r.project.key,
            slug: r.slug,
            group_id: r.project.id,
            web_url,
            git_url,
            visibility: visibility(r.public),
            archived: r.archived,
            forks_count: 0,
            default_branch: None,
            created_at: None,
            last_activity_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BitbucketProvider {
    api: ApiClient,
}

impl BitbucketProvider {
    /// Build the client and verify the credentials with a one-item listing.
    pub async fn connect(
        url: &str,
        username: &str,
        password: &str,
        options: &HttpOptions,
    ) -> Result<Self, AdapterInitError> {
        let init_err = |source| AdapterInitError {
            url: url.to_string(),
            source,
        };
        let auth = Auth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        };
        let api = ApiClient::new(url, auth, options, "bitbucket").map_err(init_err)?;
        api.get("/rest/api/1.0/projects", &[("limit", "1".to_string())])
            .await
            .map_err(init_err)?;
        tracing::info!(url = %url, "Authenticated against Bitbucket");
        Ok(Self { api })
    }

    fn paged<'a, T>(&'a self, path: String, query: Vec<(&'static str, String)>) -> ItemStream<'a, T>
    where
        T: DeserializeOwned + Send + 'a,
    {
        stream::try_unfold(Some(0u32), move |start| {
            let path = path.clone();
            let mut query = query.clone();
            async move {
                let Some(start) = start else {
                    return Ok::<_, ProviderError>(None);
                };
                query.push(("start", start.to_string()));
                query.push(("limit", PAGE_LIMIT.to_string()));
                let page: Page<T> = self.api.get_json(&path, &query).await?;
                let next = if page.is_last_page {
                    None
                } else {
                    page.next_page_start
                };
                Ok::<_, ProviderError>(Some((page.values, next)))
            }
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, ProviderError>)))
        .try_flatten()
        .boxed()
    }

    fn repo_path(project: &RemoteProject, tail: &str) -> String {
        format!(
            "/rest/api/1.0/projects/{}/repos/{}{}",
            project.namespace, project.slug, tail
        )
    }
}

#[async_trait]
impl Provider for BitbucketProvider {
    fn kind(&self) -> VcsKind {
        VcsKind::Bitbucket
    }

    fn supports_id_lookup(&self) -> bool {
        false
    }

    fn groups(&self) -> ItemStream<'_, RemoteGroup> {
        self.paged::<BbProject>("/rest/api/1.0/projects".to_string(), Vec::new())
            .map_ok(RemoteGroup::from)
            .boxed()
    }

    async fn group(&self, _id: i64) -> Result<Option<RemoteGroup>, ProviderError> {
        Err(ProviderError::Unsupported("group lookup by id"))
    }

    fn projects(&self) -> ItemStream<'_, RemoteProject> {
        self.paged::<BbRepo>("/rest/api/1.0/repos".to_string(), Vec::new())
            .map_ok(RemoteProject::from)
            .boxed()
    }

    async fn project(&self, _id: i64) -> Result<Option<RemoteProject>, ProviderError> {
        Err(ProviderError::Unsupported("project lookup by id"))
    }

    async fn project_ancestors(&self, project: &RemoteProject) -> Result<Vec<i64>, ProviderError> {
        Ok(vec![project.group_id])
    }

    async fn default_branch(
        &self,
        project: &RemoteProject,
    ) -> Result<Option<String>, ProviderError> {
        let branch: Option<BbBranch> = self
            .api
            .get_optional(&Self::repo_path(project, "/branches/default"), &[])
            .await?;
        Ok(branch.map(|b| b.display_id))
    }

    async fn registries(&self, _project_id: i64) -> Result<Vec<RemoteRegistry>, ProviderError> {
        Ok(Vec::new())
    }

    fn tags<'a>(&'a self, _registry: &'a RemoteRegistry) -> ItemStream<'a, RemoteTagRef> {
        stream::empty().boxed()
    }

    async fn tag(&self, _registry: &RemoteRegistry, _name: &str) -> Result<RemoteTag, ProviderError> {
        Err(ProviderError::Unsupported("container registries"))
    }

    async fn members(&self, project: &RemoteProject) -> Result<Vec<RemoteMember>, ProviderError> {
        let permissions: Vec<BbPermission> = self
            .paged(Self::repo_path(project, "/permissions/users"), Vec::new())
            .try_collect()
            .await?;
        Ok(permissions
            .into_iter()
            .map(|p| RemoteMember {
                id: p.user.id,
                username: p.user.name,
                name: p.user.display_name,
                state: if p.user.active { "active" } else { "blocked" }.to_string(),
                locked: !p.user.active,
                web_url: p
                    .user
                    .links
                    .self_
                    .first()
                    .map(|l| l.href.clone())
                    .unwrap_or_default(),
                access_level: p.permission,
            })
            .collect())
    }

    async fn contributions(
        &self,
        project: &RemoteProject,
    ) -> Result<Vec<RemoteContribution>, ProviderError> {
        let commits: Vec<BbCommit> = self
            .paged(Self::repo_path(project, "/commits"), Vec::new())
            .try_collect()
            .await?;
        Ok(commits
            .into_iter()
            .filter_map(|c| c.author.email_address)
            .map(|email| RemoteContribution {
                email,
                commits: 1,
                additions: 0,
                deletions: 0,
            })
            .collect())
    }

    async fn latest_commit_at(
        &self,
        project: &RemoteProject,
    ) -> Result<Option<DateTime<Utc>>, ProviderError> {
        let page: Option<Page<BbCommit>> = self
            .api
            .get_optional(
                &Self::repo_path(project, "/commits"),
                &[("limit", "1".to_string())],
            )
            .await?;
        Ok(page
            .and_then(|p| p.values.into_iter().next())
            .and_then(|c| c.author_timestamp)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn connected(server: &MockServer) -> BitbucketProvider {
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects"))
            .and(query_param("limit", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"values": [], "isLastPage": true})),
            )
            .mount(server)
            .await;
        let options = HttpOptions {
            verify_ssl: true,
            rate_limit_backoff: Duration::from_millis(10),
        };
        BitbucketProvider::connect(&server.uri(), "bot", "pw", &options)
            .await
            .unwrap()
    }

    fn repo_json(id: i64, slug: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "slug": slug,
            "public": false,
            "project": {"id": 3, "key": "OPS", "public": false},
            "links": {
                "self": [{"href": format!("https://bb.example.com/projects/OPS/repos/{slug}/browse")}],
                "clone": [
                    {"href": format!("ssh://git@bb.example.com:7999/ops/{slug}.git"), "name": "ssh"},
                    {"href": format!("https://bb.example.com/scm/ops/{slug}.git"), "name": "http"}
                ]
            }
        })
    }

    #[tokio::test]
    async fn repositories_page_through_start_offsets() {
        let server = MockServer::start().await;
        let provider = connected(&server).await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/repos"))
            .and(query_param("start", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [repo_json(1, "api")],
                "isLastPage": false,
                "nextPageStart": 1
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/repos"))
            .and(query_param("start", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [repo_json(2, "web")],
                "isLastPage": true
            })))
            .mount(&server)
            .await;

        let projects: Vec<RemoteProject> = provider.projects().try_collect().await.unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].path, "OPS/api");
        assert_eq!(projects[0].git_url, "https://bb.example.com/scm/ops/api.git");
        assert_eq!(projects[1].group_id, 3);
        assert!(!provider.supports_id_lookup());
    }

    #[tokio::test]
    async fn contributions_are_one_per_commit() {
        let server = MockServer::start().await;
        let provider = connected(&server).await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/OPS/repos/api/commits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [
                    {"author": {"emailAddress": "a@example.com"}, "authorTimestamp": 1700000000000i64},
                    {"author": {"emailAddress": "a@example.com"}, "authorTimestamp": 1690000000000i64},
                    {"author": {"name": "ghost"}, "authorTimestamp": 1680000000000i64}
                ],
                "isLastPage": true
            })))
            .mount(&server)
            .await;

        let project = RemoteProject::from(serde_json::from_value::<BbRepo>(repo_json(1, "api")).unwrap());
        let contributions = provider.contributions(&project).await.unwrap();
        assert_eq!(contributions.len(), 2);
        assert!(contributions.iter().all(|c| c.commits == 1 && c.additions == 0));

        let latest = provider.latest_commit_at(&project).await.unwrap();
        assert_eq!(latest, Utc.timestamp_millis_opt(1700000000000).single());
    }

    #[tokio::test]
    async fn inactive_users_are_blocked_and_locked() {
        let server = MockServer::start().await;
        let provider = connected(&server).await;
        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/OPS/repos/api/permissions/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [{
                    "user": {"id": 12, "name": "old", "displayName": "Old Timer", "active": false,
                             "links": {"self": [{"href": "https://bb.example.com/users/old"}]}},
                    "permission": "REPO_WRITE"
                }],
                "isLastPage": true
            })))
            .mount(&server)
            .await;

        let project = RemoteProject::from(serde_json::from_value::<BbRepo>(repo_json(1, "api")).unwrap());
        let members = provider.members(&project).await.unwrap();
        assert_eq!(members[0].state, "blocked");
        assert!(members[0].locked);
        assert_eq!(members[0].access_level, "REPO_WRITE");
    }

    #[tokio::test]
    async fn id_lookup_is_unsupported() {
        let server = MockServer::start().await;
        let provider = connected(&server).await;
        assert!(matches!(
            provider.project(1).await,
            Err(ProviderError::Unsupported(_))
        ));
        assert!(provider.registries(1).await.unwrap().is_empty());
    }
}
