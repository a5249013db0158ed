//! VCS platform adapters.
//!
//! A `Provider` exposes one platform instance through a uniform capability set.
//! Listings are lazy, forward-only streams; each call starts a fresh listing.

pub mod bitbucket;
pub mod gitlab;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::errors::{AdapterInitError, ProviderError};
use crate::models::VcsKind;
use crate::settings::InstanceSettings;

pub use bitbucket::BitbucketProvider;
pub use gitlab::GitLabProvider;
pub use http::HttpOptions;

pub type ItemStream<'a, T> = BoxStream<'a, Result<T, ProviderError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteGroup {
    pub id: i64,
    pub path: String,
    pub parent_id: Option<i64>,
    pub visibility: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteProject {
    pub id: i64,
    /// Full path, e.g. `group/sub/project` or `KEY/slug`.
    pub path: String,
    /// Namespace path the project lives in.
    pub namespace: String,
    pub slug: String,
    pub group_id: i64,
    pub web_url: String,
    pub git_url: String,
    pub visibility: String,
    pub archived: bool,
    pub forks_count: i32,
    pub default_branch: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRegistry {
    pub id: i64,
    pub project_id: i64,
    pub path: String,
    pub name: String,
    pub location: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A tag as returned by a registry listing (no detail yet).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTagRef {
    pub name: String,
    pub path: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTag {
    pub name: String,
    pub path: String,
    pub location: String,
    pub digest: Option<String>,
    pub revision: Option<String>,
    pub total_size: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMember {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub state: String,
    pub locked: bool,
    pub web_url: String,
    pub access_level: String,
}

/// One contributor entry; several may share an email.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteContribution {
    pub email: String,
    pub commits: i64,
    pub additions: i64,
    pub deletions: i64,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> VcsKind;

    /// Whether `project(id)` / `group(id)` are available. The fast pass
    /// relies on direct id lookup.
    fn supports_id_lookup(&self) -> bool {
        true
    }

    /// All groups, highest id first where the platform allows it.
    fn groups(&self) -> ItemStream<'_, RemoteGroup>;

    /// `Ok(None)` when the id does not exist (gap in the id space).
    async fn group(&self, id: i64) -> Result<Option<RemoteGroup>, ProviderError>;

    /// All projects, highest id first where the platform allows it.
    fn projects(&self) -> ItemStream<'_, RemoteProject>;

    /// `Ok(None)` when the id does not exist (gap in the id space).
    async fn project(&self, id: i64) -> Result<Option<RemoteProject>, ProviderError>;

    async fn top_project_id(&self) -> Result<Option<i64>, ProviderError> {
        Ok(self.projects().try_next().await?.map(|p| p.id))
    }

    async fn top_group_id(&self) -> Result<Option<i64>, ProviderError> {
        Ok(self.groups().try_next().await?.map(|g| g.id))
    }

    /// Live parent-group chain of a project, nearest ancestor last.
    async fn project_ancestors(&self, project: &RemoteProject) -> Result<Vec<i64>, ProviderError>;

    async fn default_branch(
        &self,
        project: &RemoteProject,
    ) -> Result<Option<String>, ProviderError> {
        Ok(project.default_branch.clone())
    }

    async fn registries(&self, project_id: i64) -> Result<Vec<RemoteRegistry>, ProviderError>;

    fn tags<'a>(&'a self, registry: &'a RemoteRegistry) -> ItemStream<'a, RemoteTagRef>;

    async fn tag(&self, registry: &RemoteRegistry, name: &str) -> Result<RemoteTag, ProviderError>;

    async fn members(&self, project: &RemoteProject) -> Result<Vec<RemoteMember>, ProviderError>;

    async fn contributions(
        &self,
        project: &RemoteProject,
    ) -> Result<Vec<RemoteContribution>, ProviderError>;

    async fn latest_commit_at(
        &self,
        project: &RemoteProject,
    ) -> Result<Option<DateTime<Utc>>, ProviderError>;
}

/// Builds authenticated providers for configured instances.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        settings: &InstanceSettings,
    ) -> Result<Arc<dyn Provider>, AdapterInitError>;
}

/// Connects to real platforms over HTTP.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    pub rate_limit_backoff: std::time::Duration,
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        settings: &InstanceSettings,
    ) -> Result<Arc<dyn Provider>, AdapterInitError> {
        let options = HttpOptions {
            verify_ssl: settings.verify_ssl,
            rate_limit_backoff: self.rate_limit_backoff,
        };
        let provider: Arc<dyn Provider> = match settings.kind {
            VcsKind::GitLab => Arc::new(
                GitLabProvider::connect(&settings.url, &settings.token, &options).await?,
            ),
            VcsKind::Bitbucket => Arc::new(
                BitbucketProvider::connect(
                    &settings.url,
                    &settings.username,
                    &settings.token,
                    &options,
                )
                .await?,
            ),
        };
        Ok(provider)
    }
}
