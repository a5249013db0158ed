//! Scripted provider used by the service tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};

use crate::errors::{AdapterInitError, ProviderError};
use crate::models::VcsKind;
use crate::providers::{
    Connector, ItemStream, Provider, RemoteContribution, RemoteGroup, RemoteMember, RemoteProject,
    RemoteRegistry, RemoteTag, RemoteTagRef,
};
use crate::settings::InstanceSettings;

pub fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
}

pub fn project(id: i64) -> RemoteProject {
    RemoteProject {
        id,
        path: format!("team/app{id}"),
        namespace: "team".to_string(),
        slug: format!("app{id}"),
        group_id: 7,
        web_url: format!("https://git.example.com/team/app{id}"),
        git_url: format!("https://git.example.com/team/app{id}.git"),
        visibility: "private".to_string(),
        archived: false,
        forks_count: 0,
        default_branch: Some("main".to_string()),
        created_at: Some(ts(1)),
        last_activity_at: Some(ts(2)),
    }
}

pub fn group(id: i64) -> RemoteGroup {
    RemoteGroup {
        id,
        path: format!("group{id}"),
        parent_id: None,
        visibility: "private".to_string(),
    }
}

pub fn registry(id: i64, project_id: i64) -> RemoteRegistry {
    RemoteRegistry {
        id,
        project_id,
        path: format!("team/app{project_id}/img{id}"),
        name: format!("img{id}"),
        location: format!("registry.example.com/team/app{project_id}/img{id}"),
        created_at: Some(ts(1)),
    }
}

pub fn tag_ref(registry: &RemoteRegistry, name: &str) -> RemoteTagRef {
    RemoteTagRef {
        name: name.to_string(),
        path: format!("{}:{name}", registry.path),
        location: format!("{}:{name}", registry.location),
    }
}

pub fn member(id: i64, access_level: &str) -> RemoteMember {
    RemoteMember {
        id,
        username: format!("user{id}"),
        name: format!("User {id}"),
        state: "active".to_string(),
        locked: false,
        web_url: format!("https://git.example.com/user{id}"),
        access_level: access_level.to_string(),
    }
}

#[derive(Default)]
pub struct FakeProvider {
    pub bitbucket: bool,
    pub projects: BTreeMap<i64, RemoteProject>,
    pub groups: BTreeMap<i64, RemoteGroup>,
    pub ancestors: HashMap<i64, Vec<i64>>,
    pub registries: HashMap<i64, Vec<RemoteRegistry>>,
    pub tags: HashMap<i64, Vec<RemoteTagRef>>,
    pub members: HashMap<i64, Vec<RemoteMember>>,
    pub contributions: HashMap<i64, Vec<RemoteContribution>>,
    /// Reported by `top_project_id` instead of the highest listed id.
    pub top_project: Option<i64>,
    /// `top_project_id` answers with this HTTP status.
    pub top_project_status: Option<u16>,
    /// Registry ids whose tag listing fails.
    pub failing_tag_listings: HashSet<i64>,
    pub project_lookups: Mutex<Vec<i64>>,
    pub group_lookups: Mutex<Vec<i64>>,
    pub ancestor_calls: AtomicUsize,
    pub tag_details: AtomicUsize,
    pub registry_calls: Mutex<Vec<i64>>,
    pub member_calls: Mutex<Vec<i64>>,
}

impl FakeProvider {
    pub fn with_projects(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            projects: ids.into_iter().map(|id| (id, project(id))).collect(),
            ..Self::default()
        }
    }

    pub fn looked_up_projects(&self) -> Vec<i64> {
        sorted(&self.project_lookups)
    }

    pub fn looked_up_groups(&self) -> Vec<i64> {
        sorted(&self.group_lookups)
    }

    pub fn registries_listed_for(&self) -> Vec<i64> {
        sorted(&self.registry_calls)
    }

    pub fn members_listed_for(&self) -> Vec<i64> {
        sorted(&self.member_calls)
    }
}

fn sorted(calls: &Mutex<Vec<i64>>) -> Vec<i64> {
    let mut ids = calls.lock().unwrap().clone();
    ids.sort_unstable();
    ids
}

#[async_trait]
impl Provider for FakeProvider {
    fn kind(&self) -> VcsKind {
        if self.bitbucket {
            VcsKind::Bitbucket
        } else {
            VcsKind::GitLab
        }
    }

    fn supports_id_lookup(&self) -> bool {
        !self.bitbucket
    }

    fn groups(&self) -> ItemStream<'_, RemoteGroup> {
        stream::iter(self.groups.values().rev().cloned().map(Ok)).boxed()
    }

    async fn group(&self, id: i64) -> Result<Option<RemoteGroup>, ProviderError> {
        self.group_lookups.lock().unwrap().push(id);
        Ok(self.groups.get(&id).cloned())
    }

    fn projects(&self) -> ItemStream<'_, RemoteProject> {
        stream::iter(self.projects.values().rev().cloned().map(Ok)).boxed()
    }

    async fn project(&self, id: i64) -> Result<Option<RemoteProject>, ProviderError> {
        self.project_lookups.lock().unwrap().push(id);
        Ok(self.projects.get(&id).cloned())
    }

    async fn top_project_id(&self) -> Result<Option<i64>, ProviderError> {
        if let Some(status) = self.top_project_status {
            return Err(ProviderError::Status {
                status,
                url: "https://git.example.com/api/v4/projects".to_string(),
            });
        }
        Ok(self
            .top_project
            .or_else(|| self.projects.keys().next_back().copied()))
    }

    async fn project_ancestors(&self, project: &RemoteProject) -> Result<Vec<i64>, ProviderError> {
        self.ancestor_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .ancestors
            .get(&project.id)
            .cloned()
            .unwrap_or_else(|| vec![project.group_id]))
    }

    async fn registries(&self, project_id: i64) -> Result<Vec<RemoteRegistry>, ProviderError> {
        self.registry_calls.lock().unwrap().push(project_id);
        Ok(self.registries.get(&project_id).cloned().unwrap_or_default())
    }

    fn tags<'a>(&'a self, registry: &'a RemoteRegistry) -> ItemStream<'a, RemoteTagRef> {
        if self.failing_tag_listings.contains(&registry.id) {
            let err = ProviderError::Status {
                status: 502,
                url: registry.location.clone(),
            };
            return stream::iter([Err(err)]).boxed();
        }
        let tags = self.tags.get(&registry.id).cloned().unwrap_or_default();
        stream::iter(tags.into_iter().map(Ok)).boxed()
    }

    async fn tag(&self, registry: &RemoteRegistry, name: &str) -> Result<RemoteTag, ProviderError> {
        self.tag_details.fetch_add(1, Ordering::SeqCst);
        let Some(tag) = self
            .tags
            .get(&registry.id)
            .and_then(|tags| tags.iter().find(|t| t.name == name))
        else {
            return Err(ProviderError::NotFound {
                url: format!("{}:{name}", registry.location),
            });
        };
        Ok(RemoteTag {
            name: tag.name.clone(),
            path: tag.path.clone(),
            location: tag.location.clone(),
            digest: Some(format!("sha256:{name}")),
            revision: None,
            total_size: Some(1024),
            created_at: Some(ts(3)),
        })
    }

    async fn members(&self, project: &RemoteProject) -> Result<Vec<RemoteMember>, ProviderError> {
        self.member_calls.lock().unwrap().push(project.id);
        Ok(self.members.get(&project.id).cloned().unwrap_or_default())
    }

    async fn contributions(
        &self,
        project: &RemoteProject,
    ) -> Result<Vec<RemoteContribution>, ProviderError> {
        Ok(self.contributions.get(&project.id).cloned().unwrap_or_default())
    }

    async fn latest_commit_at(
        &self,
        _project: &RemoteProject,
    ) -> Result<Option<DateTime<Utc>>, ProviderError> {
        Ok(Some(ts(2)))
    }
}

/// Hands out pre-built providers by mnemonic; unknown mnemonics fail to connect.
#[derive(Default)]
pub struct FakeConnector {
    pub providers: HashMap<String, Arc<FakeProvider>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        settings: &InstanceSettings,
    ) -> Result<Arc<dyn Provider>, AdapterInitError> {
        match self.providers.get(&settings.mnemonic) {
            Some(provider) => Ok(provider.clone() as Arc<dyn Provider>),
            None => Err(AdapterInitError {
                url: settings.url.clone(),
                source: ProviderError::Forbidden {
                    url: settings.url.clone(),
                },
            }),
        }
    }
}

pub fn instance_settings(mnemonic: &str, kind: VcsKind) -> InstanceSettings {
    InstanceSettings {
        mnemonic: mnemonic.to_string(),
        url: format!("https://{mnemonic}.example.com"),
        kind,
        username: "bot".to_string(),
        token: "secret".to_string(),
        verify_ssl: true,
    }
}
