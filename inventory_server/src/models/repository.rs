//! repositories: Inventoried projects. `last_time_scanned` is owned by the
//! scan pipeline and never written by an inventory upsert.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::providers::RemoteProject;
use crate::schema::repositories;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = repositories)]
pub struct NewRepository {
    pub vcs_instance_id: i64,
    pub vcs_id: i64,
    pub path: String,
    pub group_id: i64,
    pub parents: Option<Vec<i64>>,
    pub web_url: String,
    pub git_url: String,
    pub forks_count: i32,
    pub created: Option<DateTime<Utc>>,
    pub default_branch: Option<String>,
    pub visibility: String,
    pub is_archived: bool,
    pub last_activity: DateTime<Utc>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub last_time_checked: DateTime<Utc>,
}

/// Values resolved around a project listing entry before it can be stored.
#[derive(Debug, Clone, Default)]
pub struct ProjectObservation {
    pub parents: Option<Vec<i64>>,
    pub default_branch: Option<String>,
    pub last_commit_at: Option<DateTime<Utc>>,
}

impl NewRepository {
    /// Map a listed project. Platforms that report no activity timestamp fall
    /// back to the latest commit, then to the epoch, so the row stays
    /// scan-eligible.
    pub fn from_remote(
        instance_id: i64,
        project: &RemoteProject,
        observed: ProjectObservation,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let last_activity = project
            .last_activity_at
            .or(observed.last_commit_at)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Self {
            vcs_instance_id: instance_id,
            vcs_id: project.id,
            path: project.path.clone(),
            group_id: project.group_id,
            parents: observed.parents,
            web_url: project.web_url.clone(),
            git_url: project.git_url.clone(),
            forks_count: project.forks_count,
            created: project.created_at,
            default_branch: observed.default_branch.or_else(|| project.default_branch.clone()),
            visibility: project.visibility.clone(),
            is_archived: project.archived,
            last_activity,
            last_commit_at: observed.last_commit_at,
            last_time_checked: checked_at,
        }
    }
}

impl Upsertable for NewRepository {
    type Key = (i64, i64);
    const ENTITY: &'static str = "repository";

    fn natural_key(&self) -> Self::Key {
        (self.vcs_instance_id, self.vcs_id)
    }

    fn merge_into(self, existing: &mut Self) {
        existing.path = self.path;
        existing.group_id = self.group_id;
        existing.parents = self.parents;
        existing.web_url = self.web_url;
        existing.git_url = self.git_url;
        existing.forks_count = self.forks_count;
        existing.default_branch = self.default_branch;
        existing.visibility = self.visibility;
        existing.is_archived = self.is_archived;
        existing.last_activity = self.last_activity;
        existing.last_commit_at = self.last_commit_at;
        existing.last_time_checked = self.last_time_checked;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Repositories(rows)
    }
}
