//! registries: Container registries attached to a repository.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::providers::RemoteRegistry;
use crate::schema::registries;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = registries)]
pub struct NewRegistry {
    pub vcs_instance_id: i64,
    pub vcs_id: i64,
    pub repo_id: i64,
    pub path: String,
    pub name: String,
    pub location: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_time_checked: DateTime<Utc>,
}

impl NewRegistry {
    pub fn from_remote(instance_id: i64, registry: &RemoteRegistry, checked_at: DateTime<Utc>) -> Self {
        // `group/project/image` → `image`
        let name = registry
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&registry.path)
            .to_string();

        Self {
            vcs_instance_id: instance_id,
            vcs_id: registry.id,
            repo_id: registry.project_id,
            path: registry.path.clone(),
            name,
            location: registry.location.clone(),
            created_at: registry.created_at,
            last_time_checked: checked_at,
        }
    }
}

impl Upsertable for NewRegistry {
    type Key = (i64, i64, i64);
    const ENTITY: &'static str = "registry";

    fn natural_key(&self) -> Self::Key {
        (self.vcs_instance_id, self.vcs_id, self.repo_id)
    }

    fn merge_into(self, existing: &mut Self) {
        existing.path = self.path;
        existing.name = self.name;
        existing.location = self.location;
        existing.last_time_checked = self.last_time_checked;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Registries(rows)
    }
}
