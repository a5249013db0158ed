//! images: One row per resolved registry tag.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::providers::{RemoteRegistry, RemoteTag};
use crate::schema::images;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = images)]
pub struct NewImage {
    pub vcs_instance_id: i64,
    /// Full image locator, e.g. `registry.example.com/group/app:1.2`.
    pub image: String,
    pub repo_id: i64,
    pub registry_id: i64,
    pub path: String,
    pub tag: String,
    pub digest: Option<String>,
    pub revision: Option<String>,
    pub total_size: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_time_checked: DateTime<Utc>,
}

impl NewImage {
    pub fn from_remote(
        instance_id: i64,
        registry: &RemoteRegistry,
        tag: &RemoteTag,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            vcs_instance_id: instance_id,
            image: tag.location.clone(),
            repo_id: registry.project_id,
            registry_id: registry.id,
            path: tag.path.clone(),
            tag: tag.name.clone(),
            digest: tag.digest.clone(),
            revision: tag.revision.clone(),
            total_size: tag.total_size,
            created_at: tag.created_at,
            last_time_checked: checked_at,
        }
    }
}

impl Upsertable for NewImage {
    type Key = (i64, String, i64, i64);
    const ENTITY: &'static str = "image";

    fn natural_key(&self) -> Self::Key {
        (
            self.vcs_instance_id,
            self.image.clone(),
            self.repo_id,
            self.registry_id,
        )
    }

    fn merge_into(self, existing: &mut Self) {
        existing.path = self.path;
        existing.tag = self.tag;
        existing.digest = self.digest;
        existing.revision = self.revision;
        existing.total_size = self.total_size;
        existing.created_at = self.created_at;
        existing.last_time_checked = self.last_time_checked;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Images(rows)
    }
}
