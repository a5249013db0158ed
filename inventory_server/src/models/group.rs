//! groups: Namespaces (GitLab groups, Bitbucket projects).

use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::providers::RemoteGroup;
use crate::schema::groups;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = groups)]
pub struct NewGroup {
    pub vcs_instance_id: i64,
    pub vcs_id: i64,
    pub parent_id: Option<i64>,
    pub path: String,
    pub visibility: String,
}

impl NewGroup {
    pub fn from_remote(instance_id: i64, group: &RemoteGroup) -> Self {
        Self {
            vcs_instance_id: instance_id,
            vcs_id: group.id,
            parent_id: group.parent_id,
            path: group.path.clone(),
            visibility: group.visibility.clone(),
        }
    }
}

impl Upsertable for NewGroup {
    type Key = (i64, i64);
    const ENTITY: &'static str = "group";

    fn natural_key(&self) -> Self::Key {
        (self.vcs_instance_id, self.vcs_id)
    }

    fn merge_into(self, existing: &mut Self) {
        existing.path = self.path;
        existing.parent_id = self.parent_id;
        existing.visibility = self.visibility;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Groups(rows)
    }
}
