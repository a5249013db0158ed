//! repository_users: Repository membership with a role attribute.

use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::providers::RemoteMember;
use crate::schema::repository_users;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = repository_users)]
pub struct NewRepositoryMember {
    pub vcs_instance_id: i64,
    pub repo_id: i64,
    pub user_id: i64,
    pub access_level: String,
}

impl NewRepositoryMember {
    pub fn from_remote(instance_id: i64, repo_id: i64, member: &RemoteMember) -> Self {
        Self {
            vcs_instance_id: instance_id,
            repo_id,
            user_id: member.id,
            access_level: member.access_level.clone(),
        }
    }
}

impl Upsertable for NewRepositoryMember {
    type Key = (i64, i64, i64, String);
    const ENTITY: &'static str = "repository_user";

    fn natural_key(&self) -> Self::Key {
        (
            self.vcs_instance_id,
            self.repo_id,
            self.user_id,
            self.access_level.clone(),
        )
    }

    fn merge_into(self, existing: &mut Self) {
        existing.access_level = self.access_level;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Members(rows)
    }
}
