//! users: Account-level identities, independent of membership.

use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::providers::RemoteMember;
use crate::schema::users;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub vcs_instance_id: i64,
    pub vcs_id: i64,
    pub username: String,
    pub name: String,
    pub state: String,
    pub locked: bool,
    pub web_url: String,
}

impl NewUser {
    pub fn from_remote(instance_id: i64, member: &RemoteMember) -> Self {
        Self {
            vcs_instance_id: instance_id,
            vcs_id: member.id,
            username: member.username.clone(),
            name: member.name.clone(),
            state: member.state.clone(),
            locked: member.locked,
            web_url: member.web_url.clone(),
        }
    }
}

impl Upsertable for NewUser {
    type Key = (i64, i64);
    const ENTITY: &'static str = "user";

    fn natural_key(&self) -> Self::Key {
        (self.vcs_instance_id, self.vcs_id)
    }

    fn merge_into(self, existing: &mut Self) {
        existing.username = self.username;
        existing.name = self.name;
        existing.state = self.state;
        existing.locked = self.locked;
        existing.web_url = self.web_url;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Users(rows)
    }
}
