//! contributors: Commit statistics aggregated per author email.

use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::schema::contributors;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = contributors)]
pub struct NewContributor {
    pub vcs_instance_id: i64,
    pub repo_id: i64,
    pub email: String,
    pub commits: i64,
    pub additions: i64,
    pub deletions: i64,
}

impl Upsertable for NewContributor {
    type Key = (i64, i64, String);
    const ENTITY: &'static str = "contributor";

    fn natural_key(&self) -> Self::Key {
        (self.vcs_instance_id, self.repo_id, self.email.clone())
    }

    fn merge_into(self, existing: &mut Self) {
        existing.commits = self.commits;
        existing.additions = self.additions;
        existing.deletions = self.deletions;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Contributors(rows)
    }
}
