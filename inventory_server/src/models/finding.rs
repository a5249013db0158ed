//! findings: Secrets reported by a scanner, deduplicated by fingerprint.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use super::Upsertable;
use crate::schema::findings;
use crate::store::UpsertBatch;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = findings)]
pub struct NewFinding {
    pub vcs_instance_id: i64,
    pub repo_id: i64,
    pub tool: String,
    pub rule_id: String,
    pub title: String,
    pub fingerprint: String,
    pub cwe: Option<i32>,
    pub severity: String,
    pub author: Option<String>,
    pub email: Option<String>,
    pub file_path: String,
    pub line: i32,
    pub commit: Option<String>,
    pub commit_date: Option<DateTime<Utc>>,
    pub commit_message: Option<String>,
    pub found_date: DateTime<Utc>,
    pub entropy: Option<f64>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
}

impl Upsertable for NewFinding {
    type Key = (i64, i64, String);
    const ENTITY: &'static str = "finding";

    fn natural_key(&self) -> Self::Key {
        (self.vcs_instance_id, self.repo_id, self.fingerprint.clone())
    }

    fn merge_into(self, existing: &mut Self) {
        existing.author = self.author;
        existing.commit = self.commit;
        existing.commit_date = self.commit_date;
        existing.email = self.email;
        existing.found_date = self.found_date;
    }

    fn into_batch(rows: Vec<Self>) -> UpsertBatch {
        UpsertBatch::Findings(rows)
    }
}
