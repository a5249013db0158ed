//! vcs_instances: One configured platform endpoint. Created once at startup.

use std::fmt;
use std::str::FromStr;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::vcs_instances;

/// Supported platform families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    GitLab,
    Bitbucket,
}

impl VcsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitLab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }
}

impl fmt::Display for VcsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VcsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gitlab" => Ok(Self::GitLab),
            "bitbucket" => Ok(Self::Bitbucket),
            other => Err(format!("unsupported VCS type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize)]
#[diesel(table_name = vcs_instances)]
pub struct VcsInstance {
    pub id: i64,
    pub url: String,
    pub vcs_type: String,
    pub mnemonic: String,
}

impl VcsInstance {
    pub fn kind(&self) -> Result<VcsKind, String> {
        self.vcs_type.parse()
    }

    /// Host part of the url (`https://git.example.com/` → `git.example.com`),
    /// used to scope scan working directories per instance.
    pub fn host(&self) -> &str {
        self.url
            .split("//")
            .last()
            .unwrap_or(&self.url)
            .trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = vcs_instances)]
pub struct NewVcsInstance {
    pub url: String,
    pub vcs_type: String,
    pub mnemonic: String,
}
