//! VCS instance settings: loaded from `vcs-instances.yaml`.
//!
//! ```yaml
//! main-gitlab:
//!   - URL: https://gitlab.example.com
//!   - TYPE: gitlab
//!   - USERNAME: inventory-bot
//!   - PAT: glpat-xxxx
//!   - VERIFY_SSL: false
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde_yml::Value;

use crate::errors::SettingsError;
use crate::models::{NewVcsInstance, VcsKind};

pub const DEFAULT_SETTINGS_FILE: &str = "vcs-instances.yaml";

const REQUIRED_FIELDS: [&str; 4] = ["URL", "TYPE", "USERNAME", "PAT"];

#[derive(Clone)]
pub struct InstanceSettings {
    pub mnemonic: String,
    pub url: String,
    pub kind: VcsKind,
    pub username: String,
    pub token: String,
    pub verify_ssl: bool,
}

impl fmt::Debug for InstanceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceSettings")
            .field("mnemonic", &self.mnemonic)
            .field("url", &self.url)
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("token", &"***")
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}

impl InstanceSettings {
    pub fn to_new_instance(&self) -> NewVcsInstance {
        NewVcsInstance {
            url: self.url.clone(),
            vcs_type: self.kind.as_str().to_string(),
            mnemonic: self.mnemonic.clone(),
        }
    }
}

/// All configured instances, keyed by mnemonic.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    instances: BTreeMap<String, InstanceSettings>,
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Settings {
    /// Read and validate the settings file. Any problem is fatal.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        tracing::info!(path = %path.display(), "Parsing VCS instances...");
        if !path.is_file() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::parse(path, &text)?;
        tracing::info!(
            path = %path.display(),
            instances = settings.len(),
            "Settings processed successfully"
        );
        Ok(settings)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, SettingsError> {
        let raw: BTreeMap<String, Vec<BTreeMap<String, Value>>> =
            serde_yml::from_str(text).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut instances = BTreeMap::new();
        for (mnemonic, items) in raw {
            // a list of single-key maps collapses into one map
            let fields: BTreeMap<String, Value> = items.into_iter().flatten().collect();
            let field = |name: &'static str| -> Result<String, SettingsError> {
                fields
                    .get(name)
                    .and_then(scalar)
                    .ok_or_else(|| SettingsError::MissingField {
                        instance: mnemonic.clone(),
                        field: name,
                    })
            };
            for name in REQUIRED_FIELDS {
                field(name)?;
            }

            let vcs_type = field("TYPE")?;
            let kind = vcs_type
                .parse::<VcsKind>()
                .map_err(|_| SettingsError::UnsupportedType {
                    instance: mnemonic.clone(),
                    value: vcs_type.clone(),
                })?;
            let verify_ssl = fields
                .get("VERIFY_SSL")
                .and_then(scalar)
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true);

            tracing::debug!(instance = %mnemonic, vcs = %kind, "Instance settings accepted");
            let settings = InstanceSettings {
                mnemonic: mnemonic.clone(),
                url: field("URL")?,
                kind,
                username: field("USERNAME")?,
                token: field("PAT")?,
                verify_ssl,
            };
            instances.insert(mnemonic, settings);
        }

        Ok(Self { instances })
    }

    pub fn get(&self, mnemonic: &str) -> Option<&InstanceSettings> {
        self.instances.get(mnemonic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceSettings> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    #[cfg(test)]
    pub fn from_instances(list: Vec<InstanceSettings>) -> Self {
        Self {
            instances: list.into_iter().map(|i| (i.mnemonic.clone(), i)).collect(),
        }
    }
}
