//! Scanner report parsers. Each maps one tool's report format into
//! [`NewFinding`] rows keyed by a stable fingerprint.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::errors::TargetError;
use crate::models::NewFinding;
use crate::store::ScanTarget;

pub trait ReportParser: Send + Sync {
    fn tool(&self) -> &'static str;

    /// `clone_dir` is the scanned checkout; file paths are stored relative to it.
    fn parse(
        &self,
        report: &str,
        clone_dir: &Path,
        target: &ScanTarget,
        found_at: DateTime<Utc>,
    ) -> Result<Vec<NewFinding>, TargetError>;
}

pub fn parser_for(tool: &str) -> Option<Box<dyn ReportParser>> {
    match tool {
        "gitleaks" => Some(Box::new(GitleaksParser)),
        _ => None,
    }
}

/// Deterministic key for a finding without a native fingerprint.
pub fn derived_fingerprint(rule_id: &str, file_path: &str, line: i32) -> String {
    let digest = Sha256::digest(format!("{rule_id}:{file_path}:{line}").as_bytes());
    hex::encode(&digest[..16])
}

fn relative_path(file: &str, clone_dir: &Path) -> String {
    match Path::new(file).strip_prefix(clone_dir) {
        Ok(relative) => relative.display().to_string(),
        Err(_) => file.trim_start_matches('/').to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct GitleaksFinding {
    #[serde(rename = "RuleID", default)]
    rule_id: String,
    #[serde(rename = "Description", default)]
    description: String,
    #[serde(rename = "File", default)]
    file: String,
    #[serde(rename = "StartLine", default)]
    start_line: Option<i32>,
    #[serde(rename = "Commit", default)]
    commit: Option<String>,
    #[serde(rename = "Date", default)]
    date: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Author", default)]
    author: Option<String>,
    #[serde(rename = "Email", default)]
    email: Option<String>,
    #[serde(rename = "Entropy", default)]
    entropy: Option<f64>,
    #[serde(rename = "Secret", default)]
    secret: Option<String>,
    #[serde(rename = "Fingerprint", default)]
    fingerprint: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

pub struct GitleaksParser;

impl ReportParser for GitleaksParser {
    fn tool(&self) -> &'static str {
        "gitleaks"
    }

    fn parse(
        &self,
        report: &str,
        clone_dir: &Path,
        target: &ScanTarget,
        found_at: DateTime<Utc>,
    ) -> Result<Vec<NewFinding>, TargetError> {
        if report.trim().is_empty() {
            return Ok(Vec::new());
        }
        // an empty gitleaks report is the JSON literal `null`
        let entries: Option<Vec<GitleaksFinding>> =
            serde_json::from_str(report).map_err(|e| TargetError::Parse(e.to_string()))?;

        let mut findings: Vec<NewFinding> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for entry in entries.unwrap_or_default() {
            let file_path = relative_path(&entry.file, clone_dir);
            let line = entry.start_line.unwrap_or(0);
            let fingerprint = non_empty(entry.fingerprint)
                .unwrap_or_else(|| derived_fingerprint(&entry.rule_id, &file_path, line));
            let commit_date = entry
                .date
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc));

            let finding = NewFinding {
                vcs_instance_id: target.vcs_instance_id,
                repo_id: target.vcs_id,
                tool: self.tool().to_string(),
                rule_id: entry.rule_id,
                title: entry.description,
                fingerprint: fingerprint.clone(),
                cwe: Some(798),
                severity: "High".to_string(),
                author: non_empty(entry.author),
                email: non_empty(entry.email),
                file_path,
                line,
                commit: non_empty(entry.commit),
                commit_date,
                commit_message: non_empty(entry.message),
                found_date: found_at,
                entropy: entry.entropy,
                secret: entry.secret,
            };
            match positions.get(&fingerprint) {
                Some(&index) => findings[index] = finding,
                None => {
                    positions.insert(fingerprint, findings.len());
                    findings.push(finding);
                }
            }
        }
        Ok(findings)
    }
}
