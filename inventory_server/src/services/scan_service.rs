//! Scan pipeline: select targets, clone, run the scanner, parse its report,
//! persist findings.
//!
//! A target that fails at any stage is abandoned and the run moves on. The
//! working directory of a target is removed on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::process::Command;

use crate::errors::{ScanConfigError, TargetError};
use crate::models::VcsInstance;
use crate::services::clone_service::{redact, CloneAuth, Cloner};
use crate::services::report_parser::{parser_for, ReportParser};
use crate::services::scan_tools::{self, ExitClass, ToolSpec};
use crate::settings::Settings;
use crate::store::{Gateway, ScanFilter, ScanTarget};

/// Resolve a tool name to its command and parser.
pub fn resolve_tool(
    name: &str,
) -> Result<(&'static ToolSpec, Box<dyn ReportParser>), ScanConfigError> {
    let tool = scan_tools::lookup(name).ok_or_else(|| ScanConfigError::NoCommand(name.to_string()))?;
    let parser = parser_for(name).ok_or_else(|| ScanConfigError::NoParser(name.to_string()))?;
    Ok((tool, parser))
}

/// Checks that must pass before any target is touched.
pub fn preflight(
    tool: &ToolSpec,
    config: &Path,
    ssh_key: Option<&Path>,
) -> Result<(), ScanConfigError> {
    let binary = scan_tools::tool_path(tool.binary)
        .ok_or_else(|| ScanConfigError::ToolNotInstalled(tool.binary.to_string()))?;
    tracing::info!(tool = tool.name, binary = %binary.display(), "Scanner found");
    if !config.exists() {
        return Err(ScanConfigError::ConfigMissing(config.to_path_buf()));
    }
    if let Some(key) = ssh_key {
        if !key.exists() {
            return Err(ScanConfigError::KeyMissing(key.to_path_buf()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub config: PathBuf,
    pub ssh_key: Option<PathBuf>,
    pub work_root: PathBuf,
    pub timeout: Duration,
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub targets: usize,
    pub persisted: usize,
    pub aborted: usize,
    pub findings: usize,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.targets += other.targets;
        self.persisted += other.persisted;
        self.aborted += other.aborted;
        self.findings += other.findings;
    }
}

/// `<work_root>/<host>/<remote id>`, removed when dropped.
struct WorkDir {
    path: PathBuf,
    removed: bool,
}

impl WorkDir {
    async fn create(root: &Path, host: &str, vcs_id: i64) -> std::io::Result<Self> {
        let path = root.join(host).join(vcs_id.to_string());
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn_not_removed(&self.path, e);
        }
    }
}

fn warn_not_removed(path: &Path, e: std::io::Error) {
    if e.kind() != std::io::ErrorKind::NotFound {
        tracing::warn!(dir = %path.display(), error = %e, "Cannot remove working directory");
    }
}

// Only reached when the scan future is dropped before `remove` runs.
impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn_not_removed(&self.path, e);
            }
        }
    }
}

/// SIGKILL every process left in the scanner's process group.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: killpg takes no pointers; the group id is the pid of a child
    // spawned as its own group leader.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, error = %e, "Cannot kill scanner process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

pub struct ScanRun {
    tool: ToolSpec,
    parser: Box<dyn ReportParser>,
    options: ScanOptions,
    cloner: Arc<dyn Cloner>,
    gateway: Gateway,
}

impl ScanRun {
    pub fn new(
        tool: ToolSpec,
        parser: Box<dyn ReportParser>,
        options: ScanOptions,
        cloner: Arc<dyn Cloner>,
        gateway: Gateway,
    ) -> Self {
        Self {
            tool,
            parser,
            options,
            cloner,
            gateway,
        }
    }

    /// Scan every registered instance that is still configured.
    pub async fn run_all(&self, settings: &Settings, filter: ScanFilter) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary::default();
        for instance in self.gateway.store().instances().await? {
            let Some(instance_settings) = settings.get(&instance.mnemonic) else {
                tracing::error!(instance = %instance.mnemonic, "Instance is not configured in settings, skipping");
                continue;
            };
            let auth = CloneAuth {
                username: instance_settings.username.clone(),
                token: instance_settings.token.clone(),
                ssh_key: self.options.ssh_key.clone(),
            };
            summary.merge(self.run_instance(&instance, &auth, filter).await?);
        }
        tracing::info!(
            tool = self.tool.name,
            targets = summary.targets,
            persisted = summary.persisted,
            aborted = summary.aborted,
            findings = summary.findings,
            "Scan run finished"
        );
        Ok(summary)
    }

    pub async fn run_instance(
        &self,
        instance: &VcsInstance,
        auth: &CloneAuth,
        filter: ScanFilter,
    ) -> anyhow::Result<RunSummary> {
        let targets = self
            .gateway
            .store()
            .scan_targets(instance.id, filter)
            .await?;
        tracing::info!(
            instance = %instance.mnemonic,
            targets = targets.len(),
            ?filter,
            "Repositories selected for scanning"
        );

        let host = instance.host().to_string();
        let outcomes: Vec<Result<usize, TargetError>> = stream::iter(targets.iter())
            .map(|target| self.scan_logged(&host, target, auth))
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        let mut summary = RunSummary {
            targets: outcomes.len(),
            ..RunSummary::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(findings) => {
                    summary.persisted += 1;
                    summary.findings += findings;
                }
                Err(_) => summary.aborted += 1,
            }
        }
        Ok(summary)
    }

    async fn scan_logged(
        &self,
        host: &str,
        target: &ScanTarget,
        auth: &CloneAuth,
    ) -> Result<usize, TargetError> {
        let started = Instant::now();
        let result = self.scan_target(host, target, auth).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(findings) => {
                crate::metrics::scan_target_finished("persisted", elapsed_ms);
                tracing::info!(repo = target.vcs_id, findings, elapsed_ms, "Target scanned");
            }
            Err(e) => {
                crate::metrics::scan_target_finished("aborted", elapsed_ms);
                tracing::error!(
                    repo = target.vcs_id,
                    url = %redact(&target.git_url),
                    error = %e,
                    elapsed_ms,
                    "Target aborted"
                );
            }
        }
        result
    }

    /// Clone, scan, parse, persist. Returns the number of stored findings.
    pub async fn scan_target(
        &self,
        host: &str,
        target: &ScanTarget,
        auth: &CloneAuth,
    ) -> Result<usize, TargetError> {
        let dir = WorkDir::create(&self.options.work_root, host, target.vcs_id).await?;
        let result = self.scan_in(dir.path(), target, auth).await;
        dir.remove().await;
        result
    }

    async fn scan_in(
        &self,
        dir: &Path,
        target: &ScanTarget,
        auth: &CloneAuth,
    ) -> Result<usize, TargetError> {
        self.cloner.clone_repo(&target.git_url, dir, auth).await?;
        self.run_scanner(dir).await?;

        let report_path = dir.join(self.tool.report_name);
        let report = tokio::fs::read_to_string(&report_path)
            .await
            .map_err(|source| TargetError::Report {
                path: report_path.clone(),
                source,
            })?;
        let findings = self.parser.parse(&report, dir, target, Utc::now())?;
        let count = findings.len();
        tracing::debug!(repo = target.vcs_id, findings = count, "Report parsed");

        let upsert = self.gateway.upsert(findings).await;
        if !upsert.is_complete() {
            return Err(TargetError::Persist {
                failed_chunks: upsert.failed_chunks,
            });
        }
        crate::metrics::findings_stored(self.tool.name, count);

        self.gateway
            .store()
            .mark_scanned(target.vcs_instance_id, target.vcs_id, Utc::now())
            .await
            .map_err(|e| TargetError::MarkScanned(e.to_string()))?;
        Ok(count)
    }

    async fn run_scanner(&self, dir: &Path) -> Result<(), TargetError> {
        let argv = self.tool.command_line(&self.options.config, dir, dir);
        let Some((program, args)) = argv.split_first() else {
            return Err(TargetError::ScanFailed {
                code: None,
                description: "empty command".to_string(),
                stderr: String::new(),
            });
        };
        tracing::info!(tool = self.tool.name, command = %argv.join(" "), "Running scanner");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id();
        let output = match tokio::time::timeout(self.options.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                kill_process_group(pid);
                return Err(TargetError::ScanTimeout(self.options.timeout.as_secs()));
            }
        };

        let code = output.status.code();
        match self.tool.classify(code) {
            ExitClass::Success(description) => {
                tracing::debug!(tool = self.tool.name, ?code, description, "Scanner finished");
                Ok(())
            }
            ExitClass::Failure(description) => Err(TargetError::ScanFailed {
                code,
                description: description.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            ExitClass::Unknown => Err(TargetError::ScanFailed {
                code,
                description: "unknown exit status".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}
