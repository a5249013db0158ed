//! Error types shared across the inventory and scan pipelines.
//!
//! Callers inspect these to decide how far a failure propagates: an
//! [`AdapterInitError`] skips one instance, a [`ScanConfigError`] stops the
//! whole scan run, a [`TargetError`] abandons a single scan target.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by provider adapters while talking to a VCS API.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("forbidden: {url}")]
    Forbidden { url: String },

    #[error("rate limited after retry: {url}")]
    RateLimited { url: String },

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("invalid API base url '{0}'")]
    InvalidUrl(String),

    #[error("operation not supported by this provider: {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Authentication against a VCS instance failed while building its adapter.
#[derive(Debug, Error)]
#[error("cannot initialise adapter for '{url}': {source}")]
pub struct AdapterInitError {
    pub url: String,
    #[source]
    pub source: ProviderError,
}

/// Invalid or incomplete `vcs-instances.yaml`.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file '{0}' not found")]
    NotFound(PathBuf),

    #[error("cannot read settings file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse settings file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },

    #[error("'{instance}': {field} not provided")]
    MissingField { instance: String, field: &'static str },

    #[error("'{instance}': unsupported VCS type '{value}'")]
    UnsupportedType { instance: String, value: String },
}

/// Configuration problems that make a whole scan run impossible.
#[derive(Debug, Error)]
pub enum ScanConfigError {
    #[error("no command registered to run '{0}'")]
    NoCommand(String),

    #[error("no parser registered for '{0}' reports")]
    NoParser(String),

    #[error("tool '{0}' is not installed")]
    ToolNotInstalled(String),

    #[error("tool config '{0}' not found")]
    ConfigMissing(PathBuf),

    #[error("SSH key '{0}' not found")]
    KeyMissing(PathBuf),
}

/// A single scan target could not be processed. The run continues.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unsupported clone url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("ssh clone url '{0}' requires a key")]
    MissingSshKey(String),

    #[error("git clone exited with {status}: {stderr}")]
    CloneFailed { status: String, stderr: String },

    #[error("scanner timed out after {0}s")]
    ScanTimeout(u64),

    #[error("scanner exited with {code:?} ({description}): {stderr}")]
    ScanFailed {
        code: Option<i32>,
        description: String,
        stderr: String,
    },

    #[error("cannot read report '{path}': {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse report: {0}")]
    Parse(String),

    #[error("{failed_chunks} finding chunk(s) failed to persist")]
    Persist { failed_chunks: usize },

    #[error("cannot record scan time: {0}")]
    MarkScanned(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
