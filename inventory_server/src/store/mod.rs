//! Persistence gateway.
//!
//! `InventoryStore` is the storage boundary (PostgreSQL in production, an
//! in-memory map for dry runs and tests). `Gateway` sits on top of it and owns
//! the write contract: dedup by natural key, fixed-size chunks, one failed
//! chunk never aborts the rest.

pub mod memory;
pub mod postgres;

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    dedup_by_key, NewContributor, NewFinding, NewGroup, NewImage, NewRegistry, NewRepository,
    NewRepositoryMember, NewUser, NewVcsInstance, Upsertable, VcsInstance,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Which repositories a scan run selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanFilter {
    /// Never scanned, or active since the last scan.
    #[default]
    Default,
    /// Every repository of the instance.
    Force,
}

impl FromStr for ScanFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "force" => Ok(Self::Force),
            other => Err(format!("unknown filter '{other}' (expected 'default' or 'force')")),
        }
    }
}

impl ScanFilter {
    /// Eligibility of one repository under this filter.
    pub fn selects(
        &self,
        last_activity: DateTime<Utc>,
        last_scanned: Option<DateTime<Utc>>,
    ) -> bool {
        match self {
            Self::Force => true,
            Self::Default => last_scanned.is_none_or(|scanned| last_activity > scanned),
        }
    }
}

/// Locally stored view of a project, used to skip hierarchy lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProject {
    pub path: String,
    pub parents: Option<Vec<i64>>,
}

/// Remote project id → stored path and parent chain, per instance.
pub type ProjectIndex = HashMap<i64, StoredProject>;

/// One repository selected for scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub vcs_id: i64,
    pub git_url: String,
    pub vcs_instance_id: i64,
}

/// A homogeneous chunk of rows for one entity table.
#[derive(Debug, Clone)]
pub enum UpsertBatch {
    Groups(Vec<NewGroup>),
    Repositories(Vec<NewRepository>),
    Registries(Vec<NewRegistry>),
    Images(Vec<NewImage>),
    Users(Vec<NewUser>),
    Members(Vec<NewRepositoryMember>),
    Contributors(Vec<NewContributor>),
    Findings(Vec<NewFinding>),
}

impl UpsertBatch {
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Groups(_) => NewGroup::ENTITY,
            Self::Repositories(_) => NewRepository::ENTITY,
            Self::Registries(_) => NewRegistry::ENTITY,
            Self::Images(_) => NewImage::ENTITY,
            Self::Users(_) => NewUser::ENTITY,
            Self::Members(_) => NewRepositoryMember::ENTITY,
            Self::Contributors(_) => NewContributor::ENTITY,
            Self::Findings(_) => NewFinding::ENTITY,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Groups(rows) => rows.len(),
            Self::Repositories(rows) => rows.len(),
            Self::Registries(rows) => rows.len(),
            Self::Images(rows) => rows.len(),
            Self::Users(rows) => rows.len(),
            Self::Members(rows) => rows.len(),
            Self::Contributors(rows) => rows.len(),
            Self::Findings(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage backend boundary.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Insert the instance row if its url is unknown. Returns the stored row
    /// and whether it was created.
    async fn ensure_instance(&self, instance: NewVcsInstance)
        -> anyhow::Result<(VcsInstance, bool)>;

    async fn instances(&self) -> anyhow::Result<Vec<VcsInstance>>;

    /// Highest stored remote project id for the instance.
    async fn last_project_id(&self, instance_id: i64) -> anyhow::Result<Option<i64>>;

    /// Highest stored remote group id for the instance.
    async fn last_group_id(&self, instance_id: i64) -> anyhow::Result<Option<i64>>;

    async fn project_index(&self, instance_id: i64) -> anyhow::Result<ProjectIndex>;

    /// Image paths already recorded for a registry.
    async fn image_paths(
        &self,
        instance_id: i64,
        repo_id: i64,
        registry_id: i64,
    ) -> anyhow::Result<HashSet<String>>;

    async fn scan_targets(
        &self,
        instance_id: i64,
        filter: ScanFilter,
    ) -> anyhow::Result<Vec<ScanTarget>>;

    async fn mark_scanned(
        &self,
        instance_id: i64,
        repo_id: i64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Write every chunk over a single connection. The outer error means no
    /// chunk was attempted; inner results are per chunk, in order.
    async fn upsert_chunks(
        &self,
        chunks: Vec<UpsertBatch>,
    ) -> anyhow::Result<Vec<anyhow::Result<usize>>>;
}

/// Result of one gateway upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub written: usize,
    pub failed_chunks: usize,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed_chunks == 0
    }
}

#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn InventoryStore>,
    chunk_size: usize,
}

impl Gateway {
    pub fn new(store: Arc<dyn InventoryStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    /// Idempotent batched upsert of one entity type.
    pub async fn upsert<T: Upsertable>(&self, rows: Vec<T>) -> UpsertReport {
        let unique = dedup_by_key(rows);
        if unique.is_empty() {
            return UpsertReport::default();
        }

        let chunks: Vec<UpsertBatch> = unique
            .chunks(self.chunk_size)
            .map(|chunk| T::into_batch(chunk.to_vec()))
            .collect();
        let total_chunks = chunks.len();

        let results = match self.store.upsert_chunks(chunks).await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(entity = T::ENTITY, error = %e, "Upsert could not start");
                for _ in 0..total_chunks {
                    crate::metrics::chunk_failed(T::ENTITY);
                }
                return UpsertReport {
                    written: 0,
                    failed_chunks: total_chunks,
                };
            }
        };

        let mut report = UpsertReport::default();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(written) => report.written += written,
                Err(e) => {
                    report.failed_chunks += 1;
                    crate::metrics::chunk_failed(T::ENTITY);
                    tracing::error!(
                        entity = T::ENTITY,
                        chunk = index,
                        chunks = total_chunks,
                        error = %e,
                        "Upsert chunk failed"
                    );
                }
            }
        }
        crate::metrics::rows_upserted(T::ENTITY, report.written);
        tracing::debug!(
            entity = T::ENTITY,
            written = report.written,
            failed_chunks = report.failed_chunks,
            "Upsert finished"
        );
        report
    }
}
