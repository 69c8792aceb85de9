/*!
Snapshot capture pipeline and snapshot reader.

One capture cycle crawls a tenant's workspace, builds the manifest, serializes
and compresses the item tree, and replicates both artifacts through the
redundant storage layer. The cycle always ends in a [`SnapshotRecord`] handed
to a [`ResultRecorder`]; a cycle that stored nothing is never recorded as
`Completed`.

Artifacts live at deterministic paths:

- `{tenant}/{snapshot}.data`: compressed container of metadata plus items
- `{tenant}/{snapshot}.manifest`: compressed manifest

The data artifact is written first and the manifest second, so a listed
manifest always has its data behind it.
*/

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::config::{PipelineConfig, ReplicationRole};
use crate::crawler::{CrawlOutcome, Crawler, PartialFailure};
use crate::error::BackendFailure;
use crate::manifest::{Manifest, ManifestBuilder};
use crate::metadata::{compute_hash, METADATA_FORMAT_VERSION};
use crate::model::{flatten_all, WorkspaceItem};
use crate::observability;
use crate::storage::{BackendStatus, RedundantStorageAdapter, ReplicationReport, StorageAdapter};
use crate::{FolioError, Result, SnapshotMetadata};

const MAX_ID_LEN: usize = 128;

/// Container stored in the data artifact
///
/// `items` is generic so the pipeline can serialize a borrowed slice while the
/// reader deserializes an owned vector.
#[derive(Serialize, Deserialize, Debug)]
struct SnapshotContainer<I> {
    metadata: SnapshotMetadata,
    items: I,
}

fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(FolioError::validation(format!("{field} cannot be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(FolioError::validation(format!("{field} is longer than {MAX_ID_LEN} characters")));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(FolioError::validation(format!(
            "{field} '{value}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// Request to capture one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTrigger {
    pub tenant_id: String,
    pub requested_at: DateTime<Utc>,
    /// Caller-chosen snapshot id; generated when absent
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

impl SnapshotTrigger {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            requested_at: Utc::now(),
            snapshot_id: None,
        }
    }

    pub fn with_snapshot_id(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_requested_at(mut self, requested_at: DateTime<Utc>) -> Self {
        self.requested_at = requested_at;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("tenant_id", &self.tenant_id)?;
        if let Some(snapshot_id) = &self.snapshot_id {
            validate_id("snapshot_id", snapshot_id)?;
        }
        Ok(())
    }

    /// The snapshot id to use: the requested one, or a fresh UUIDv4
    pub fn resolve_snapshot_id(&self) -> String {
        self.snapshot_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// Storage paths of one snapshot's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub data: String,
    pub manifest: String,
}

impl SnapshotPaths {
    pub const DATA_SUFFIX: &'static str = ".data";
    pub const MANIFEST_SUFFIX: &'static str = ".manifest";

    pub fn new(tenant_id: &str, snapshot_id: &str) -> Self {
        Self {
            data: format!("{tenant_id}/{snapshot_id}{}", Self::DATA_SUFFIX),
            manifest: format!("{tenant_id}/{snapshot_id}{}", Self::MANIFEST_SUFFIX),
        }
    }

    /// Validate both ids, then build the paths
    pub fn checked(tenant_id: &str, snapshot_id: &str) -> Result<Self> {
        validate_id("tenant_id", tenant_id)?;
        validate_id("snapshot_id", snapshot_id)?;
        Ok(Self::new(tenant_id, snapshot_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    Completed,
    Failed,
}

/// Conditions on a cycle that need operator attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFlag {
    /// The crawl returned no items and no errors; nothing was stored
    EmptyWorkspace,
    /// Some subtrees could not be crawled
    PartialCrawl,
    /// At least one backend missed an artifact
    PartialReplication,
    /// The crawl budget ran out before the tree was fully loaded
    CrawlDeadline,
}

/// Durable outcome of one capture cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub tenant_id: String,
    pub requested_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    #[serde(default)]
    pub flags: Vec<SnapshotFlag>,
    /// SHA-256 of the compressed data artifact
    pub content_digest: Option<String>,
    /// Size of the compressed data artifact
    pub size_bytes: u64,
    pub item_count: usize,
    pub manifest_path: String,
    pub data_path: String,
    #[serde(default)]
    pub per_backend_status: Vec<BackendStatus>,
    #[serde(default)]
    pub partial_failures: Vec<PartialFailure>,
    pub error: Option<String>,
}

impl SnapshotRecord {
    fn pending(trigger: &SnapshotTrigger, snapshot_id: &str, paths: &SnapshotPaths) -> Self {
        Self {
            snapshot_id: snapshot_id.to_string(),
            tenant_id: trigger.tenant_id.clone(),
            requested_at: trigger.requested_at,
            finished_at: trigger.requested_at,
            status: SnapshotStatus::Failed,
            flags: Vec::new(),
            content_digest: None,
            size_bytes: 0,
            item_count: 0,
            manifest_path: paths.manifest.clone(),
            data_path: paths.data.clone(),
            per_backend_status: Vec::new(),
            partial_failures: Vec::new(),
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SnapshotStatus::Completed
    }

    pub fn has_flag(&self, flag: SnapshotFlag) -> bool {
        self.flags.contains(&flag)
    }

    fn flag(&mut self, flag: SnapshotFlag) {
        if !self.has_flag(flag) {
            self.flags.push(flag);
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.status = SnapshotStatus::Failed;
        self.error = Some(message.into());
    }
}

/// Destination for cycle outcomes
#[async_trait]
pub trait ResultRecorder: Send + Sync {
    async fn record(&self, record: &SnapshotRecord) -> Result<()>;
}

/// Appends one JSON record per line to a file
#[derive(Debug, Clone)]
pub struct JsonLinesRecorder {
    path: PathBuf,
}

impl JsonLinesRecorder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultRecorder for JsonLinesRecorder {
    async fn record(&self, record: &SnapshotRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Logs the record and stores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

#[async_trait]
impl ResultRecorder for TracingRecorder {
    async fn record(&self, record: &SnapshotRecord) -> Result<()> {
        match record.status {
            SnapshotStatus::Completed => info!(
                tenant_id = %record.tenant_id,
                snapshot_id = %record.snapshot_id,
                items = record.item_count,
                size_bytes = record.size_bytes,
                flags = ?record.flags,
                "snapshot completed"
            ),
            SnapshotStatus::Failed => error!(
                tenant_id = %record.tenant_id,
                snapshot_id = %record.snapshot_id,
                flags = ?record.flags,
                error = record.error.as_deref().unwrap_or_default(),
                "snapshot failed"
            ),
        }
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<SnapshotRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SnapshotRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultRecorder for MemoryRecorder {
    async fn record(&self, record: &SnapshotRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| FolioError::validation("record store lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

/// What a successful artifact write produced
struct Persisted {
    content_digest: String,
    size_bytes: u64,
    item_count: usize,
    statuses: Vec<BackendStatus>,
    partial: bool,
}

/// Combine the per-backend outcomes of the data and manifest writes
///
/// A backend only holds a usable snapshot when both writes landed on it.
fn merge_reports(data: &ReplicationReport, manifest: &ReplicationReport) -> Vec<BackendStatus> {
    data.statuses
        .iter()
        .map(|data_status| {
            let manifest_status = manifest
                .statuses
                .iter()
                .find(|s| s.backend == data_status.backend);
            let ok = data_status.ok && manifest_status.is_some_and(|s| s.ok);
            let error = data_status
                .error
                .clone()
                .or_else(|| manifest_status.and_then(|s| s.error.clone()));
            BackendStatus {
                backend: data_status.backend.clone(),
                role: data_status.role,
                ok,
                error,
            }
        })
        .collect()
}

/// Statuses for a write that failed on every backend, primary first
fn failed_statuses(failures: &[BackendFailure]) -> Vec<BackendStatus> {
    failures
        .iter()
        .enumerate()
        .map(|(index, failure)| BackendStatus {
            backend: failure.backend.clone(),
            role: if index == 0 {
                ReplicationRole::Primary
            } else {
                ReplicationRole::Mirror
            },
            ok: false,
            error: Some(failure.reason.clone()),
        })
        .collect()
}

/// Runs capture cycles
pub struct SnapshotPipeline {
    crawler: Crawler,
    storage: Arc<RedundantStorageAdapter>,
    compressor: Box<dyn CompressionAdapter>,
    manifest_builder: ManifestBuilder,
    recorder: Arc<dyn ResultRecorder>,
    config: PipelineConfig,
}

impl SnapshotPipeline {
    pub fn new(crawler: Crawler, storage: Arc<RedundantStorageAdapter>, config: PipelineConfig) -> Self {
        Self {
            crawler,
            storage,
            compressor: Box::new(GzipCompressor::with_level(config.compression_level)),
            manifest_builder: ManifestBuilder::new(),
            recorder: Arc::new(TracingRecorder),
            config,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ResultRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_compressor(mut self, compressor: Box<dyn CompressionAdapter>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_manifest_builder(mut self, builder: ManifestBuilder) -> Self {
        self.manifest_builder = builder;
        self
    }

    /// Run one capture cycle
    ///
    /// A malformed trigger is rejected with an error before any external
    /// call. Every other outcome, including a failed cycle, is returned as a
    /// record after it has been handed to the recorder.
    pub async fn run(&self, trigger: SnapshotTrigger) -> Result<SnapshotRecord> {
        trigger.validate()?;
        let snapshot_id = trigger.resolve_snapshot_id();
        let paths = SnapshotPaths::new(&trigger.tenant_id, &snapshot_id);
        let mut record = SnapshotRecord::pending(&trigger, &snapshot_id, &paths);

        let started = Instant::now();
        let cycle_deadline = started + self.config.cycle_timeout();
        info!(tenant_id = %trigger.tenant_id, snapshot_id = %snapshot_id, "starting capture cycle");

        let outcome = self.crawler.crawl_until(started + self.config.crawl_budget()).await;
        record.partial_failures = outcome.failures.clone();
        record.item_count = outcome.item_count();
        if outcome.is_partial() {
            record.flag(SnapshotFlag::PartialCrawl);
        }
        if outcome.deadline_hit {
            record.flag(SnapshotFlag::CrawlDeadline);
        }

        if outcome.items.is_empty() {
            if outcome.failures.is_empty() {
                record.flag(SnapshotFlag::EmptyWorkspace);
                record.fail("workspace returned no items and no errors; nothing was stored");
            } else {
                record.fail(format!(
                    "crawl produced no items ({} failures)",
                    outcome.failures.len()
                ));
            }
        } else {
            match self.persist(&trigger, &snapshot_id, &paths, &outcome, cycle_deadline).await {
                Ok(persisted) => {
                    record.status = SnapshotStatus::Completed;
                    record.content_digest = Some(persisted.content_digest);
                    record.size_bytes = persisted.size_bytes;
                    record.item_count = persisted.item_count;
                    record.per_backend_status = persisted.statuses;
                    if persisted.partial {
                        record.flag(SnapshotFlag::PartialReplication);
                    }
                }
                Err(e) => {
                    if let FolioError::AllBackendsFailed { failures, .. } = &e {
                        record.per_backend_status = failed_statuses(failures);
                    }
                    record.fail(e.to_string());
                }
            }
        }

        record.finished_at = Utc::now();
        if let Err(e) = self.recorder.record(&record).await {
            warn!(snapshot_id = %record.snapshot_id, error = %e, "failed to record snapshot outcome");
        }
        Ok(record)
    }

    async fn persist(
        &self,
        trigger: &SnapshotTrigger,
        snapshot_id: &str,
        paths: &SnapshotPaths,
        outcome: &CrawlOutcome,
        deadline: Instant,
    ) -> Result<Persisted> {
        let manifest = self.manifest_builder.build(
            &trigger.tenant_id,
            snapshot_id,
            trigger.requested_at,
            &outcome.items,
        )?;

        let payload = serde_json::to_vec(&outcome.items)?;
        let item_count = outcome.item_count();
        let metadata = SnapshotMetadata::new(&trigger.tenant_id, snapshot_id)
            .with_timestamp(trigger.requested_at)
            .with_item_count(item_count)
            .with_payload(&payload)
            .with_compression_algorithm(self.compressor.algorithm_name());
        metadata.validate()?;

        let container = SnapshotContainer {
            metadata: metadata.clone(),
            items: outcome.items.as_slice(),
        };
        let compressed = self.compressor.compress(&serde_json::to_vec(&container)?)?;
        let content_digest = compute_hash(&compressed);
        let size_bytes = compressed.len();
        let object_metadata = metadata
            .with_compressed_size(size_bytes)
            .object_metadata(&content_digest);
        let manifest_bytes = self.compressor.compress(&manifest.to_bytes()?)?;

        let data_write = timeout_at(
            deadline,
            self.storage
                .write_replicated(&paths.data, Bytes::from(compressed), &object_metadata),
        )
        .await
        .map_err(|_| FolioError::DeadlineExceeded("cycle timed out writing the data artifact".into()))
        .and_then(|result| result);

        let data_report = match data_write {
            Ok(report) => report,
            Err(e) => {
                // Replicas that finished before the failure still hold a copy
                error!(path = %paths.data, error = %e, "data write failed; removing partial data artifact");
                self.discard(&paths.data).await;
                return Err(e);
            }
        };

        let manifest_write = timeout_at(
            deadline,
            self.storage
                .write_replicated(&paths.manifest, Bytes::from(manifest_bytes), &object_metadata),
        )
        .await
        .map_err(|_| FolioError::DeadlineExceeded("cycle timed out writing the manifest".into()))
        .and_then(|result| result);

        let manifest_report = match manifest_write {
            Ok(report) => report,
            Err(e) => {
                error!(path = %paths.manifest, error = %e, "manifest write failed; removing data artifact");
                self.discard(&paths.data).await;
                return Err(e);
            }
        };

        observability::record_snapshot_size(size_bytes);
        let statuses = merge_reports(&data_report, &manifest_report);
        let partial = statuses.iter().any(|s| !s.ok);

        Ok(Persisted {
            content_digest,
            size_bytes: size_bytes as u64,
            item_count,
            statuses,
            partial,
        })
    }

    /// Best-effort removal of an artifact left behind by a failed cycle
    async fn discard(&self, path: &str) {
        if let Err(cleanup) = self.storage.delete(path).await {
            warn!(path, error = %cleanup, "could not remove orphaned artifact");
        }
    }
}

/// Reads stored snapshots back
pub struct SnapshotReader {
    storage: Arc<dyn StorageAdapter>,
    compressor: Box<dyn CompressionAdapter>,
}

impl SnapshotReader {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            compressor: Box::new(GzipCompressor::new()),
        }
    }

    pub fn with_compressor(mut self, compressor: Box<dyn CompressionAdapter>) -> Self {
        self.compressor = compressor;
        self
    }

    pub async fn load_manifest(&self, tenant_id: &str, snapshot_id: &str) -> Result<Manifest> {
        let paths = SnapshotPaths::checked(tenant_id, snapshot_id)?;
        let compressed = self.storage.read(&paths.manifest).await?;
        let manifest = Manifest::from_bytes(&self.compressor.decompress(&compressed)?)?;

        if manifest.tenant_id != tenant_id || manifest.snapshot_id != snapshot_id {
            return Err(FolioError::invalid_format(format!(
                "{} holds the manifest of {}/{}",
                paths.manifest, manifest.tenant_id, manifest.snapshot_id
            )));
        }
        Ok(manifest)
    }

    /// Load and verify the item tree of a snapshot
    pub async fn load_items(&self, tenant_id: &str, snapshot_id: &str) -> Result<(SnapshotMetadata, Vec<WorkspaceItem>)> {
        let paths = SnapshotPaths::checked(tenant_id, snapshot_id)?;
        let compressed = self.storage.read(&paths.data).await?;
        let decompressed = self.compressor.decompress(&compressed)?;
        let container: SnapshotContainer<Vec<WorkspaceItem>> = serde_json::from_slice(&decompressed)?;

        if !container.metadata.is_compatible() {
            return Err(FolioError::invalid_format(format!(
                "Incompatible snapshot format version: {} (current: {})",
                container.metadata.format_version, METADATA_FORMAT_VERSION
            )));
        }

        let payload = serde_json::to_vec(&container.items)?;
        container.metadata.verify_integrity(&payload)?;

        let metadata = container.metadata.with_compressed_size(compressed.len());
        Ok((metadata, container.items))
    }

    /// Snapshot ids of a tenant that have a manifest, sorted
    pub async fn list_snapshots(&self, tenant_id: &str) -> Result<Vec<String>> {
        validate_id("tenant_id", tenant_id)?;
        let prefix = format!("{tenant_id}/");
        let mut ids: Vec<String> = self
            .storage
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter_map(|name| name.strip_suffix(SnapshotPaths::MANIFEST_SUFFIX))
            .filter(|id| !id.contains('/'))
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Check that both artifacts load and agree with each other
    pub async fn verify_snapshot(&self, tenant_id: &str, snapshot_id: &str) -> Result<SnapshotMetadata> {
        let manifest = self.load_manifest(tenant_id, snapshot_id).await?;
        let (metadata, items) = self.load_items(tenant_id, snapshot_id).await?;

        let item_ids: HashSet<&str> = flatten_all(&items).map(|item| item.id.as_str()).collect();
        if let Some(missing) = manifest.ids().find(|id| !item_ids.contains(id)) {
            return Err(FolioError::invalid_format(format!(
                "manifest references {missing}, which is not in the data artifact"
            )));
        }
        if manifest.len() != item_ids.len() {
            return Err(FolioError::invalid_format(format!(
                "manifest has {} entries but the data artifact holds {} distinct items",
                manifest.len(),
                item_ids.len()
            )));
        }
        Ok(metadata)
    }

    /// Delete both artifacts, manifest first
    pub async fn delete_snapshot(&self, tenant_id: &str, snapshot_id: &str) -> Result<()> {
        let paths = SnapshotPaths::checked(tenant_id, snapshot_id)?;
        self.storage.delete(&paths.manifest).await?;
        self.storage.delete(&paths.data).await?;
        info!(tenant_id, snapshot_id, "deleted snapshot");
        Ok(())
    }
}
