/*!
Storage adapters for snapshot artifacts.

`StorageAdapter` is the contract every backend binds to: upsert writes, reads
that fail with `NotFound` when the object is absent, prefix listing, idempotent
deletes and existence checks. Object metadata and server-side copy are optional
capabilities exposed through secondary traits, so a caller learns from the type
system (not from a runtime no-op) whether a backend supports them.

Payloads larger than [`MULTIPART_THRESHOLD`] go through each backend's
multipart or resumable upload path; callers never choose.
*/

#[cfg(feature = "gcs")]
pub mod gcs;
#[cfg(feature = "local")]
pub mod local;
pub mod redundant;
#[cfg(feature = "s3")]
pub mod s3;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{FolioConfig, StorageBackend, StorageTargetConfig};
use crate::{FolioError, Result};
use folio_retry::RetryPolicy;

#[cfg(feature = "gcs")]
pub use gcs::GcsStorageAdapter;
#[cfg(feature = "local")]
pub use local::LocalFileStorage;
pub use redundant::{BackendStatus, RedundantStorageAdapter, ReplicationReport};
#[cfg(feature = "s3")]
pub use s3::S3StorageAdapter;

/// Payloads above this size use the multipart/resumable upload path
pub const MULTIPART_THRESHOLD: usize = 5 * 1024 * 1024;

/// Prefix under which check objects are written
pub const CHECK_PREFIX: &str = ".folio-check";

/// Object metadata as reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// User metadata attached at write time
    pub metadata: BTreeMap<String, String>,
}

/// Uniform contract over one object-storage backend
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Name used in logs and per-backend status reports
    fn name(&self) -> &str;

    /// Store `data` at `path`, replacing any existing object
    async fn write(&self, path: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()>;

    /// Fetch the object at `path`; `FolioError::NotFound` if absent
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Paths under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove the object at `path`. Deleting an absent path succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Metadata capability, when the backend has one
    fn as_metadata(&self) -> Option<&dyn MetadataCapability> {
        None
    }

    /// Server-side copy capability, when the backend has one
    fn as_copy(&self) -> Option<&dyn CopyCapability> {
        None
    }
}

/// Optional capability: read object metadata without fetching the body
#[async_trait]
pub trait MetadataCapability: Send + Sync {
    async fn metadata(&self, path: &str) -> Result<ObjectInfo>;
}

/// Optional capability: copy an object inside the same backend
#[async_trait]
pub trait CopyCapability: Send + Sync {
    async fn copy(&self, from: &str, to: &str) -> Result<()>;
}

/// Read object metadata, failing with `Unsupported` when the backend has no such capability
pub async fn get_metadata(adapter: &dyn StorageAdapter, path: &str) -> Result<ObjectInfo> {
    match adapter.as_metadata() {
        Some(capability) => capability.metadata(path).await,
        None => Err(FolioError::unsupported(adapter.name(), "metadata")),
    }
}

/// Copy an object, failing with `Unsupported` when the backend has no such capability
pub async fn copy_object(adapter: &dyn StorageAdapter, from: &str, to: &str) -> Result<()> {
    match adapter.as_copy() {
        Some(capability) => capability.copy(from, to).await,
        None => Err(FolioError::unsupported(adapter.name(), "copy")),
    }
}

/// Join an optional key prefix and a relative path with exactly one `/`
pub(crate) fn join_key(prefix: Option<&str>, path: &str) -> String {
    match prefix.map(|p| p.trim_end_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{}", path.trim_start_matches('/')),
        None => path.trim_start_matches('/').to_string(),
    }
}

/// Inverse of [`join_key`]; `None` when `key` lies outside the prefix
pub(crate) fn strip_key_prefix<'a>(prefix: Option<&str>, key: &'a str) -> Option<&'a str> {
    match prefix.map(|p| p.trim_end_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => key.strip_prefix(prefix)?.strip_prefix('/'),
        None => Some(key),
    }
}

/// Write, read back and delete a unique check object
///
/// Used to validate a target before it is trusted as a mirror. The check
/// object is removed even when the read-back fails.
pub async fn check_target(adapter: &dyn StorageAdapter) -> Result<()> {
    let path = format!("{CHECK_PREFIX}/{}", Uuid::new_v4());
    let payload = Bytes::from(format!("folio check {path}"));

    adapter.write(&path, payload.clone(), &BTreeMap::new()).await?;
    let read_back = adapter.read(&path).await;
    let cleanup = adapter.delete(&path).await;

    let read_back = read_back?;
    if read_back != payload {
        return Err(FolioError::backend(
            adapter.name(),
            crate::error::BackendErrorKind::Other,
            "check object read back with different content",
        ));
    }
    cleanup
}

/// Construct the adapter for one configured target
pub async fn open_target(target: &StorageTargetConfig) -> Result<Arc<dyn StorageAdapter>> {
    target.validate()?;
    match target.backend {
        StorageBackend::Local => open_local(target),
        StorageBackend::S3 => open_s3(target).await,
        StorageBackend::Gcs => open_gcs(target).await,
    }
}

#[cfg(feature = "local")]
fn open_local(target: &StorageTargetConfig) -> Result<Arc<dyn StorageAdapter>> {
    Ok(Arc::new(LocalFileStorage::from_config(target)?))
}

#[cfg(not(feature = "local"))]
fn open_local(target: &StorageTargetConfig) -> Result<Arc<dyn StorageAdapter>> {
    Err(FolioError::validation(format!(
        "storage target '{}' needs local filesystem support. Recompile with --features local",
        target.name
    )))
}

#[cfg(feature = "s3")]
async fn open_s3(target: &StorageTargetConfig) -> Result<Arc<dyn StorageAdapter>> {
    Ok(Arc::new(S3StorageAdapter::from_config(target).await?))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(target: &StorageTargetConfig) -> Result<Arc<dyn StorageAdapter>> {
    Err(FolioError::validation(format!(
        "storage target '{}' needs S3 support. Recompile with --features s3",
        target.name
    )))
}

#[cfg(feature = "gcs")]
async fn open_gcs(target: &StorageTargetConfig) -> Result<Arc<dyn StorageAdapter>> {
    Ok(Arc::new(GcsStorageAdapter::from_config(target).await?))
}

#[cfg(not(feature = "gcs"))]
async fn open_gcs(target: &StorageTargetConfig) -> Result<Arc<dyn StorageAdapter>> {
    Err(FolioError::validation(format!(
        "storage target '{}' needs GCS support. Recompile with --features gcs",
        target.name
    )))
}

/// Build the replicated store described by `config`
///
/// The primary must construct successfully. Each mirror is constructed and
/// checked; a mirror that fails either step is left out with a warning so one
/// misconfigured replica cannot block backups.
pub async fn build_storage(config: &FolioConfig, policy: RetryPolicy) -> Result<RedundantStorageAdapter> {
    let primary_config = config.primary()?;
    let primary = open_target(primary_config).await?;
    info!(backend = %primary_config.name, kind = ?primary_config.backend, "opened primary storage target");

    let mut mirrors = Vec::new();
    for target in config.mirrors() {
        let adapter = match open_target(target).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(backend = %target.name, error = %e, "skipping mirror that failed to initialize");
                continue;
            }
        };
        if let Err(e) = check_target(adapter.as_ref()).await {
            warn!(backend = %target.name, error = %e, "skipping mirror that failed its round-trip check");
            continue;
        }
        info!(backend = %target.name, kind = ?target.backend, "mirror validated");
        mirrors.push(adapter);
    }

    Ok(RedundantStorageAdapter::new(primary, mirrors).with_retry_policy(policy))
}
