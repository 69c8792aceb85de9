/*!
Replicated storage over one primary and any number of mirrors.

The policy is write-optimistic and read-pessimistic:

- writes fan out to every backend concurrently and succeed if any backend
  stored the data
- reads try the primary, then each mirror in configured order, and fail only
  when every backend failed
- listing is primary-authoritative; mirrors may lag, so they are consulted
  only when the primary itself errors
- deletes go to every backend and succeed on the first success
- `exists` is true if the object is present anywhere
- copy runs on the primary only

Each individual backend call gets the bounded transient retry from
`folio_retry`; permanent errors are never retried.
*/

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{CopyCapability, MetadataCapability, ObjectInfo, StorageAdapter};
use crate::config::ReplicationRole;
use crate::error::BackendFailure;
use crate::observability::{self, StorageTimer};
use crate::{FolioError, Result};
use folio_retry::{retry_transient, RetryPolicy};

/// Outcome of one backend's share of a replicated write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub backend: String,
    pub role: ReplicationRole,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendStatus {
    fn from_result<T>(backend: &str, role: ReplicationRole, result: &Result<T>) -> Self {
        Self {
            backend: backend.to_string(),
            role,
            ok: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }
}

/// Per-backend status of a replicated write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    pub statuses: Vec<BackendStatus>,
}

impl ReplicationReport {
    pub fn succeeded(&self) -> usize {
        self.statuses.iter().filter(|s| s.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.statuses.len() - self.succeeded()
    }

    /// Some backends stored the data and some did not
    pub fn is_partial(&self) -> bool {
        self.succeeded() > 0 && self.failed() > 0
    }

    pub fn failures(&self) -> Vec<BackendFailure> {
        self.statuses
            .iter()
            .filter(|s| !s.ok)
            .map(|s| BackendFailure {
                backend: s.backend.clone(),
                reason: s.error.clone().unwrap_or_default(),
            })
            .collect()
    }
}

/// A `StorageAdapter` that replicates across a primary and its mirrors
pub struct RedundantStorageAdapter {
    primary: Arc<dyn StorageAdapter>,
    mirrors: Vec<Arc<dyn StorageAdapter>>,
    policy: RetryPolicy,
}

impl RedundantStorageAdapter {
    pub fn new(primary: Arc<dyn StorageAdapter>, mirrors: Vec<Arc<dyn StorageAdapter>>) -> Self {
        Self {
            primary,
            mirrors,
            policy: RetryPolicy::default(),
        }
    }

    /// Replace the per-call retry policy (default: a single retry)
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn primary(&self) -> &dyn StorageAdapter {
        self.primary.as_ref()
    }

    pub fn mirror_count(&self) -> usize {
        self.mirrors.len()
    }

    /// Backend names, primary first
    pub fn backend_names(&self) -> Vec<&str> {
        self.backends().map(|(_, adapter)| adapter.name()).collect()
    }

    fn backends(&self) -> impl Iterator<Item = (ReplicationRole, &dyn StorageAdapter)> {
        std::iter::once((ReplicationRole::Primary, self.primary.as_ref()))
            .chain(self.mirrors.iter().map(|m| (ReplicationRole::Mirror, m.as_ref())))
    }

    /// One backend call with bounded retry and metrics
    async fn call<'a, T, F>(&self, adapter: &'a dyn StorageAdapter, operation: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> BoxFuture<'a, Result<T>> + Send,
        T: Send,
    {
        let timer = StorageTimer::start(adapter.name(), operation);
        let result = retry_transient(operation, &self.policy, |attempt| {
            if attempt > 1 {
                observability::record_storage_retry(adapter.name(), operation);
            }
            f()
        })
        .await;
        timer.finish(result.is_ok());
        result
    }

    /// Try the primary, then each mirror in order; first success wins
    async fn with_fallback<'a, T, F>(&'a self, operation: &'static str, path: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&'a dyn StorageAdapter) -> BoxFuture<'a, Result<T>> + Send,
        T: Send,
    {
        let primary = self.primary.as_ref();
        let primary_error = match self.call(primary, operation, || f(primary)).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if self.mirrors.is_empty() {
            return Err(primary_error);
        }
        if primary_error.is_not_found() {
            debug!(backend = %primary.name(), path, operation, "not found on primary, trying mirrors");
        } else {
            warn!(backend = %primary.name(), path, operation, error = %primary_error, "primary failed, trying mirrors");
        }

        let mut all_not_found = primary_error.is_not_found();
        let mut mirror_failures = Vec::new();
        for mirror in &self.mirrors {
            let mirror = mirror.as_ref();
            match self.call(mirror, operation, || f(mirror)).await {
                Ok(value) => {
                    info!(backend = %mirror.name(), path, operation, "served from mirror");
                    return Ok(value);
                }
                Err(e) => {
                    all_not_found &= e.is_not_found();
                    mirror_failures.push(BackendFailure::new(mirror.name(), &e));
                }
            }
        }

        if all_not_found {
            return Err(FolioError::not_found(path));
        }
        error!(path, operation, error = %primary_error, mirrors = mirror_failures.len(), "every backend failed");
        Err(FolioError::ReadFailed {
            source: Box::new(primary_error),
            mirrors: mirror_failures,
        })
    }

    /// Write to every backend concurrently and report each backend's outcome
    ///
    /// Succeeds when at least one backend stored the data. A partial success is
    /// logged as a warning; inspect the report to tell it apart from a full one.
    pub async fn write_replicated(
        &self,
        path: &str,
        data: Bytes,
        metadata: &BTreeMap<String, String>,
    ) -> Result<ReplicationReport> {
        let writes = self.backends().map(|(role, adapter)| {
            let data = data.clone();
            async move {
                let result = self
                    .call(adapter, "write", || adapter.write(path, data.clone(), metadata))
                    .await;
                BackendStatus::from_result(adapter.name(), role, &result)
            }
        });
        let report = ReplicationReport {
            statuses: join_all(writes).await,
        };

        if report.succeeded() == 0 {
            let failures = report.failures();
            error!(path, backends = failures.len(), "write failed on every backend");
            return Err(FolioError::AllBackendsFailed {
                operation: "write",
                failures,
            });
        }
        if report.is_partial() {
            observability::record_partial_replication();
            for status in report.statuses.iter().filter(|s| !s.ok) {
                warn!(
                    backend = %status.backend,
                    role = ?status.role,
                    path,
                    error = status.error.as_deref().unwrap_or_default(),
                    "replica write failed; object is under-replicated"
                );
            }
        }
        debug!(path, succeeded = report.succeeded(), total = report.statuses.len(), "replicated write finished");
        Ok(report)
    }
}

#[async_trait]
impl StorageAdapter for RedundantStorageAdapter {
    fn name(&self) -> &str {
        "redundant"
    }

    async fn write(&self, path: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()> {
        self.write_replicated(path, data, metadata).await.map(|_| ())
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.with_fallback("read", path, |adapter| adapter.read(path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // An empty listing from the primary is authoritative.
        let mut failures = Vec::new();
        for (_, adapter) in self.backends() {
            match self.call(adapter, "list", || adapter.list(prefix)).await {
                Ok(paths) => {
                    if !failures.is_empty() {
                        warn!(backend = %adapter.name(), prefix, "listing served from mirror");
                    }
                    return Ok(paths);
                }
                Err(e) => failures.push(BackendFailure::new(adapter.name(), &e)),
            }
        }
        Err(FolioError::AllBackendsFailed {
            operation: "list",
            failures,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let deletes = self.backends().map(|(_, adapter)| async move {
            let result = self.call(adapter, "delete", || adapter.delete(path)).await;
            (adapter.name(), result)
        });
        let results = join_all(deletes).await;

        let failures: Vec<BackendFailure> = results
            .iter()
            .filter_map(|(name, result)| result.as_ref().err().map(|e| BackendFailure::new(*name, e)))
            .collect();

        if failures.len() == results.len() {
            return Err(FolioError::AllBackendsFailed {
                operation: "delete",
                failures,
            });
        }
        for failure in &failures {
            warn!(backend = %failure.backend, path, error = %failure.reason, "delete did not reach backend");
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let mut failures = Vec::new();
        let mut answered = false;
        for (_, adapter) in self.backends() {
            match self.call(adapter, "exists", || adapter.exists(path)).await {
                Ok(true) => return Ok(true),
                Ok(false) => answered = true,
                Err(e) => failures.push(BackendFailure::new(adapter.name(), &e)),
            }
        }
        if answered {
            Ok(false)
        } else {
            Err(FolioError::AllBackendsFailed {
                operation: "exists",
                failures,
            })
        }
    }

    fn as_metadata(&self) -> Option<&dyn MetadataCapability> {
        let any_backend_has_it = self.backends().any(|(_, adapter)| adapter.as_metadata().is_some());
        if any_backend_has_it {
            Some(self)
        } else {
            None
        }
    }

    /// Always exposed; `copy` fails with `Unsupported` naming the primary when it cannot copy
    fn as_copy(&self) -> Option<&dyn CopyCapability> {
        Some(self)
    }
}

#[async_trait]
impl MetadataCapability for RedundantStorageAdapter {
    async fn metadata(&self, path: &str) -> Result<ObjectInfo> {
        self.with_fallback("metadata", path, |adapter| {
            async move {
                match adapter.as_metadata() {
                    Some(capability) => capability.metadata(path).await,
                    None => Err(FolioError::unsupported(adapter.name(), "metadata")),
                }
            }
            .boxed()
        })
        .await
    }
}

#[async_trait]
impl CopyCapability for RedundantStorageAdapter {
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let primary = self.primary.as_ref();
        let capability = primary
            .as_copy()
            .ok_or_else(|| FolioError::unsupported(primary.name(), "copy"))?;
        self.call(primary, "copy", || capability.copy(from, to)).await
    }
}
