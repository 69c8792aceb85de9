//! In-memory storage with failure injection, for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{CopyCapability, MetadataCapability, ObjectInfo, StorageAdapter};
use crate::error::BackendErrorKind;
use crate::{FolioError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Failure {
    None,
    /// Every call fails with a transient error
    Unreachable,
    /// Every call fails with a permission error
    Denied,
    /// The next N calls fail transiently, then calls succeed
    Flaky,
}

pub(crate) struct MemoryStorage {
    name: String,
    objects: Mutex<BTreeMap<String, (Bytes, BTreeMap<String, String>)>>,
    failure: Failure,
    flaky_remaining: AtomicUsize,
    calls: AtomicUsize,
    copy: bool,
    rejected_suffix: Option<&'static str>,
    stalled_suffix: Option<&'static str>,
}

impl MemoryStorage {
    fn with_failure(name: &str, failure: Failure) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            failure,
            flaky_remaining: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            copy: false,
            rejected_suffix: None,
            stalled_suffix: None,
        }
    }

    pub(crate) fn new(name: &str) -> Self {
        Self::with_failure(name, Failure::None)
    }

    pub(crate) fn unreachable(name: &str) -> Self {
        Self::with_failure(name, Failure::Unreachable)
    }

    pub(crate) fn denied(name: &str) -> Self {
        Self::with_failure(name, Failure::Denied)
    }

    pub(crate) fn flaky(name: &str, failures: usize) -> Self {
        let storage = Self::with_failure(name, Failure::Flaky);
        storage.flaky_remaining.store(failures, Ordering::SeqCst);
        storage
    }

    pub(crate) fn with_copy(mut self) -> Self {
        self.copy = true;
        self
    }

    /// Fail writes to paths ending in `suffix` with a permission error
    pub(crate) fn rejecting_writes_to(mut self, suffix: &'static str) -> Self {
        self.rejected_suffix = Some(suffix);
        self
    }

    /// Writes to paths ending in `suffix` never complete
    pub(crate) fn stalling_writes_to(mut self, suffix: &'static str) -> Self {
        self.stalled_suffix = Some(suffix);
        self
    }

    /// Number of calls made against this backend, including failed ones
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    pub(crate) fn insert(&self, path: &str, data: &'static [u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (Bytes::from_static(data), BTreeMap::new()));
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Failure::None => Ok(()),
            Failure::Unreachable => Err(FolioError::backend(
                &self.name,
                BackendErrorKind::Transient,
                "connection refused",
            )),
            Failure::Denied => Err(FolioError::backend(
                &self.name,
                BackendErrorKind::PermissionDenied,
                "access denied",
            )),
            Failure::Flaky => {
                let remaining = self.flaky_remaining.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.flaky_remaining.store(remaining - 1, Ordering::SeqCst);
                    Err(FolioError::backend(&self.name, BackendErrorKind::Transient, "connection reset"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, path: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()> {
        self.check()?;
        if self.stalled_suffix.is_some_and(|suffix| path.ends_with(suffix)) {
            futures::future::pending::<()>().await;
        }
        if self.rejected_suffix.is_some_and(|suffix| path.ends_with(suffix)) {
            return Err(FolioError::backend(
                &self.name,
                BackendErrorKind::PermissionDenied,
                format!("write to {path} denied"),
            ));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (data, metadata.clone()));
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.check()?;
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| FolioError::not_found(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check()?;
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check()?;
        Ok(self.objects.lock().unwrap().contains_key(path))
    }

    fn as_metadata(&self) -> Option<&dyn MetadataCapability> {
        Some(self)
    }

    fn as_copy(&self) -> Option<&dyn CopyCapability> {
        if self.copy {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl MetadataCapability for MemoryStorage {
    async fn metadata(&self, path: &str) -> Result<ObjectInfo> {
        self.check()?;
        let objects = self.objects.lock().unwrap();
        let (data, metadata) = objects.get(path).ok_or_else(|| FolioError::not_found(path))?;
        Ok(ObjectInfo {
            path: path.to_string(),
            size: data.len() as u64,
            last_modified: None,
            metadata: metadata.clone(),
        })
    }
}

#[async_trait]
impl CopyCapability for MemoryStorage {
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.check()?;
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get(from).cloned().ok_or_else(|| FolioError::not_found(from))?;
        objects.insert(to.to_string(), object);
        Ok(())
    }
}
