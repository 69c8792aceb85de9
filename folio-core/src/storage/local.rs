/*!
Local filesystem storage adapter implementation.
*/

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::{CopyCapability, StorageAdapter};
use crate::config::StorageTargetConfig;
use crate::error::BackendErrorKind;
use crate::{FolioError, Result};

/// Local filesystem storage adapter
///
/// Objects are stored as files below a base directory; `/`-separated storage
/// paths map onto nested directories, created on demand. Writes go to a
/// temporary sibling file first and are renamed into place, so a reader never
/// observes a half-written artifact.
///
/// Object metadata is not persisted by this backend.
///
/// # Example
/// ```rust
/// use folio_core::storage::{LocalFileStorage, StorageAdapter};
///
/// # tokio_test_block(async {
/// let dir = std::env::temp_dir().join("folio-doc");
/// let storage = LocalFileStorage::new("disk", &dir);
/// storage.write("acme/s1.data", "bytes".into(), &Default::default()).await?;
/// assert!(storage.exists("acme/s1.data").await?);
/// # Ok::<(), folio_core::FolioError>(())
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    name: String,
    base_dir: PathBuf,
}

impl LocalFileStorage {
    /// Create a local adapter rooted at `base_dir`
    pub fn new(name: impl Into<String>, base_dir: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(target: &StorageTargetConfig) -> Result<Self> {
        let base_dir = target.base_path.as_ref().ok_or_else(|| {
            FolioError::validation(format!("local storage target '{}' requires a base_path", target.name))
        })?;
        Ok(Self::new(&target.name, base_dir))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a storage path below the base directory
    ///
    /// Absolute paths and `..` components are rejected so a path can never
    /// escape the base directory.
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || !safe {
            return Err(FolioError::validation(format!("invalid storage path '{path}'")));
        }
        Ok(self.base_dir.join(relative))
    }

    fn map_io_error(&self, path: &str, err: std::io::Error) -> FolioError {
        match err.kind() {
            ErrorKind::NotFound => FolioError::not_found(path),
            ErrorKind::PermissionDenied => {
                FolioError::backend(&self.name, BackendErrorKind::PermissionDenied, format!("{path}: {err}"))
            }
            _ => FolioError::Io(err),
        }
    }

    async fn ensure_parent_dir(&self, path: &str, full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.map_io_error(path, e))?;
        }
        Ok(())
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

#[async_trait]
impl StorageAdapter for LocalFileStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, path: &str, data: Bytes, _metadata: &BTreeMap<String, String>) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        self.ensure_parent_dir(path, &full_path).await?;

        let file_name = full_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = full_path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        fs::write(&temp_path, &data)
            .await
            .map_err(|e| self.map_io_error(path, e))?;
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.map_io_error(path, e));
        }

        debug!(backend = %self.name, path = %full_path.display(), size = data.len(), "wrote object");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path)?;
        let data = fs::read(&full_path).await.map_err(|e| self.map_io_error(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut pending = vec![(self.base_dir.clone(), String::new())];

        while let Some((dir, relative)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(self.map_io_error(&relative, e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if relative.is_empty() {
                    name.clone()
                } else {
                    format!("{relative}/{name}")
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if !is_temp_file(&name) && key.starts_with(prefix) {
                    paths.push(key);
                }
            }
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.map_io_error(path, e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path)?;
        fs::try_exists(&full_path)
            .await
            .map_err(|e| self.map_io_error(path, e))
    }

    fn as_copy(&self) -> Option<&dyn CopyCapability> {
        Some(self)
    }
}

#[async_trait]
impl CopyCapability for LocalFileStorage {
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve_path(from)?;
        let target = self.resolve_path(to)?;
        self.ensure_parent_dir(to, &target).await?;
        fs::copy(&source, &target)
            .await
            .map_err(|e| self.map_io_error(from, e))?;
        Ok(())
    }
}
