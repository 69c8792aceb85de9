/*!
Google Cloud Storage (GCS) adapter implementation.

Objects up to [`MULTIPART_THRESHOLD`] are sent in one multipart request (body
plus metadata); larger payloads go through a resumable upload in fixed-size
chunks.
*/

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client as GcsClient, ClientConfig};
use google_cloud_storage::http::objects::copy::CopyObjectRequest;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::resumable_upload_client::{ChunkSize, UploadStatus};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::{join_key, strip_key_prefix, CopyCapability, MetadataCapability, ObjectInfo, StorageAdapter, MULTIPART_THRESHOLD};
use crate::config::StorageTargetConfig;
use crate::error::{is_transient_status, BackendErrorKind};
use crate::{FolioError, Result};

/// Resumable upload chunk size; must be a multiple of 256 KiB
const RESUMABLE_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Google Cloud Storage adapter
///
/// # Authentication
/// A service account JSON supplied on the target (already decrypted by the
/// caller) takes precedence. Otherwise the default GCP chain is used:
/// 1. GOOGLE_APPLICATION_CREDENTIALS pointing to a service account JSON file
/// 2. The service account attached to the compute instance (GCE, GKE, Cloud Run)
/// 3. gcloud user credentials when running locally
#[derive(Clone)]
pub struct GcsStorageAdapter {
    name: String,
    client: GcsClient,
    bucket: String,
    prefix: Option<String>,
}

impl GcsStorageAdapter {
    /// Create an adapter from a storage target
    pub async fn from_config(target: &StorageTargetConfig) -> Result<Self> {
        let bucket = target
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| FolioError::validation(format!("GCS target '{}' requires a bucket", target.name)))?;

        let auth_error = |e: &dyn std::fmt::Display| {
            FolioError::backend(
                &target.name,
                BackendErrorKind::PermissionDenied,
                format!("GCS authentication failed: {e}"),
            )
        };

        let config = match &target.credentials_json {
            Some(json) => {
                let credentials = CredentialsFile::new_from_str(json).await.map_err(|e| auth_error(&e))?;
                ClientConfig::default()
                    .with_credentials(credentials)
                    .await
                    .map_err(|e| auth_error(&e))?
            }
            None => ClientConfig::default().with_auth().await.map_err(|e| auth_error(&e))?,
        };

        info!(backend = %target.name, bucket = %bucket, prefix = ?target.prefix, "Initialized GCS storage adapter");

        Ok(Self {
            name: target.name.clone(),
            client: GcsClient::new(config),
            bucket,
            prefix: target.prefix.clone(),
        })
    }

    fn object_path(&self, path: &str) -> String {
        join_key(self.prefix.as_deref(), path)
    }

    fn object_request(&self, object: &str) -> GetObjectRequest {
        GetObjectRequest {
            bucket: self.bucket.clone(),
            object: object.to_string(),
            ..Default::default()
        }
    }

    fn upload_target(&self, key: &str, metadata: &BTreeMap<String, String>) -> UploadType {
        let object = Object {
            name: key.to_string(),
            metadata: (!metadata.is_empty())
                .then(|| metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<HashMap<_, _>>()),
            ..Default::default()
        };
        UploadType::Multipart(Box::new(object))
    }

    async fn upload_resumable(&self, key: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()> {
        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let uploader = self
            .client
            .prepare_resumable_upload(&request, &self.upload_target(key, metadata))
            .await
            .map_err(|e| map_gcs_error(&self.name, "prepare_resumable_upload", &e, key))?;

        let total = data.len() as u64;
        let mut start = 0;
        while start < data.len() {
            let end = (start + RESUMABLE_CHUNK_SIZE).min(data.len());
            let chunk = ChunkSize::new(start as u64, end as u64 - 1, Some(total));
            let status = uploader
                .upload_multiple_chunk(data.slice(start..end), &chunk)
                .await
                .map_err(|e| map_gcs_error(&self.name, "upload_multiple_chunk", &e, key));

            match status {
                Ok(UploadStatus::Ok(_)) => {
                    debug!(backend = %self.name, key = %key, size = total, "resumable upload finished");
                    return Ok(());
                }
                Ok(_) => start = end,
                Err(e) => {
                    warn!(backend = %self.name, key = %key, error = %e, "cancelling resumable upload");
                    if let Err(cancel_err) = uploader.cancel().await {
                        warn!(backend = %self.name, key = %key, error = ?cancel_err, "failed to cancel resumable upload");
                    }
                    return Err(e);
                }
            }
        }

        Err(FolioError::backend(
            &self.name,
            BackendErrorKind::Transient,
            format!("GCS resumable upload for '{key}' ended without confirmation"),
        ))
    }
}

#[async_trait]
impl StorageAdapter for GcsStorageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, path: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()> {
        let key = self.object_path(path);
        debug!(backend = %self.name, bucket = %self.bucket, key = %key, size = data.len(), "Saving object to GCS");

        if data.len() > MULTIPART_THRESHOLD {
            return self.upload_resumable(&key, data, metadata).await;
        }

        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        self.client
            .upload_object(&request, data, &self.upload_target(&key, metadata))
            .await
            .map_err(|e| map_gcs_error(&self.name, "upload_object", &e, &key))?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let key = self.object_path(path);
        let data = self
            .client
            .download_object(&self.object_request(&key), &Range::default())
            .await
            .map_err(|e| map_gcs_error(&self.name, "download_object", &e, &key))?;
        debug!(backend = %self.name, key = %key, size = data.len(), "Downloaded object from GCS");
        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let key_prefix = self.object_path(prefix);
        let mut paths = Vec::new();
        let mut page_token = None;

        loop {
            let request = ListObjectsRequest {
                bucket: self.bucket.clone(),
                prefix: Some(key_prefix.clone()),
                page_token: page_token.take(),
                ..Default::default()
            };
            let response = self
                .client
                .list_objects(&request)
                .await
                .map_err(|e| map_gcs_error(&self.name, "list_objects", &e, &key_prefix))?;

            paths.extend(
                response
                    .items
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|object| strip_key_prefix(self.prefix.as_deref(), &object.name))
                    .map(str::to_string),
            );

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.object_path(path);
        let request = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: key.clone(),
            ..Default::default()
        };
        match self
            .client
            .delete_object(&request)
            .await
            .map_err(|e| map_gcs_error(&self.name, "delete_object", &e, &key))
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn as_metadata(&self) -> Option<&dyn MetadataCapability> {
        Some(self)
    }

    fn as_copy(&self) -> Option<&dyn CopyCapability> {
        Some(self)
    }
}

#[async_trait]
impl MetadataCapability for GcsStorageAdapter {
    async fn metadata(&self, path: &str) -> Result<ObjectInfo> {
        let key = self.object_path(path);
        let object = self
            .client
            .get_object(&self.object_request(&key))
            .await
            .map_err(|e| map_gcs_error(&self.name, "get_object", &e, &key))?;

        Ok(ObjectInfo {
            path: path.to_string(),
            size: object.size.max(0) as u64,
            last_modified: object
                .updated
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.unix_timestamp(), t.nanosecond())),
            metadata: object.metadata.unwrap_or_default().into_iter().collect(),
        })
    }
}

#[async_trait]
impl CopyCapability for GcsStorageAdapter {
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.object_path(from);
        let request = CopyObjectRequest {
            source_bucket: self.bucket.clone(),
            source_object: source.clone(),
            destination_bucket: self.bucket.clone(),
            destination_object: self.object_path(to),
            ..Default::default()
        };
        self.client
            .copy_object(&request)
            .await
            .map_err(|e| map_gcs_error(&self.name, "copy_object", &e, &source))?;
        Ok(())
    }
}

/// Map GCS errors onto the storage error taxonomy
///
/// Structured responses carry an HTTP code; transport-level errors only have a
/// message, so those fall back to matching on its text.
fn map_gcs_error(backend: &str, operation: &str, error: &google_cloud_storage::http::Error, key: &str) -> FolioError {
    let status = match error {
        google_cloud_storage::http::Error::Response(response) => Some(response.code),
        _ => None,
    };
    classify_gcs_failure(backend, operation, status, &error.to_string(), key)
}

fn classify_gcs_failure(backend: &str, operation: &str, status: Option<u16>, message: &str, key: &str) -> FolioError {
    let lowered = message.to_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|n| lowered.contains(n));

    let not_found = status == Some(404) || (status.is_none() && mentions(&["404", "not found"]));
    let denied = matches!(status, Some(401) | Some(403)) || (status.is_none() && mentions(&["401", "403"]));
    let transient = status.map(is_transient_status).unwrap_or(false)
        || (status.is_none() && mentions(&["timeout", "timed out", "connection", "network", "500", "502", "503", "504"]));

    if not_found {
        FolioError::not_found(key)
    } else if denied {
        FolioError::backend(
            backend,
            BackendErrorKind::PermissionDenied,
            format!("GCS permission denied for object '{key}': ensure the service account has the right IAM roles. {message}"),
        )
    } else if transient {
        FolioError::backend(
            backend,
            BackendErrorKind::Transient,
            format!("GCS {operation} failed for object '{key}': {message}"),
        )
    } else if matches!(status, Some(400) | Some(409) | Some(412)) {
        FolioError::backend(
            backend,
            BackendErrorKind::InvalidRequest,
            format!("GCS {operation} rejected for object '{key}': {message}"),
        )
    } else {
        FolioError::backend(
            backend,
            BackendErrorKind::Other,
            format!("GCS {operation} error for object '{key}': {message}"),
        )
    }
}
