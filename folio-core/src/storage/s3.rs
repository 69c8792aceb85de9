/*!
S3-compatible storage adapter implementation.

Works against Amazon S3 and any S3-compatible store (MinIO, R2, LocalStack)
through a custom endpoint, an explicit region and path-style addressing.
*/

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

use super::{join_key, strip_key_prefix, CopyCapability, MetadataCapability, ObjectInfo, StorageAdapter, MULTIPART_THRESHOLD};
use crate::config::StorageTargetConfig;
use crate::error::{is_transient_status, BackendErrorKind};
use crate::{FolioError, Result};

/// Size of each part in a multipart upload; every part but the last must be at least 5 MiB
const PART_SIZE: usize = MULTIPART_THRESHOLD;

/// S3 storage adapter
///
/// # Authentication
/// Static credentials from the target configuration take precedence. Without
/// them the standard AWS provider chain is used:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances and ECS tasks
///
/// # Example
/// ```rust,no_run
/// use folio_core::config::StorageTargetConfig;
/// use folio_core::storage::{S3StorageAdapter, StorageAdapter};
///
/// # async fn run() -> folio_core::Result<()> {
/// let mut target = StorageTargetConfig::s3_with_bucket("minio", "folio-backups");
/// target.endpoint = Some("http://localhost:9000".to_string());
/// target.force_path_style = true;
///
/// let adapter = S3StorageAdapter::from_config(&target).await?;
/// adapter.write("acme/s1.data", "bytes".into(), &Default::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3StorageAdapter {
    name: String,
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3StorageAdapter {
    /// Create an adapter from a storage target
    ///
    /// # Errors
    /// Returns an error if the target has no bucket or no credentials can be found.
    pub async fn from_config(target: &StorageTargetConfig) -> Result<Self> {
        let bucket = target
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| FolioError::validation(format!("S3 target '{}' requires a bucket", target.name)))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &target.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(access_key_id), Some(secret_access_key)) = (&target.access_key_id, &target.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "folio-static",
            ));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(FolioError::backend(
                &target.name,
                BackendErrorKind::PermissionDenied,
                "AWS credentials not found. Set access_key_id/secret_access_key on the target or AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY in the environment",
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(target.force_path_style);
        if let Some(endpoint) = &target.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = S3Client::from_conf(builder.build());

        info!(
            backend = %target.name,
            bucket = %bucket,
            endpoint = ?target.endpoint,
            force_path_style = target.force_path_style,
            "Initialized S3 storage adapter"
        );

        Ok(Self::with_client(&target.name, client, bucket, target.prefix.clone()))
    }

    /// Create an adapter around an already-configured client
    pub fn with_client(name: impl Into<String>, client: S3Client, bucket: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(&self, path: &str) -> String {
        join_key(self.prefix.as_deref(), path)
    }

    async fn put(&self, key: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_metadata(user_metadata(metadata))
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "put_object", e, key))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(user_metadata(metadata))
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "create_multipart_upload", e, key))?;

        let upload_id = upload
            .upload_id()
            .ok_or_else(|| FolioError::backend(&self.name, BackendErrorKind::Other, "S3 returned no multipart upload id"))?
            .to_string();

        let result = match self.upload_parts(key, &upload_id, &data).await {
            Ok(parts) => self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                .send()
                .await
                .map(|_| ())
                .map_err(|e| map_s3_error(&self.name, "complete_multipart_upload", e, key)),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(backend = %self.name, key = %key, error = %e, "aborting multipart upload");
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                error!(backend = %self.name, key = %key, error = ?abort_err, "failed to abort multipart upload");
            }
        }
        result
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, data: &Bytes) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut start = 0;
        let mut part_number = 1;

        while start < data.len() {
            let end = (start + PART_SIZE).min(data.len());
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data.slice(start..end)))
                .send()
                .await
                .map_err(|e| map_s3_error(&self.name, "upload_part", e, key))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            debug!(backend = %self.name, key = %key, part_number, size = end - start, "uploaded part");
            start = end;
            part_number += 1;
        }
        Ok(parts)
    }
}

fn user_metadata(metadata: &BTreeMap<String, String>) -> Option<HashMap<String, String>> {
    if metadata.is_empty() {
        None
    } else {
        Some(metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[async_trait]
impl StorageAdapter for S3StorageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, path: &str, data: Bytes, metadata: &BTreeMap<String, String>) -> Result<()> {
        let key = self.key(path);
        let size = data.len();
        debug!(backend = %self.name, bucket = %self.bucket, key = %key, size, "Saving object to S3");

        if size > MULTIPART_THRESHOLD {
            self.put_multipart(&key, data, metadata).await?;
        } else {
            self.put(&key, data, metadata).await?;
        }

        debug!(backend = %self.name, bucket = %self.bucket, key = %key, size, "Saved object to S3");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let key = self.key(path);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "get_object", e, &key))?;

        let data = output.body.collect().await.map_err(|e| {
            FolioError::backend(
                &self.name,
                BackendErrorKind::Transient,
                format!("Failed to read S3 object stream for '{key}': {e}"),
            )
        })?;
        Ok(data.into_bytes())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let key_prefix = self.key(prefix);
        let mut paths = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_s3_error(&self.name, "list_objects_v2", e, &key_prefix))?;

            paths.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(|key| strip_key_prefix(self.prefix.as_deref(), key))
                    .map(str::to_string),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.key(path);
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "delete_object", e, &key))
        {
            Ok(_) => Ok(()),
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
impl MetadataCapability for S3StorageAdapter {
    async fn metadata(&self, path: &str) -> Result<ObjectInfo> {
        let key = self.key(path);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "head_object", e, &key))?;

        Ok(ObjectInfo {
            path: path.to_string(),
            size: output.content_length().unwrap_or_default().max(0) as u64,
            last_modified: output
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
            metadata: output
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl CopyCapability for S3StorageAdapter {
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source_key = self.key(from);
        let target_key = self.key(to);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, &source_key))
            .key(&target_key)
            .send()
            .await
            .map_err(|e| map_s3_error(&self.name, "copy_object", e, &source_key))?;
        Ok(())
    }
}

/// `CopySource` header value: bucket and key, each key segment percent-encoded
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
    format!("{bucket}/{}", encoded.join("/"))
}

/// Map AWS SDK errors onto the storage error taxonomy
fn map_s3_error<E>(backend: &str, op: &str, error: SdkError<E>, key: &str) -> FolioError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &error {
        SdkError::DispatchFailure(dispatch_err) => FolioError::backend(
            backend,
            BackendErrorKind::Transient,
            format!("S3 {op} request failed to dispatch: {dispatch_err:?}"),
        ),
        SdkError::TimeoutError(_) => FolioError::backend(
            backend,
            BackendErrorKind::Transient,
            format!("S3 {op} request timed out (key: {key})"),
        ),
        SdkError::ResponseError(response_err) => FolioError::backend(
            backend,
            BackendErrorKind::Transient,
            format!("S3 {op} response error: {response_err:?}"),
        ),
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            let message = service_err.err().message().unwrap_or("Unknown error");
            match service_err.err().code() {
                Some("NoSuchKey") | Some("NotFound") => FolioError::not_found(key),
                Some("AccessDenied") | Some("Forbidden") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
                    FolioError::backend(
                        backend,
                        BackendErrorKind::PermissionDenied,
                        format!("Access denied to S3 on {op} (check credentials and permissions): {message}"),
                    )
                }
                Some("NoSuchBucket") | Some("InvalidBucketName") => FolioError::backend(
                    backend,
                    BackendErrorKind::InvalidRequest,
                    format!("S3 bucket unusable on {op}: {message}"),
                ),
                Some("SlowDown") | Some("InternalError") | Some("ServiceUnavailable") | Some("RequestTimeout") => {
                    FolioError::backend(
                        backend,
                        BackendErrorKind::Transient,
                        format!("S3 {op} failed with a retryable service error: {message}"),
                    )
                }
                _ if status == 404 => FolioError::not_found(key),
                _ if status == 401 || status == 403 => FolioError::backend(
                    backend,
                    BackendErrorKind::PermissionDenied,
                    format!("S3 {op} rejected with status {status}"),
                ),
                _ if is_transient_status(status) => FolioError::backend(
                    backend,
                    BackendErrorKind::Transient,
                    format!("S3 {op} failed with status {status}: {message}"),
                ),
                code => FolioError::backend(
                    backend,
                    BackendErrorKind::Other,
                    format!("S3 service error on {op} ({}): {message}", code.unwrap_or("no code")),
                ),
            }
        }
        _ => FolioError::backend(backend, BackendErrorKind::Other, format!("S3 {op} error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectError;

    #[test]
    fn test_timeout_is_transient() {
        let timeout_error = SdkError::<GetObjectError>::timeout_error("deadline elapsed");
        let mapped = map_s3_error("primary", "get_object", timeout_error, "acme/s1.data");

        assert!(mapped.is_transient());
        assert!(mapped.to_string().contains("timed out"));
        assert!(mapped.to_string().contains("acme/s1.data"));
    }

    #[test]
    fn test_construction_failure_is_not_retried() {
        let error = SdkError::<GetObjectError>::construction_failure("bad input");
        let mapped = map_s3_error("primary", "get_object", error, "acme/s1.data");
        assert!(!mapped.is_transient());
        assert!(!mapped.is_not_found());
    }

    #[test]
    fn test_copy_source_encodes_key_segments() {
        assert_eq!(copy_source("backups", "acme/s1.data"), "backups/acme/s1.data");
        assert_eq!(
            copy_source("backups", "acme/q3 plan+notes/é.data"),
            "backups/acme/q3%20plan%2Bnotes/%C3%A9.data"
        );
    }

    #[test]
    fn test_user_metadata_skips_empty_map() {
        assert!(user_metadata(&BTreeMap::new()).is_none());
        let map = BTreeMap::from([("tenant-id".to_string(), "acme".to_string())]);
        assert_eq!(user_metadata(&map).unwrap()["tenant-id"], "acme");
    }
}
