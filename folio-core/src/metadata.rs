/*!
Snapshot artifact metadata and integrity helpers.
*/

use crate::{FolioError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Current artifact format version for compatibility tracking
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// Metadata stored alongside the item collection inside the data artifact
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMetadata {
    /// Tenant the workspace belongs to
    pub tenant_id: String,

    pub snapshot_id: String,

    /// When the capture cycle started
    pub timestamp: DateTime<Utc>,

    /// Number of items across the whole tree, not only top-level ones
    pub item_count: usize,

    /// SHA-256 of the canonical, uncompressed item bytes
    pub payload_hash: String,

    pub uncompressed_size: usize,

    /// Size of the stored artifact; only known once the container is compressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<usize>,

    /// Compression algorithm used
    pub compression_algorithm: String,

    /// Format version for compatibility (current: 1)
    pub format_version: u8,
}

impl SnapshotMetadata {
    /// Create metadata for a new capture of `tenant_id`
    ///
    /// ```rust
    /// use folio_core::SnapshotMetadata;
    ///
    /// let metadata = SnapshotMetadata::new("acme", "2024-05-01-nightly");
    /// assert_eq!(metadata.tenant_id, "acme");
    /// assert_eq!(metadata.item_count, 0);
    /// ```
    pub fn new<S1, S2>(tenant_id: S1, snapshot_id: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            tenant_id: tenant_id.into(),
            snapshot_id: snapshot_id.into(),
            timestamp: Utc::now(),
            item_count: 0,
            payload_hash: String::new(),
            uncompressed_size: 0,
            compressed_size: None,
            compression_algorithm: "gzip".to_string(),
            format_version: METADATA_FORMAT_VERSION,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_item_count(mut self, item_count: usize) -> Self {
        self.item_count = item_count;
        self
    }

    /// Set the payload hash and uncompressed size from the canonical item bytes
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload_hash = compute_hash(payload);
        self.uncompressed_size = payload.len();
        self
    }

    pub fn with_compressed_size(mut self, compressed_size: usize) -> Self {
        self.compressed_size = Some(compressed_size);
        self
    }

    /// Set the compression algorithm
    pub fn with_compression_algorithm<S: Into<String>>(mut self, algorithm: S) -> Self {
        self.compression_algorithm = algorithm.into();
        self
    }

    /// Verify canonical item bytes against the stored payload hash
    pub fn verify_integrity(&self, payload: &[u8]) -> Result<()> {
        let computed_hash = compute_hash(payload);
        if computed_hash == self.payload_hash {
            Ok(())
        } else {
            Err(FolioError::IntegrityCheckFailed {
                expected: self.payload_hash.clone(),
                actual: computed_hash,
            })
        }
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.is_empty() {
            return Err(FolioError::validation("tenant_id cannot be empty"));
        }
        if self.snapshot_id.is_empty() {
            return Err(FolioError::validation("snapshot_id cannot be empty"));
        }
        if self.payload_hash.is_empty() {
            return Err(FolioError::validation("payload_hash cannot be empty"));
        }
        Ok(())
    }

    /// Check if this metadata is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= METADATA_FORMAT_VERSION
    }

    /// Object metadata attached to the stored artifact
    ///
    /// `content_digest` is the digest of the compressed bytes actually stored.
    pub fn object_metadata(&self, content_digest: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("tenant-id".to_string(), self.tenant_id.clone()),
            ("snapshot-id".to_string(), self.snapshot_id.clone()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
            ("item-count".to_string(), self.item_count.to_string()),
            ("content-digest".to_string(), content_digest.to_string()),
            ("format-version".to_string(), self.format_version.to_string()),
        ])
    }
}

/// Hex-encoded SHA-256 of `data`
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_creation() {
        let metadata = SnapshotMetadata::new("acme", "snap-1");
        assert_eq!(metadata.tenant_id, "acme");
        assert_eq!(metadata.snapshot_id, "snap-1");
        assert_eq!(metadata.format_version, METADATA_FORMAT_VERSION);
        assert!(metadata.payload_hash.is_empty());
    }

    #[test]
    fn test_content_hash() {
        // SHA-256 of "test data" should be consistent
        assert_eq!(
            compute_hash(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_integrity_verification() {
        let payload = br#"[{"id":"p1"}]"#;
        let metadata = SnapshotMetadata::new("acme", "snap-1").with_payload(payload);

        assert_eq!(metadata.uncompressed_size, payload.len());
        assert!(metadata.verify_integrity(payload).is_ok());
        assert!(matches!(
            metadata.verify_integrity(br#"[{"id":"p2"}]"#),
            Err(FolioError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let metadata = SnapshotMetadata::new("acme", "snap-1");
        assert!(metadata.validate().is_err());

        let mut metadata = metadata.with_payload(b"[]");
        assert!(metadata.validate().is_ok());

        metadata.tenant_id = String::new();
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_object_metadata_carries_digest() {
        let metadata = SnapshotMetadata::new("acme", "snap-1").with_item_count(12);
        let object = metadata.object_metadata("abc123");

        assert_eq!(object["content-digest"], "abc123");
        assert_eq!(object["item-count"], "12");
        assert_eq!(object["tenant-id"], "acme");
    }

    #[test]
    fn test_future_format_is_incompatible() {
        let mut metadata = SnapshotMetadata::new("acme", "snap-1");
        assert!(metadata.is_compatible());
        metadata.format_version = METADATA_FORMAT_VERSION + 1;
        assert!(!metadata.is_compatible());
    }
}
