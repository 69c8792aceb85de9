//! Configuration for the crawler, the snapshot pipeline, the diff engine and
//! the set of storage targets a tenant replicates to.
//!
//! Configuration is read from a TOML file; every section has defaults so an
//! empty file plus one storage target is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::{FolioError, Result};

/// Hard page size ceiling imposed by the workspace API
pub const MAX_PAGE_SIZE: u32 = 100;

/// Average request rate the workspace API allows per integration
pub const API_REQUESTS_PER_SECOND: f64 = 3.0;

/// Enumeration of supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local filesystem storage
    Local,
    /// Amazon S3 or any S3-compatible object store
    S3,
    /// Google Cloud Storage
    Gcs,
}

/// Whether a target receives writes as the authoritative copy or as a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationRole {
    Primary,
    Mirror,
}

/// One configured storage backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageTargetConfig {
    /// Name used in logs and per-backend status reports
    pub name: String,
    pub backend: StorageBackend,
    #[serde(default = "default_role")]
    pub role: ReplicationRole,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket (S3) or bucket (GCS); required for cloud backends
    #[serde(default)]
    pub bucket: Option<String>,
    /// Key prefix inside the bucket
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, R2, LocalStack)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Service account JSON for GCS, already decrypted by the caller
    #[serde(default)]
    pub credentials_json: Option<String>,
    /// Root directory for the local backend
    #[serde(default)]
    pub base_path: Option<PathBuf>,
}

fn default_role() -> ReplicationRole {
    ReplicationRole::Primary
}

fn default_true() -> bool {
    true
}

impl StorageTargetConfig {
    /// A local filesystem target rooted at `base_path`
    pub fn local(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            backend: StorageBackend::Local,
            role: ReplicationRole::Primary,
            enabled: true,
            bucket: None,
            prefix: None,
            region: None,
            endpoint: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            credentials_json: None,
            base_path: Some(base_path.into()),
        }
    }

    /// An S3 target for `bucket` using ambient AWS credentials
    pub fn s3_with_bucket(name: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::S3,
            bucket: Some(bucket.into()),
            base_path: None,
            ..Self::local(name, PathBuf::new())
        }
    }

    /// A GCS target for `bucket` using ambient Google credentials
    pub fn gcs_with_bucket(name: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Gcs,
            ..Self::s3_with_bucket(name, bucket)
        }
    }

    /// Mark this target as a mirror
    pub fn as_mirror(mut self) -> Self {
        self.role = ReplicationRole::Mirror;
        self
    }

    /// Parse a storage URI into a target configuration
    ///
    /// Supports formats:
    /// - `s3://bucket-name/prefix` for S3 storage
    /// - `gs://bucket-name/prefix` for Google Cloud Storage
    /// - `/local/path` or `./relative/path` for local storage
    pub fn from_uri(name: impl Into<String>, uri: &str) -> Result<Self> {
        let name = name.into();
        let cloud = uri
            .strip_prefix("s3://")
            .map(|rest| (StorageBackend::S3, rest))
            .or_else(|| uri.strip_prefix("gs://").map(|rest| (StorageBackend::Gcs, rest)));

        match cloud {
            Some((backend, rest)) => {
                let mut parts = rest.splitn(2, '/');
                let bucket = parts.next().unwrap_or_default();
                if bucket.is_empty() {
                    return Err(FolioError::validation(format!(
                        "Invalid storage URI '{uri}': missing bucket name"
                    )));
                }
                let prefix = parts
                    .next()
                    .map(|p| p.trim_matches('/'))
                    .filter(|p| !p.is_empty())
                    .map(str::to_string);
                let mut config = match backend {
                    StorageBackend::Gcs => Self::gcs_with_bucket(name, bucket),
                    _ => Self::s3_with_bucket(name, bucket),
                };
                config.prefix = prefix;
                Ok(config)
            }
            None => Ok(Self::local(name, uri)),
        }
    }

    /// Validate the target configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FolioError::validation("storage target name cannot be empty"));
        }
        match self.backend {
            StorageBackend::S3 | StorageBackend::Gcs => {
                if self.bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(FolioError::validation(format!(
                        "storage target '{}' requires a bucket name",
                        self.name
                    )));
                }
                if self.access_key_id.is_some() != self.secret_access_key.is_some() {
                    return Err(FolioError::validation(format!(
                        "storage target '{}' must set both access_key_id and secret_access_key",
                        self.name
                    )));
                }
            }
            StorageBackend::Local => {
                if self.base_path.is_none() {
                    return Err(FolioError::validation(format!(
                        "local storage target '{}' requires a base_path",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Workspace crawler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    pub api_base_url: String,
    pub api_version: String,
    /// Admissions allowed per window; the external API allows 3 per second
    pub requests_per_window: u32,
    pub window_ms: u64,
    /// Requests allowed in flight at once
    pub max_concurrency: usize,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.notion.com/v1".to_string(),
            api_version: "2022-06-28".to_string(),
            requests_per_window: 3,
            window_ms: 1000,
            max_concurrency: 3,
            page_size: MAX_PAGE_SIZE,
            request_timeout_secs: 30,
        }
    }
}

impl CrawlerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Page size clamped to the API ceiling
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Configured admissions per second; 0 for a zero-length window
    pub fn requests_per_second(&self) -> f64 {
        if self.window_ms == 0 {
            return 0.0;
        }
        f64::from(self.requests_per_window) * 1000.0 / self.window_ms as f64
    }

    /// True when the configured rate is above what the external API accepts
    pub fn exceeds_api_rate(&self) -> bool {
        self.requests_per_second() > API_REQUESTS_PER_SECOND
    }
}

/// Capture cycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on one whole capture cycle
    pub cycle_timeout_secs: u64,
    /// Part of the cycle kept back for storage writes once crawling stops
    pub write_reserve_secs: u64,
    /// Gzip level, 0-9
    pub compression_level: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cycle_timeout_secs: 900,
            write_reserve_secs: 120,
            compression_level: 6,
        }
    }
}

impl PipelineConfig {
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    /// Time the crawler may use before it has to stop and leave room for writes
    pub fn crawl_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.saturating_sub(self.write_reserve_secs))
    }
}

/// Diff engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiffConfig {
    /// Cosine similarity at or above which a changed hash is treated as cosmetic
    pub similarity_threshold: f64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FolioConfig {
    pub crawler: CrawlerConfig,
    pub pipeline: PipelineConfig,
    pub diff: DiffConfig,
    #[serde(rename = "target")]
    pub targets: Vec<StorageTargetConfig>,
}

impl FolioConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FolioConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// The single enabled primary target
    pub fn primary(&self) -> Result<&StorageTargetConfig> {
        let mut primaries = self
            .targets
            .iter()
            .filter(|t| t.enabled && t.role == ReplicationRole::Primary);
        let primary = primaries
            .next()
            .ok_or_else(|| FolioError::validation("no enabled primary storage target configured"))?;
        if primaries.next().is_some() {
            return Err(FolioError::validation(
                "more than one enabled primary storage target configured",
            ));
        }
        Ok(primary)
    }

    /// Enabled mirror targets, in configured order
    pub fn mirrors(&self) -> impl Iterator<Item = &StorageTargetConfig> {
        self.targets
            .iter()
            .filter(|t| t.enabled && t.role == ReplicationRole::Mirror)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.primary()?;
        for target in self.targets.iter().filter(|t| t.enabled) {
            target.validate()?;
        }
        if self.crawler.requests_per_window == 0 {
            return Err(FolioError::validation("crawler.requests_per_window must be at least 1"));
        }
        if self.crawler.window_ms == 0 {
            return Err(FolioError::validation("crawler.window_ms must be at least 1"));
        }
        if self.crawler.max_concurrency == 0 {
            return Err(FolioError::validation("crawler.max_concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.diff.similarity_threshold) {
            return Err(FolioError::validation("diff.similarity_threshold must be within [0, 1]"));
        }
        if self.pipeline.compression_level > 9 {
            return Err(FolioError::validation("pipeline.compression_level must be within 0-9"));
        }
        if self.pipeline.write_reserve_secs >= self.pipeline.cycle_timeout_secs {
            return Err(FolioError::validation(format!(
                "pipeline.write_reserve_secs ({}) must be less than pipeline.cycle_timeout_secs ({})",
                self.pipeline.write_reserve_secs, self.pipeline.cycle_timeout_secs
            )));
        }
        if self.crawler.exceeds_api_rate() {
            warn!(
                requests_per_second = self.crawler.requests_per_second(),
                limit = API_REQUESTS_PER_SECOND,
                "crawler rate is above the workspace API limit; expect throttling"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_uri_s3() {
        let config = StorageTargetConfig::from_uri("backups", "s3://test-bucket/path/to").unwrap();
        assert_eq!(config.backend, StorageBackend::S3);
        assert_eq!(config.bucket.as_deref(), Some("test-bucket"));
        assert_eq!(config.prefix.as_deref(), Some("path/to"));
    }

    #[test]
    fn test_from_uri_gcs_bucket_only() {
        let config = StorageTargetConfig::from_uri("mirror", "gs://test-bucket").unwrap();
        assert_eq!(config.backend, StorageBackend::Gcs);
        assert_eq!(config.bucket.as_deref(), Some("test-bucket"));
        assert!(config.prefix.is_none());
    }

    #[test]
    fn test_from_uri_local() {
        let config = StorageTargetConfig::from_uri("disk", "/var/folio/snapshots").unwrap();
        assert_eq!(config.backend, StorageBackend::Local);
        assert_eq!(config.base_path, Some(PathBuf::from("/var/folio/snapshots")));
    }

    #[test]
    fn test_from_uri_invalid_s3() {
        let result = StorageTargetConfig::from_uri("broken", "s3://");
        assert!(result.unwrap_err().to_string().contains("missing bucket name"));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [crawler]
            requests_per_window = 3
            window_ms = 1000

            [pipeline]
            cycle_timeout_secs = 600

            [diff]
            similarity_threshold = 0.9

            [[target]]
            name = "primary-s3"
            backend = "s3"
            bucket = "folio-backups"
            region = "us-east-1"
            endpoint = "http://localhost:9000"
            force_path_style = true

            [[target]]
            name = "gcs-mirror"
            backend = "gcs"
            role = "mirror"
            bucket = "folio-mirror"

            [[target]]
            name = "disabled-mirror"
            backend = "local"
            role = "mirror"
            enabled = false
        "#;
        let config = FolioConfig::from_toml_str(toml).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.primary().unwrap().name, "primary-s3");
        assert!(config.primary().unwrap().force_path_style);
        let mirrors: Vec<&str> = config.mirrors().map(|m| m.name.as_str()).collect();
        assert_eq!(mirrors, vec!["gcs-mirror"]);
        assert_eq!(config.pipeline.cycle_timeout_secs, 600);
        assert_eq!(config.pipeline.write_reserve_secs, 120);
        assert_eq!(config.crawler.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.diff.similarity_threshold, 0.9);
    }

    #[test]
    fn test_validate_requires_single_primary() {
        let mut config = FolioConfig::default();
        assert!(config.validate().is_err());

        config.targets.push(StorageTargetConfig::local("a", "/tmp/a"));
        assert!(config.validate().is_ok());

        config.targets.push(StorageTargetConfig::local("b", "/tmp/b"));
        assert!(config.validate().is_err());

        config.targets[1] = StorageTargetConfig::local("b", "/tmp/b").as_mirror();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_cloud_target_needs_bucket() {
        let mut target = StorageTargetConfig::s3_with_bucket("s3", "bucket");
        assert!(target.validate().is_ok());

        target.bucket = Some(String::new());
        assert!(target.validate().is_err());

        target.bucket = None;
        assert!(target.validate().is_err());
    }

    #[test]
    fn test_page_size_is_clamped() {
        let crawler = CrawlerConfig {
            page_size: 500,
            ..CrawlerConfig::default()
        };
        assert_eq!(crawler.effective_page_size(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_crawl_budget_leaves_write_reserve() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.crawl_budget(), Duration::from_secs(780));
    }

    #[test]
    fn test_validate_rejects_reserve_consuming_whole_cycle() {
        let mut config = FolioConfig::default();
        config.targets.push(StorageTargetConfig::local("a", "/tmp/a"));
        config.pipeline.cycle_timeout_secs = 60;

        config.pipeline.write_reserve_secs = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("write_reserve_secs"));

        config.pipeline.write_reserve_secs = 90;
        assert!(config.validate().is_err());

        config.pipeline.write_reserve_secs = 59;
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.crawl_budget(), Duration::from_secs(1));
    }

    #[test]
    fn test_rate_above_api_limit_is_detected() {
        let crawler = CrawlerConfig::default();
        assert_eq!(crawler.requests_per_second(), 3.0);
        assert!(!crawler.exceeds_api_rate());

        let fast = CrawlerConfig {
            requests_per_window: 10,
            window_ms: 1000,
            ..CrawlerConfig::default()
        };
        assert!(fast.exceeds_api_rate());

        let spread = CrawlerConfig {
            requests_per_window: 9,
            window_ms: 3000,
            ..CrawlerConfig::default()
        };
        assert!(!spread.exceeds_api_rate());

        // Above the limit still validates; it only warns
        let mut config = FolioConfig::default();
        config.targets.push(StorageTargetConfig::local("a", "/tmp/a"));
        config.crawler = fast;
        assert!(config.validate().is_ok());
    }
}
