/*!
# Folio Core Engine

Capture, replication and change analysis for external workspace backups.

This crate provides:

- A rate-limited recursive crawler for the external workspace API
- Manifests with content hashes that ignore volatile metadata
- A storage contract with local, S3 and GCS adapters, plus a redundant
  adapter that replicates across a primary and its mirrors
- A snapshot pipeline that ties crawl, manifest, compression and storage
  together, and a reader for stored snapshots
- A diff engine with optional semantic escalation through content vectors

## Architecture

Each external dependency sits behind a trait: `WorkspaceApi` for the
workspace, `StorageAdapter` for backends, `CompressionAdapter` for artifact
encoding, `SimilarityProvider` for vectors and `ResultRecorder` for cycle
outcomes. Context objects are built once and passed in explicitly.

## Usage

```rust,no_run
use std::sync::Arc;
use folio_core::crawler::{Crawler, NotionApi};
use folio_core::{build_storage, FolioConfig, SnapshotPipeline, SnapshotTrigger};
use folio_retry::RetryPolicy;

# async fn run() -> folio_core::Result<()> {
let config = FolioConfig::from_toml_str(r#"
    [[target]]
    name = "disk"
    backend = "local"
    base_path = "/var/lib/folio"
"#)?;

let storage = Arc::new(build_storage(&config, RetryPolicy::default()).await?);
let api = NotionApi::new("secret-token", &config.crawler)?;
let crawler = Crawler::new(Arc::new(api), config.crawler.clone());
let pipeline = SnapshotPipeline::new(crawler, storage, config.pipeline.clone());

let record = pipeline.run(SnapshotTrigger::new("acme")).await?;
println!("{:?} {}", record.status, record.snapshot_id);
# Ok(())
# }
```
*/

pub mod compression;
pub mod config;
pub mod crawler;
pub mod diff;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod model;
pub mod observability;
pub mod snapshot;
pub mod storage;


pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{CrawlerConfig, DiffConfig, FolioConfig, PipelineConfig, StorageBackend, StorageTargetConfig};
pub use crawler::{CrawlOutcome, Crawler, PartialFailure, WorkspaceApi};
pub use diff::{diff, ChangeType, ChangedItem, DiffResult, SimilarityProvider, StaticVectors};
pub use error::{FolioError, Result};
pub use manifest::{build_manifest, Manifest, ManifestBuilder, ManifestEntry};
pub use metadata::SnapshotMetadata;
pub use model::{ItemKind, WorkspaceItem};
pub use snapshot::{
    JsonLinesRecorder, ResultRecorder, SnapshotFlag, SnapshotPipeline, SnapshotReader, SnapshotRecord,
    SnapshotStatus, SnapshotTrigger,
};
pub use storage::{build_storage, RedundantStorageAdapter, StorageAdapter};
#[cfg(feature = "local")]
pub use storage::LocalFileStorage;
