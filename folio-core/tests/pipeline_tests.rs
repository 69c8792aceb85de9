/*!
End-to-end tests for the snapshot cycle.

A fixture workspace stands in for the external API; storage targets are real
local directories, one primary and one mirror.
*/

#![cfg(feature = "local")]

use async_trait::async_trait;
use folio_core::crawler::ApiPage;
use folio_core::diff::diff_structural;
use folio_core::{
    build_storage, diff, ChangeType, Crawler, CrawlerConfig, FolioConfig, FolioError, JsonLinesRecorder,
    SimilarityProvider, SnapshotFlag, SnapshotPipeline, SnapshotReader, SnapshotStatus, SnapshotTrigger, StaticVectors,
    StorageAdapter, WorkspaceApi,
};
use folio_retry::RetryPolicy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// An in-memory workspace: top-level pages plus a children listing per id
#[derive(Default)]
struct FixtureWorkspace {
    top_level: Vec<Value>,
    children: HashMap<String, Vec<Value>>,
}

impl FixtureWorkspace {
    fn page(mut self, id: &str, title: &str) -> Self {
        self.top_level.push(json!({
            "object": "page",
            "id": id,
            "parent": {"type": "workspace", "workspace": true},
            "last_edited_time": "2024-05-01T00:00:00.000Z",
            "properties": {"Name": {"type": "title", "title": [{"plain_text": title}]}}
        }));
        self
    }

    fn paragraph(mut self, parent: &str, id: &str, text: &str) -> Self {
        self.children.entry(parent.to_string()).or_default().push(json!({
            "object": "block",
            "id": id,
            "type": "paragraph",
            "parent": {"type": "page_id", "page_id": parent},
            "has_children": false,
            "paragraph": {"rich_text": [{"plain_text": text}]}
        }));
        self
    }
}

#[async_trait]
impl WorkspaceApi for FixtureWorkspace {
    async fn search(&self, _cursor: Option<String>) -> folio_core::Result<ApiPage> {
        Ok(ApiPage {
            results: self.top_level.clone(),
            next_cursor: None,
        })
    }

    async fn list_children(&self, block_id: String, _cursor: Option<String>) -> folio_core::Result<ApiPage> {
        Ok(ApiPage {
            results: self.children.get(&block_id).cloned().unwrap_or_default(),
            next_cursor: None,
        })
    }

    async fn query_database(&self, database_id: String, _cursor: Option<String>) -> folio_core::Result<ApiPage> {
        Err(FolioError::not_found(format!("notion:{database_id}")))
    }
}

fn two_target_config(primary: &Path, mirror: &Path) -> FolioConfig {
    let toml = format!(
        r#"
        [crawler]
        requests_per_window = 100
        max_concurrency = 8

        [[target]]
        name = "primary-disk"
        backend = "local"
        base_path = '{}'

        [[target]]
        name = "mirror-disk"
        backend = "local"
        role = "mirror"
        base_path = '{}'
        "#,
        primary.display(),
        mirror.display()
    );
    let config = FolioConfig::from_toml_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

fn crawler_for(workspace: FixtureWorkspace, config: &CrawlerConfig) -> Crawler {
    Crawler::new(Arc::new(workspace), config.clone())
}

fn original_workspace() -> FixtureWorkspace {
    FixtureWorkspace::default()
        .page("p1", "Roadmap")
        .paragraph("p1", "b1", "Ship the importer in May")
        .paragraph("p1", "b2", "Hire two engineers")
        .page("p2", "Notes")
}

fn edited_workspace() -> FixtureWorkspace {
    FixtureWorkspace::default()
        .page("p1", "Roadmap")
        .paragraph("p1", "b1", "Ship the importer in June")
        .page("p3", "Retro")
}

struct Harness {
    _primary_dir: TempDir,
    _mirror_dir: TempDir,
    primary_path: std::path::PathBuf,
    mirror_path: std::path::PathBuf,
    config: FolioConfig,
}

impl Harness {
    fn new() -> Self {
        let primary_dir = TempDir::new().unwrap();
        let mirror_dir = TempDir::new().unwrap();
        let config = two_target_config(primary_dir.path(), mirror_dir.path());
        Self {
            primary_path: primary_dir.path().to_path_buf(),
            mirror_path: mirror_dir.path().to_path_buf(),
            _primary_dir: primary_dir,
            _mirror_dir: mirror_dir,
            config,
        }
    }

    async fn pipeline(&self, workspace: FixtureWorkspace) -> SnapshotPipeline {
        let storage = Arc::new(build_storage(&self.config, RetryPolicy::none()).await.unwrap());
        SnapshotPipeline::new(
            crawler_for(workspace, &self.config.crawler),
            storage,
            self.config.pipeline.clone(),
        )
    }

    async fn reader(&self) -> SnapshotReader {
        let storage: Arc<dyn StorageAdapter> =
            Arc::new(build_storage(&self.config, RetryPolicy::none()).await.unwrap());
        SnapshotReader::new(storage)
    }
}

#[tokio::test]
async fn test_snapshot_cycle_replicates_to_every_target() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(original_workspace()).await;

    let record = pipeline
        .run(SnapshotTrigger::new("acme").with_snapshot_id("s1"))
        .await
        .unwrap();

    assert_eq!(record.status, SnapshotStatus::Completed);
    assert!(record.flags.is_empty());
    assert_eq!(record.item_count, 4);
    assert!(record.content_digest.is_some());
    assert!(record.size_bytes > 0);
    assert_eq!(record.per_backend_status.len(), 2);
    assert!(record.per_backend_status.iter().all(|s| s.ok));

    for base in [&harness.primary_path, &harness.mirror_path] {
        assert!(base.join("acme/s1.data").is_file());
        assert!(base.join("acme/s1.manifest").is_file());
    }
}

#[tokio::test]
async fn test_stored_snapshot_reads_back_and_verifies() {
    let harness = Harness::new();
    harness
        .pipeline(original_workspace())
        .await
        .run(SnapshotTrigger::new("acme").with_snapshot_id("s1"))
        .await
        .unwrap();

    let reader = harness.reader().await;
    assert_eq!(reader.list_snapshots("acme").await.unwrap(), vec!["s1".to_string()]);

    let manifest = reader.load_manifest("acme", "s1").await.unwrap();
    let ids: Vec<&str> = manifest.ids().collect();
    assert_eq!(ids, vec!["b1", "b2", "p1", "p2"]);

    let metadata = reader.verify_snapshot("acme", "s1").await.unwrap();
    assert_eq!(metadata.item_count, 4);

    let (_, items) = reader.load_items("acme", "s1").await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].children.len(), 2);
}

#[tokio::test]
async fn test_read_falls_back_to_mirror_when_primary_lost_artifacts() {
    let harness = Harness::new();
    harness
        .pipeline(original_workspace())
        .await
        .run(SnapshotTrigger::new("acme").with_snapshot_id("s1"))
        .await
        .unwrap();

    std::fs::remove_file(harness.primary_path.join("acme/s1.data")).unwrap();
    std::fs::remove_file(harness.primary_path.join("acme/s1.manifest")).unwrap();

    let reader = harness.reader().await;
    let metadata = reader.verify_snapshot("acme", "s1").await.unwrap();
    assert_eq!(metadata.snapshot_id, "s1");
}

#[tokio::test]
async fn test_tampered_artifact_fails_verification() {
    let harness = Harness::new();
    harness
        .pipeline(original_workspace())
        .await
        .run(SnapshotTrigger::new("acme").with_snapshot_id("s1"))
        .await
        .unwrap();

    std::fs::write(harness.primary_path.join("acme/s1.data"), b"not a snapshot").unwrap();

    let reader = harness.reader().await;
    assert!(reader.verify_snapshot("acme", "s1").await.is_err());
}

#[tokio::test]
async fn test_diff_between_two_cycles() {
    let harness = Harness::new();
    harness
        .pipeline(original_workspace())
        .await
        .run(SnapshotTrigger::new("acme").with_snapshot_id("s1"))
        .await
        .unwrap();
    harness
        .pipeline(edited_workspace())
        .await
        .run(SnapshotTrigger::new("acme").with_snapshot_id("s2"))
        .await
        .unwrap();

    let reader = harness.reader().await;
    let from = reader.load_manifest("acme", "s1").await.unwrap();
    let to = reader.load_manifest("acme", "s2").await.unwrap();

    let structural = diff_structural(&from, &to);
    assert_eq!(structural.added, vec!["p3".to_string()]);
    assert_eq!(structural.deleted, vec!["b2".to_string(), "p2".to_string()]);
    // p1 lost a child, so its hash moved along with b1's
    let changed: Vec<&str> = structural.changed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(changed, vec!["b1", "p1"]);

    // b1 barely moved in vector space
    let mut vectors = StaticVectors::new();
    vectors.insert("s1:b1:chunk:0", vec![1.0, 0.0, 0.0]);
    vectors.insert("s2:b1:chunk:0", vec![0.99, 0.05, 0.0]);

    let semantic = diff(&from, &to, Some(&vectors as &dyn SimilarityProvider), &harness.config.diff)
        .await
        .unwrap();
    assert_eq!(semantic.changed[0].change_type, ChangeType::HashOnlySimilar);
    assert!(semantic.changed[0].similarity_score.unwrap() > 0.95);
    assert_eq!(semantic.changed[1].change_type, ChangeType::NoEmbeddingsFound);

    let empty = StaticVectors::new();
    let without_vectors = diff(&from, &to, Some(&empty as &dyn SimilarityProvider), &harness.config.diff)
        .await
        .unwrap();
    assert!(without_vectors
        .changed
        .iter()
        .all(|c| c.change_type == ChangeType::NoEmbeddingsFound));
}

#[tokio::test]
async fn test_empty_workspace_records_failed_cycle() {
    let harness = Harness::new();
    let record_dir = TempDir::new().unwrap();
    let record_path = record_dir.path().join("cycles.jsonl");

    let pipeline = harness
        .pipeline(FixtureWorkspace::default())
        .await
        .with_recorder(Arc::new(JsonLinesRecorder::new(&record_path)));
    let record = pipeline.run(SnapshotTrigger::new("acme")).await.unwrap();

    assert_eq!(record.status, SnapshotStatus::Failed);
    assert!(record.has_flag(SnapshotFlag::EmptyWorkspace));
    assert!(!harness.primary_path.join("acme").exists());

    let lines = std::fs::read_to_string(&record_path).unwrap();
    assert_eq!(lines.lines().count(), 1);
    let logged: Value = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
    assert_eq!(logged["status"], "Failed");
    assert_eq!(logged["flags"][0], "empty_workspace");
}

#[tokio::test]
async fn test_delete_removes_snapshot_everywhere() {
    let harness = Harness::new();
    harness
        .pipeline(original_workspace())
        .await
        .run(SnapshotTrigger::new("acme").with_snapshot_id("s1"))
        .await
        .unwrap();

    let reader = harness.reader().await;
    reader.delete_snapshot("acme", "s1").await.unwrap();

    assert!(reader.list_snapshots("acme").await.unwrap().is_empty());
    for base in [&harness.primary_path, &harness.mirror_path] {
        assert!(!base.join("acme/s1.data").exists());
        assert!(!base.join("acme/s1.manifest").exists());
    }
    assert!(reader.load_manifest("acme", "s1").await.unwrap_err().is_not_found());
}
