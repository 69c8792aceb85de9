/*!
Snapshot diff engine.

Two manifests are compared structurally by id and hash. Items whose hash
changed can then be escalated to a semantic comparison: each version's content
vectors are averaged into one representative vector and the two are compared
by cosine similarity. A high similarity means the hash moved without a
meaningful content change.

The diff never mutates its inputs, and the same manifests and vectors always
produce the same result.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::DiffConfig;
use crate::manifest::{vector_keys, Manifest};
use crate::{FolioError, Result};

/// Source of stored content vectors, keyed as in [`vector_keys`]
#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    /// Vectors for the given keys; absent keys are simply missing from the map
    async fn fetch_vectors(&self, keys: &[String]) -> Result<HashMap<String, Vec<f32>>>;
}

/// In-memory vector store
///
/// The JSON form is a single object mapping vector keys to number arrays:
/// `{"s1:page-1:title": [0.1, 0.2]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticVectors {
    vectors: HashMap<String, Vec<f32>>,
}

impl StaticVectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, vector: Vec<f32>) {
        self.vectors.insert(key.into(), vector);
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json_slice(&bytes)
    }
}

impl From<HashMap<String, Vec<f32>>> for StaticVectors {
    fn from(vectors: HashMap<String, Vec<f32>>) -> Self {
        Self { vectors }
    }
}

#[async_trait]
impl SimilarityProvider for StaticVectors {
    async fn fetch_vectors(&self, keys: &[String]) -> Result<HashMap<String, Vec<f32>>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.vectors.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// The hash changed but the content is effectively the same
    HashOnlySimilar,
    /// The content changed meaningfully
    SemanticDivergence,
    /// No vectors were available for one of the versions
    NoEmbeddingsFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedItem {
    pub id: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
}

/// Result of comparing two manifests; all lists are sorted by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub from_snapshot: String,
    pub to_snapshot: String,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub changed: Vec<ChangedItem>,
}

/// Counts for display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub deleted: usize,
    pub changed: usize,
    pub hash_only_similar: usize,
    pub semantic_divergence: usize,
    pub no_embeddings_found: usize,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary {
            added: self.added.len(),
            deleted: self.deleted.len(),
            changed: self.changed.len(),
            ..DiffSummary::default()
        };
        for item in &self.changed {
            match item.change_type {
                ChangeType::HashOnlySimilar => summary.hash_only_similar += 1,
                ChangeType::SemanticDivergence => summary.semantic_divergence += 1,
                ChangeType::NoEmbeddingsFound => summary.no_embeddings_found += 1,
            }
        }
        summary
    }
}

/// Component-wise mean of `vectors`
///
/// `None` when there are no vectors or their dimensions disagree.
pub fn mean_vector(vectors: &[&[f32]]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dims = first.len();
    if vectors.iter().any(|v| v.len() != dims) {
        warn!(dims, "vectors of one item have different dimensions");
        return None;
    }

    let mut sum = vec![0.0f64; dims];
    for vector in vectors {
        for (acc, value) in sum.iter_mut().zip(vector.iter()) {
            *acc += f64::from(*value);
        }
    }
    let count = vectors.len() as f64;
    Some(sum.into_iter().map(|total| (total / count) as f32).collect())
}

/// `dot(a, b) / (|a| * |b|)`, or 0 when either magnitude is zero
///
/// ```rust
/// use folio_core::diff::cosine_similarity;
///
/// assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-9);
/// assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        warn!(left = a.len(), right = b.len(), "cannot compare vectors of different dimensions");
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Ids only in `to`, ids only in `from`, and ids whose hash changed
fn partition(from: &Manifest, to: &Manifest) -> (Vec<String>, Vec<String>, Vec<String>) {
    let added = to
        .entries
        .keys()
        .filter(|id| !from.entries.contains_key(*id))
        .cloned()
        .collect();

    let mut deleted = Vec::new();
    let mut candidates = Vec::new();
    for (id, entry) in &from.entries {
        match to.entries.get(id) {
            None => deleted.push(id.clone()),
            Some(other) if other.hash != entry.hash => candidates.push(id.clone()),
            Some(_) => {}
        }
    }
    (added, deleted, candidates)
}

/// Hash-only diff; every changed item is reported as `hash_only_similar` without a score
pub fn diff_structural(from: &Manifest, to: &Manifest) -> DiffResult {
    let (added, deleted, candidates) = partition(from, to);
    DiffResult {
        from_snapshot: from.snapshot_id.clone(),
        to_snapshot: to.snapshot_id.clone(),
        added,
        deleted,
        changed: candidates
            .into_iter()
            .map(|id| ChangedItem {
                id,
                change_type: ChangeType::HashOnlySimilar,
                similarity_score: None,
            })
            .collect(),
    }
}

/// Representative vector of one item version, if any of its vectors were found
fn representative(keys: &[String], vectors: &HashMap<String, Vec<f32>>) -> Option<Vec<f32>> {
    let found: Vec<&[f32]> = keys
        .iter()
        .filter_map(|key| vectors.get(key))
        .filter(|v| !v.is_empty())
        .map(Vec::as_slice)
        .collect();
    mean_vector(&found)
}

/// Compare two manifests, escalating hash changes through `provider` when one is given
///
/// Vectors are fetched in one batch per side. A provider failure fails the diff.
pub async fn diff(
    from: &Manifest,
    to: &Manifest,
    provider: Option<&dyn SimilarityProvider>,
    config: &DiffConfig,
) -> Result<DiffResult> {
    let Some(provider) = provider else {
        return Ok(diff_structural(from, to));
    };

    let (added, deleted, candidates) = partition(from, to);

    let keyed: Vec<(String, Vec<String>, Vec<String>)> = candidates
        .into_iter()
        .filter_map(|id| {
            let old = vector_keys(&from.snapshot_id, &id, from.get(&id)?);
            let new = vector_keys(&to.snapshot_id, &id, to.get(&id)?);
            Some((id, old, new))
        })
        .collect();

    let from_vectors = fetch_batch(provider, keyed.iter().map(|(_, old, _)| old)).await?;
    let to_vectors = fetch_batch(provider, keyed.iter().map(|(_, _, new)| new)).await?;

    let changed = keyed
        .into_iter()
        .map(|(id, old_keys, new_keys)| {
            let old = representative(&old_keys, &from_vectors);
            let new = representative(&new_keys, &to_vectors);
            match (old, new) {
                (Some(old), Some(new)) => {
                    let score = cosine_similarity(&old, &new);
                    let change_type = if score >= config.similarity_threshold {
                        ChangeType::HashOnlySimilar
                    } else {
                        ChangeType::SemanticDivergence
                    };
                    ChangedItem {
                        id,
                        change_type,
                        similarity_score: Some(score),
                    }
                }
                _ => ChangedItem {
                    id,
                    change_type: ChangeType::NoEmbeddingsFound,
                    similarity_score: None,
                },
            }
        })
        .collect();

    let result = DiffResult {
        from_snapshot: from.snapshot_id.clone(),
        to_snapshot: to.snapshot_id.clone(),
        added,
        deleted,
        changed,
    };
    debug!(summary = ?result.summary(), "diff computed");
    Ok(result)
}

async fn fetch_batch<'k>(
    provider: &dyn SimilarityProvider,
    keys: impl Iterator<Item = &'k Vec<String>>,
) -> Result<HashMap<String, Vec<f32>>> {
    let flat: Vec<String> = keys.flatten().cloned().collect();
    if flat.is_empty() {
        return Ok(HashMap::new());
    }
    provider
        .fetch_vectors(&flat)
        .await
        .map_err(|e| match e {
            FolioError::Similarity(_) => e,
            other => FolioError::Similarity(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{EmbeddingFlags, ManifestEntry};
    use crate::model::ItemKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(hash: &str, kind: ItemKind, total_chunks: usize) -> ManifestEntry {
        ManifestEntry {
            hash: hash.to_string(),
            kind,
            name: "item".to_string(),
            block_subtype: None,
            parent_id: None,
            embedding_flags: EmbeddingFlags {
                title: kind.is_page_like(),
                description: false,
                chunks: total_chunks > 0,
            },
            total_chunks,
        }
    }

    fn manifest(snapshot: &str, entries: &[(&str, &str)]) -> Manifest {
        let mut manifest = Manifest::empty("acme", snapshot);
        for (id, hash) in entries {
            manifest.entries.insert(id.to_string(), entry(hash, ItemKind::Page, 0));
        }
        manifest
    }

    #[tokio::test]
    async fn test_diff_against_itself_is_empty() {
        let m = manifest("s1", &[("a", "h1"), ("b", "h2")]);
        let result = diff(&m, &m, None, &DiffConfig::default()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_added_and_deleted() {
        let from = manifest("s1", &[("a", "hashX"), ("b", "hashY")]);
        let to = manifest("s2", &[("a", "hashX"), ("c", "hashZ")]);

        let result = diff(&from, &to, None, &DiffConfig::default()).await.unwrap();

        assert_eq!(result.added, vec!["c"]);
        assert_eq!(result.deleted, vec!["b"]);
        assert!(result.changed.is_empty());

        let reverse = diff(&to, &from, None, &DiffConfig::default()).await.unwrap();
        assert_eq!(reverse.added, vec!["b"]);
        assert_eq!(reverse.deleted, vec!["c"]);
    }

    #[tokio::test]
    async fn test_changed_without_provider() {
        let from = manifest("s1", &[("a", "hash1")]);
        let to = manifest("s2", &[("a", "hash2")]);

        let result = diff(&from, &to, None, &DiffConfig::default()).await.unwrap();

        assert_eq!(
            result.changed,
            vec![ChangedItem {
                id: "a".to_string(),
                change_type: ChangeType::HashOnlySimilar,
                similarity_score: None,
            }]
        );
        let json = serde_json::to_value(&result.changed[0]).unwrap();
        assert_eq!(json["change_type"], "hash_only_similar");
        assert!(json.get("similarity_score").is_none());
    }

    #[tokio::test]
    async fn test_semantic_escalation() {
        let from = manifest("s1", &[("same", "h1"), ("moved", "h2"), ("bare", "h3")]);
        let to = manifest("s2", &[("same", "h1b"), ("moved", "h2b"), ("bare", "h3b")]);

        let mut vectors = StaticVectors::new();
        vectors.insert("s1:same:title", vec![1.0, 0.0, 0.0]);
        vectors.insert("s2:same:title", vec![1.0, 0.01, 0.0]);
        vectors.insert("s1:moved:title", vec![1.0, 0.0, 0.0]);
        vectors.insert("s2:moved:title", vec![0.0, 1.0, 0.0]);
        vectors.insert("s1:bare:title", vec![1.0, 0.0, 0.0]);

        let result = diff(&from, &to, Some(&vectors), &DiffConfig::default()).await.unwrap();

        let by_id: HashMap<_, _> = result.changed.iter().map(|c| (c.id.as_str(), c)).collect();
        assert_eq!(by_id["same"].change_type, ChangeType::HashOnlySimilar);
        assert!(by_id["same"].similarity_score.unwrap() > 0.99);
        assert_eq!(by_id["moved"].change_type, ChangeType::SemanticDivergence);
        assert!(by_id["moved"].similarity_score.unwrap().abs() < 1e-9);
        assert_eq!(by_id["bare"].change_type, ChangeType::NoEmbeddingsFound);
        assert_eq!(by_id["bare"].similarity_score, None);

        let summary = result.summary();
        assert_eq!(summary.changed, 3);
        assert_eq!(summary.hash_only_similar, 1);
        assert_eq!(summary.semantic_divergence, 1);
        assert_eq!(summary.no_embeddings_found, 1);
    }

    #[tokio::test]
    async fn test_block_chunks_are_averaged() {
        let mut from = Manifest::empty("acme", "s1");
        from.entries.insert("b".into(), entry("h1", ItemKind::Block, 2));
        let mut to = Manifest::empty("acme", "s2");
        to.entries.insert("b".into(), entry("h2", ItemKind::Block, 1));

        let mut vectors = StaticVectors::new();
        vectors.insert("s1:b:chunk:0", vec![1.0, 0.0]);
        vectors.insert("s1:b:chunk:1", vec![0.0, 1.0]);
        vectors.insert("s2:b:chunk:0", vec![0.5, 0.5]);

        let result = diff(&from, &to, Some(&vectors), &DiffConfig::default()).await.unwrap();

        assert_eq!(result.changed[0].change_type, ChangeType::HashOnlySimilar);
        assert!((result.changed[0].similarity_score.unwrap() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_repeated_diff_is_identical() {
        let from = manifest("s1", &[("a", "h1"), ("b", "h2"), ("c", "h3")]);
        let to = manifest("s2", &[("a", "h1x"), ("c", "h3"), ("d", "h4")]);
        let mut vectors = StaticVectors::new();
        vectors.insert("s1:a:title", vec![0.3, 0.7]);
        vectors.insert("s2:a:title", vec![0.7, 0.3]);

        let before = from.clone();

        let first = diff(&from, &to, Some(&vectors), &DiffConfig::default()).await.unwrap();
        let second = diff(&from, &to, Some(&vectors), &DiffConfig::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(from, before);
    }

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SimilarityProvider for CountingProvider {
        async fn fetch_vectors(&self, _keys: &[String]) -> Result<HashMap<String, Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FolioError::Api {
                    status: Some(503),
                    message: "vector store down".into(),
                    transient: true,
                });
            }
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn test_vectors_fetched_once_per_side() {
        let from = manifest("s1", &[("a", "h1"), ("b", "h2")]);
        let to = manifest("s2", &[("a", "h1x"), ("b", "h2x")]);
        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        let result = diff(&from, &to, Some(&provider), &DiffConfig::default()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(result
            .changed
            .iter()
            .all(|c| c.change_type == ChangeType::NoEmbeddingsFound));
    }

    #[tokio::test]
    async fn test_provider_failure_fails_diff() {
        let from = manifest("s1", &[("a", "h1")]);
        let to = manifest("s2", &[("a", "h2")]);
        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
            fail: true,
        };

        let err = diff(&from, &to, Some(&provider), &DiffConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FolioError::Similarity(_)));
    }

    #[test]
    fn test_cosine_similarity() {
        let v = [0.2f32, -1.5, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&v, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&v, &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_vector() {
        let a: &[f32] = &[1.0, 3.0];
        let b: &[f32] = &[3.0, 5.0];
        let short: &[f32] = &[1.0];
        assert_eq!(mean_vector(&[a, b]), Some(vec![2.0, 4.0]));
        assert_eq!(mean_vector(&[]), None);
        assert_eq!(mean_vector(&[short, a]), None);
    }

    #[test]
    fn test_static_vectors_from_json() {
        let vectors = StaticVectors::from_json_slice(br#"{"s1:a:title": [0.5, 0.5]}"#).unwrap();
        assert_eq!(vectors.len(), 1);
        assert!(StaticVectors::from_json_slice(b"[1, 2]").is_err());
    }
}
