/*!
Manifest builder.

A manifest is the compact `item id -> entry` index of one snapshot. It is stored
as its own artifact so two snapshots can be compared without decompressing and
parsing either bulk data artifact.

The per-item hash covers only semantically relevant content. Timestamps, editor
references and URLs change without any content edit, so they are stripped
(recursively) before hashing; otherwise every snapshot would report spurious
changes. Children are referenced by id only, since each child carries its own
hash.
*/

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::metadata::compute_hash;
use crate::model::{flatten_all, ItemKind, WorkspaceItem};
use crate::{FolioError, Result};

/// Keys excluded from the content hash at any depth of the raw payload
pub const VOLATILE_KEYS: &[&str] = &[
    "last_edited_time",
    "created_time",
    "last_edited_by",
    "created_by",
    "last_viewed_time",
    "request_id",
    "url",
    "public_url",
];

/// Characters per embedding chunk
pub const DEFAULT_CHUNK_CHARS: usize = 2000;

/// Which embeddings exist for an item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingFlags {
    pub title: bool,
    pub description: bool,
    pub chunks: bool,
}

/// One item's record in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub hash: String,
    pub kind: ItemKind,
    /// Best-effort display title
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub embedding_flags: EmbeddingFlags,
    /// Number of text chunks produced for embedding
    #[serde(default)]
    pub total_chunks: usize,
}

/// Index of one snapshot, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub tenant_id: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// An empty manifest, mostly useful for tests and for diffing against "nothing"
    pub fn empty(tenant_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            snapshot_id: snapshot_id.into(),
            created_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ManifestEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Item ids in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if manifest.snapshot_id.is_empty() {
            return Err(FolioError::invalid_format("manifest has no snapshot id"));
        }
        Ok(manifest)
    }
}

/// Remove volatile keys from a JSON value, at every depth
fn strip_volatile(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !VOLATILE_KEYS.contains(&key.as_str()))
                .map(|(key, inner)| (key.clone(), strip_volatile(inner)))
                .collect(),
        ),
        Value::Array(values) => Value::Array(values.iter().map(strip_volatile).collect()),
        other => other.clone(),
    }
}

/// The hash input for one item
#[derive(Serialize)]
struct CanonicalContent<'a> {
    kind: ItemKind,
    subtype: Option<&'a str>,
    content: Value,
    children: Vec<&'a str>,
}

/// Canonical byte form of an item's semantic content
///
/// `serde_json::Map` keeps keys sorted, so the output does not depend on the
/// key order of the API response.
pub fn canonical_content(item: &WorkspaceItem) -> Result<Vec<u8>> {
    let canonical = CanonicalContent {
        kind: item.kind,
        subtype: item.block_subtype.as_deref(),
        content: strip_volatile(&item.raw),
        children: item.child_ids(),
    };
    Ok(serde_json::to_vec(&canonical)?)
}

/// Content hash of one item; identical for semantically identical content
pub fn content_hash(item: &WorkspaceItem) -> Result<String> {
    Ok(compute_hash(&canonical_content(item)?))
}

/// Split text into chunks of at most `max_chars` characters
///
/// Paragraphs (separated by blank lines) are packed together while they fit;
/// an oversized paragraph is hard-split on the last whitespace before the
/// limit. Empty or whitespace-only text yields no chunks. The embedding writer
/// must use this same function so `total_chunks` matches the stored vectors.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let paragraph_len = paragraph.chars().count();
        let current_len = current.chars().count();

        let would_be = if current.is_empty() {
            paragraph_len
        } else {
            current_len + 2 + paragraph_len
        };
        if would_be > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if paragraph_len > max_chars {
            split_long_paragraph(paragraph, max_chars, &mut chunks);
            continue;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long_paragraph(paragraph: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let chars: Vec<char> = paragraph.chars().collect();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());
        if end < chars.len() {
            if let Some(space) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                if space > 0 {
                    end = start + space + 1;
                }
            }
        }
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        start = end;
    }
}

/// Builds manifests from crawled item trees
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    chunk_chars: usize,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            chunk_chars: DEFAULT_CHUNK_CHARS,
        }
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    pub fn chunk_chars(&self) -> usize {
        self.chunk_chars
    }

    /// Build the entry for a single item
    pub fn entry_for(&self, item: &WorkspaceItem) -> Result<ManifestEntry> {
        let hash = content_hash(item)?;
        let title = item.title();
        let description = item.description();

        let total_chunks = match item.kind {
            ItemKind::Block => chunk_text(&item.plain_text(), self.chunk_chars).len(),
            _ => 0,
        };

        let name = title.clone().unwrap_or_else(|| match &item.block_subtype {
            Some(subtype) => subtype.clone(),
            None => "Untitled".to_string(),
        });

        Ok(ManifestEntry {
            hash,
            kind: item.kind,
            name,
            block_subtype: item.block_subtype.clone(),
            parent_id: item.parent_id.clone(),
            embedding_flags: EmbeddingFlags {
                title: item.kind.is_page_like() && title.is_some(),
                description: description.is_some(),
                chunks: total_chunks > 0,
            },
            total_chunks,
        })
    }

    /// Reduce a crawled forest to a manifest keyed by item id
    pub fn build(
        &self,
        tenant_id: &str,
        snapshot_id: &str,
        created_at: DateTime<Utc>,
        items: &[WorkspaceItem],
    ) -> Result<Manifest> {
        let flattened: Vec<&WorkspaceItem> = flatten_all(items).collect();

        let built: Vec<(String, ManifestEntry)> = flattened
            .par_iter()
            .map(|item| self.entry_for(item).map(|entry| (item.id.clone(), entry)))
            .collect::<Result<_>>()?;

        let mut entries = BTreeMap::new();
        for (id, entry) in built {
            if entries.insert(id.clone(), entry).is_some() {
                warn!(item_id = %id, "item appears more than once in the crawl; keeping the last occurrence");
            }
        }

        debug!(tenant_id, snapshot_id, entries = entries.len(), "built manifest");

        Ok(Manifest {
            tenant_id: tenant_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            created_at,
            entries,
        })
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a manifest stamped with the current time, using the default chunk size
pub fn build_manifest(tenant_id: &str, snapshot_id: &str, items: &[WorkspaceItem]) -> Result<Manifest> {
    ManifestBuilder::new().build(tenant_id, snapshot_id, Utc::now(), items)
}

/// Identifiers of the vectors an item owns in a given snapshot
///
/// Page-like items own a title and/or description vector; blocks own one
/// vector per chunk.
pub fn vector_keys(snapshot_id: &str, item_id: &str, entry: &ManifestEntry) -> Vec<String> {
    if entry.kind.is_page_like() {
        let mut keys = Vec::with_capacity(2);
        if entry.embedding_flags.title {
            keys.push(format!("{snapshot_id}:{item_id}:title"));
        }
        if entry.embedding_flags.description {
            keys.push(format!("{snapshot_id}:{item_id}:description"));
        }
        keys
    } else {
        (0..entry.total_chunks)
            .map(|index| format!("{snapshot_id}:{item_id}:chunk:{index}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(id: &str, text: &str, edited: &str) -> WorkspaceItem {
        WorkspaceItem::from_api_object(json!({
            "object": "block",
            "id": id,
            "type": "paragraph",
            "has_children": false,
            "created_time": "2024-01-01T00:00:00.000Z",
            "last_edited_time": edited,
            "last_edited_by": {"object": "user", "id": "u-1"},
            "paragraph": {"rich_text": [{"plain_text": text}], "color": "default"}
        }))
        .unwrap()
    }

    fn page(id: &str, title: &str) -> WorkspaceItem {
        WorkspaceItem::from_api_object(json!({
            "object": "page",
            "id": id,
            "url": format!("https://example.invalid/{id}"),
            "properties": {"Name": {"type": "title", "title": [{"plain_text": title}]}}
        }))
        .unwrap()
    }

    #[test]
    fn test_hash_ignores_volatile_metadata() {
        let a = block("b1", "same text", "2024-05-01T10:00:00.000Z");
        let b = block("b1", "same text", "2024-06-11T08:30:00.000Z");
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_changes_with_text() {
        let a = block("b1", "before", "2024-05-01T10:00:00.000Z");
        let b = block("b1", "after", "2024-05-01T10:00:00.000Z");
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_is_independent_of_key_order() {
        let a = WorkspaceItem::from_api_object(json!({
            "object": "block", "id": "b1", "type": "to_do",
            "to_do": {"checked": false, "rich_text": [{"plain_text": "x"}]}
        }))
        .unwrap();
        let b = WorkspaceItem::from_api_object(
            serde_json::from_str(
                r#"{"to_do": {"rich_text": [{"plain_text": "x"}], "checked": false}, "type": "to_do", "id": "b1", "object": "block"}"#,
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_tracks_child_references() {
        let mut parent = page("p1", "Roadmap");
        let before = content_hash(&parent).unwrap();
        parent.children.push(block("b1", "x", "2024-05-01T10:00:00.000Z"));
        assert_ne!(before, content_hash(&parent).unwrap());
    }

    #[test]
    fn test_chunk_text_packs_paragraphs() {
        let text = "alpha beta\n\ngamma\n\n\n\ndelta";
        assert_eq!(chunk_text(text, 100), vec!["alpha beta\n\ngamma\n\ndelta"]);
        assert_eq!(chunk_text(text, 12), vec!["alpha beta", "gamma\n\ndelta"]);
    }

    #[test]
    fn test_chunk_text_splits_long_paragraph_on_whitespace() {
        let chunks = chunk_text("one two three four five", 9);
        assert_eq!(chunks, vec!["one two", "three", "four five"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 9));
    }

    #[test]
    fn test_chunk_text_empty() {
        assert!(chunk_text("", 10).is_empty());
        assert!(chunk_text("  \n\n  ", 10).is_empty());
    }

    #[test]
    fn test_build_manifest_flattens_tree() {
        let mut root = page("p1", "Roadmap");
        let mut child = block("b1", "first", "2024-05-01T10:00:00.000Z");
        child.has_children = true;
        child.children.push(block("b2", "nested", "2024-05-01T10:00:00.000Z"));
        root.children.push(child);

        let manifest = ManifestBuilder::new()
            .build("acme", "snap-1", Utc::now(), &[root])
            .unwrap();

        assert_eq!(manifest.ids().collect::<Vec<_>>(), vec!["b1", "b2", "p1"]);
        let page_entry = manifest.get("p1").unwrap();
        assert_eq!(page_entry.name, "Roadmap");
        assert!(page_entry.embedding_flags.title);
        assert_eq!(page_entry.total_chunks, 0);

        let block_entry = manifest.get("b2").unwrap();
        assert_eq!(block_entry.kind, ItemKind::Block);
        assert_eq!(block_entry.total_chunks, 1);
        assert!(block_entry.embedding_flags.chunks);
        assert_eq!(block_entry.name, "paragraph");
    }

    #[test]
    fn test_unchanged_items_hash_identically_across_builds() {
        let first = vec![page("p1", "Roadmap"), page("p2", "Notes")];
        let second = vec![page("p1", "Roadmap"), page("p2", "Notes v2")];
        let builder = ManifestBuilder::new();

        let a = builder.build("acme", "s1", Utc::now(), &first).unwrap();
        let b = builder.build("acme", "s2", Utc::now(), &second).unwrap();

        assert_eq!(a.get("p1").unwrap().hash, b.get("p1").unwrap().hash);
        assert_ne!(a.get("p2").unwrap().hash, b.get("p2").unwrap().hash);
    }

    #[test]
    fn test_chunk_count_follows_builder_setting() {
        let text = "word ".repeat(100);
        let item = block("b1", &text, "2024-05-01T10:00:00.000Z");
        let entry = ManifestBuilder::new().with_chunk_chars(100).entry_for(&item).unwrap();
        assert_eq!(entry.total_chunks, chunk_text(&item.plain_text(), 100).len());
        assert!(entry.total_chunks > 1);
    }

    #[test]
    fn test_vector_keys() {
        let builder = ManifestBuilder::new();
        let page_entry = builder.entry_for(&page("p1", "Roadmap")).unwrap();
        assert_eq!(vector_keys("s1", "p1", &page_entry), vec!["s1:p1:title"]);

        let mut block_entry = builder
            .entry_for(&block("b1", "text", "2024-05-01T10:00:00.000Z"))
            .unwrap();
        block_entry.total_chunks = 2;
        assert_eq!(
            vector_keys("s1", "b1", &block_entry),
            vec!["s1:b1:chunk:0", "s1:b1:chunk:1"]
        );
    }

    #[test]
    fn test_manifest_bytes_roundtrip_rejects_missing_snapshot() {
        let manifest = Manifest::empty("acme", "");
        let bytes = manifest.to_bytes().unwrap();
        assert!(Manifest::from_bytes(&bytes).is_err());
    }
}
