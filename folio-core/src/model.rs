/*!
Workspace item model.

Items arrive from the external workspace API as loosely-typed JSON objects. Only
the structural fields the crawler and the manifest builder need are parsed
eagerly; the full object is kept as an opaque attribute bag so the snapshot can
re-serialize exactly what was received.
*/

use crate::{FolioError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of node in the workspace tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Page,
    Database,
    Block,
}

impl ItemKind {
    /// Pages and databases carry title/description embeddings; blocks carry chunk embeddings.
    pub fn is_page_like(self) -> bool {
        matches!(self, ItemKind::Page | ItemKind::Database)
    }

    fn from_object(object: &str) -> Option<Self> {
        match object {
            "page" => Some(ItemKind::Page),
            "database" => Some(ItemKind::Database),
            "block" => Some(ItemKind::Block),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ItemKind::Page => "page",
            ItemKind::Database => "database",
            ItemKind::Block => "block",
        };
        f.write_str(label)
    }
}

/// One node of the external workspace tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceItem {
    /// Opaque external identifier
    pub id: String,

    pub kind: ItemKind,

    /// Block type such as `paragraph` or `heading_1`; only set for blocks
    pub block_subtype: Option<String>,

    /// Identifier of the parent page, database or block, when the API reports one
    pub parent_id: Option<String>,

    pub has_children: bool,

    /// Children in API order, populated by the crawler
    #[serde(default)]
    pub children: Vec<WorkspaceItem>,

    /// The object exactly as received from the API
    pub raw: Value,
}

impl WorkspaceItem {
    /// Parse the structural fields of an API object, keeping the object itself as `raw`.
    pub fn from_api_object(raw: Value) -> Result<Self> {
        let object = raw
            .get("object")
            .and_then(Value::as_str)
            .ok_or_else(|| FolioError::invalid_format("workspace object has no `object` field"))?;
        let kind = ItemKind::from_object(object)
            .ok_or_else(|| FolioError::invalid_format(format!("unknown workspace object type `{object}`")))?;
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FolioError::invalid_format(format!("{object} object has no id")))?
            .to_string();

        let block_subtype = match kind {
            ItemKind::Block => raw.get("type").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };

        let parent_id = raw.get("parent").and_then(parent_reference);

        // Databases always have rows to expand, even though the API has no flag for it.
        let has_children = match kind {
            ItemKind::Database => true,
            _ => raw.get("has_children").and_then(Value::as_bool).unwrap_or(false),
        };

        Ok(Self {
            id,
            kind,
            block_subtype,
            parent_id,
            has_children,
            children: Vec::new(),
            raw,
        })
    }

    /// Best-effort display title
    pub fn title(&self) -> Option<String> {
        let text = match self.kind {
            ItemKind::Page => self
                .raw
                .get("properties")
                .and_then(Value::as_object)
                .and_then(|props| {
                    props
                        .values()
                        .find(|prop| prop.get("type").and_then(Value::as_str) == Some("title"))
                })
                .and_then(|prop| prop.get("title"))
                .map(rich_text_plain),
            ItemKind::Database => self.raw.get("title").map(rich_text_plain),
            ItemKind::Block => {
                let subtype = self.block_subtype.as_deref()?;
                let body = self.raw.get(subtype)?;
                match subtype {
                    "child_page" | "child_database" => body.get("title").and_then(Value::as_str).map(str::to_string),
                    "heading_1" | "heading_2" | "heading_3" => body.get("rich_text").map(rich_text_plain),
                    _ => None,
                }
            }
        }?;
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    /// Database description text, if any
    pub fn description(&self) -> Option<String> {
        if self.kind != ItemKind::Database {
            return None;
        }
        let text = self.raw.get("description").map(rich_text_plain)?;
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    /// Body text of a block: its rich text runs concatenated
    pub fn plain_text(&self) -> String {
        let Some(subtype) = self.block_subtype.as_deref() else {
            return String::new();
        };
        let Some(body) = self.raw.get(subtype) else {
            return String::new();
        };
        let mut text = body.get("rich_text").map(rich_text_plain).unwrap_or_default();
        if let Some(caption) = body.get("caption") {
            let caption = rich_text_plain(caption);
            if !caption.is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&caption);
            }
        }
        text
    }

    /// Identifiers of direct children, in order
    pub fn child_ids(&self) -> Vec<&str> {
        self.children.iter().map(|child| child.id.as_str()).collect()
    }

    /// Depth-first iterator over this item and all of its descendants, parent first
    pub fn flatten(&self) -> Flatten<'_> {
        Flatten { stack: vec![self] }
    }

    /// Total number of nodes in this subtree, including this one
    pub fn subtree_len(&self) -> usize {
        self.flatten().count()
    }
}

/// Depth-first pre-order traversal over a workspace tree
pub struct Flatten<'a> {
    stack: Vec<&'a WorkspaceItem>,
}

impl<'a> Iterator for Flatten<'a> {
    type Item = &'a WorkspaceItem;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.stack.pop()?;
        self.stack.extend(item.children.iter().rev());
        Some(item)
    }
}

/// Flatten a forest of top-level items into one depth-first sequence
pub fn flatten_all(items: &[WorkspaceItem]) -> impl Iterator<Item = &WorkspaceItem> {
    items.iter().flat_map(WorkspaceItem::flatten)
}

fn parent_reference(parent: &Value) -> Option<String> {
    let parent_type = parent.get("type").and_then(Value::as_str)?;
    match parent_type {
        "page_id" | "database_id" | "block_id" | "data_source_id" => {
            parent.get(parent_type).and_then(Value::as_str).map(str::to_string)
        }
        _ => None,
    }
}

/// Concatenate the `plain_text` of every run in a rich text array
pub(crate) fn rich_text_plain(value: &Value) -> String {
    value
        .as_array()
        .map(|runs| {
            runs.iter()
                .filter_map(|run| run.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}
