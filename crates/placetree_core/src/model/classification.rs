//! Classification tree records.
//!
//! # Responsibility
//! - Describe classification tags ("trees") and the nodes that form them.
//! - Provide the pure set arithmetic behind `used_trees` maintenance.
//!
//! # Invariants
//! - A node belongs to exactly one tag for its whole lifetime.
//! - A node's parent, when present, belongs to the same tag.
//! - A node either references a place directly or aliases a node of another tag.
//! - `used_trees(T)` equals the set of tags targeted by aliases owned by `T`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Stable classification node identifier.
pub type NodeId = Uuid;

/// One classification scheme, identified by slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationTag {
    pub slug: String,
    pub label: String,
    pub description: Option<String>,
}

/// What a node stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target")]
pub enum NodeContent {
    /// Node references one place by slug.
    Direct(String),
    /// Node is an `equivalent_to` alias of a node in a different tag.
    Alias(NodeId),
}

impl NodeContent {
    pub fn place_slug(&self) -> Option<&str> {
        match self {
            Self::Direct(slug) => Some(slug.as_str()),
            Self::Alias(_) => None,
        }
    }

    pub fn equivalent_to(&self) -> Option<NodeId> {
        match self {
            Self::Direct(_) => None,
            Self::Alias(target) => Some(*target),
        }
    }
}

/// Classification node read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationNode {
    pub node_uuid: NodeId,
    /// Owning tag slug.
    pub tag: String,
    /// `None` means the node is a root of its tag.
    pub parent_uuid: Option<NodeId>,
    pub content: NodeContent,
    pub note: Option<String>,
    /// Sibling tie-break; lower sorts first.
    pub priority: i64,
    /// Insertion order among siblings.
    pub sort_order: i64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Epoch ms creation timestamp.
    pub created_at: i64,
    /// Epoch ms update timestamp.
    pub updated_at: i64,
}

/// Input for creating a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    /// Preassigned id; a fresh v4 id is drawn when `None`.
    pub node_uuid: Option<NodeId>,
    pub tag: String,
    pub content: NodeContent,
    pub parent_uuid: Option<NodeId>,
    pub note: Option<String>,
    pub priority: i64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl NewNode {
    /// Node referencing `place_slug` directly.
    pub fn direct(tag: impl Into<String>, place_slug: impl Into<String>) -> Self {
        Self::with_content(tag, NodeContent::Direct(place_slug.into()))
    }

    /// Node aliasing `target` in another tag.
    pub fn alias(tag: impl Into<String>, target: NodeId) -> Self {
        Self::with_content(tag, NodeContent::Alias(target))
    }

    fn with_content(tag: impl Into<String>, content: NodeContent) -> Self {
        Self {
            node_uuid: None,
            tag: tag.into(),
            content,
            parent_uuid: None,
            note: None,
            priority: 0,
            start_date: None,
            end_date: None,
        }
    }

    pub fn with_id(mut self, node_uuid: NodeId) -> Self {
        self.node_uuid = Some(node_uuid);
        self
    }

    pub fn under(mut self, parent_uuid: NodeId) -> Self {
        self.parent_uuid = Some(parent_uuid);
        self
    }

    pub fn starting(mut self, start_date: impl Into<String>) -> Self {
        self.start_date = Some(start_date.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Partial update of a node. `None` fields are left unchanged.
///
/// `parent_uuid: Some(None)` moves the node to root level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    pub content: Option<NodeContent>,
    pub parent_uuid: Option<Option<NodeId>>,
    pub note: Option<Option<String>>,
    pub priority: Option<i64>,
    pub start_date: Option<Option<String>>,
    pub end_date: Option<Option<String>>,
}

/// Changes applied by one `used_trees` maintenance run, both sorted by slug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsedTreesReport {
    pub tag: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl UsedTreesReport {
    /// Returns whether the stored relation was already aligned.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes the edits that turn `stored` into `current`.
///
/// Returns `(to_add, to_remove)`: tags currently targeted but not stored,
/// and tags stored but no longer targeted.
pub fn used_trees_diff(
    current: &BTreeSet<String>,
    stored: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let to_add = current.difference(stored).cloned().collect();
    let to_remove = stored.difference(current).cloned().collect();
    (to_add, to_remove)
}
