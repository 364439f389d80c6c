//! Classification tree repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist tags, nodes and the derived `used_trees` relation.
//! - Keep `used_trees` aligned on every node write, inside the write's transaction.
//!
//! # Invariants
//! - Sibling listing is deterministic: `priority ASC, sort_order ASC, node_uuid ASC`.
//! - `(parent, tag, start_date)` is unique when `start_date` is set.
//! - `(place, tag)` is unique.
//! - After any node write commits, `used_trees(T)` equals the set of tags
//!   targeted by `equivalent_to` links of nodes owned by `T`.

use crate::db::{schema_ready, DbError, SchemaCheck};
use crate::model::classification::{
    used_trees_diff, ClassificationNode, ClassificationTag, NewNode, NodeContent, NodeId,
    NodeUpdate, UsedTreesReport,
};
use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const NODE_SELECT_SQL: &str = "SELECT
    n.node_uuid AS node_uuid,
    n.tag_slug AS tag_slug,
    n.parent_uuid AS parent_uuid,
    n.place_slug AS place_slug,
    n.equivalent_to_uuid AS equivalent_to_uuid,
    n.note AS note,
    n.priority AS priority,
    n.sort_order AS sort_order,
    n.start_date AS start_date,
    n.end_date AS end_date,
    n.created_at AS created_at,
    n.updated_at AS updated_at
FROM classification_nodes n";

const SIBLING_ORDER_SQL: &str = "ORDER BY n.priority ASC, n.sort_order ASC, n.node_uuid ASC";

const REQUIRED_TABLES: &[&str] = &[
    "classification_tags",
    "classification_used_trees",
    "classification_nodes",
];

/// Upper bound on parent-chain walks; deeper chains are treated as corrupt.
const MAX_TREE_DEPTH: i64 = 4096;

/// Result type used by classification repository operations.
pub type ClassificationRepoResult<T> = Result<T, ClassificationRepoError>;

/// Errors from classification repository operations.
#[derive(Debug)]
pub enum ClassificationRepoError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Tag slug does not exist.
    TagNotFound(String),
    /// Tag slug is already taken.
    DuplicateTag(String),
    /// Node id does not exist.
    NodeNotFound(NodeId),
    /// Another sibling under the same parent and tag has the same start date.
    DuplicateSibling {
        tag: String,
        parent_uuid: Option<NodeId>,
        start_date: String,
    },
    /// The place already has a node in this tag.
    DuplicatePlaceInTag { tag: String, place_slug: String },
    /// Re-parenting would make a node its own ancestor.
    ParentCycle {
        node_uuid: NodeId,
        parent_uuid: NodeId,
    },
    /// Re-pointing would close an `equivalent_to` loop through this node.
    AliasCycle(NodeId),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Persisted data cannot be converted to valid read model.
    InvalidData(String),
}

impl Display for ClassificationRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::TagNotFound(slug) => write!(f, "classification tag not found: {slug}"),
            Self::DuplicateTag(slug) => write!(f, "classification tag already exists: {slug}"),
            Self::NodeNotFound(id) => write!(f, "classification node not found: {id}"),
            Self::DuplicateSibling {
                tag,
                parent_uuid,
                start_date,
            } => match parent_uuid {
                Some(parent) => write!(
                    f,
                    "tag {tag} already has a child of {parent} starting {start_date}"
                ),
                None => write!(f, "tag {tag} already has a root starting {start_date}"),
            },
            Self::DuplicatePlaceInTag { tag, place_slug } => {
                write!(f, "place {place_slug} already has a node in tag {tag}")
            }
            Self::ParentCycle {
                node_uuid,
                parent_uuid,
            } => write!(
                f,
                "node {node_uuid} cannot move under its descendant {parent_uuid}"
            ),
            Self::AliasCycle(id) => write!(f, "equivalent_to of node {id} would close a loop"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "classification repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "classification repository requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid classification data: {message}"),
        }
    }
}

impl Error for ClassificationRepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for ClassificationRepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for ClassificationRepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Raw link columns of one node.
///
/// Unlike [`ClassificationNode`] this is readable for malformed rows that
/// carry neither (or both) a place and an `equivalent_to` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub node_uuid: NodeId,
    pub tag: String,
    pub place_slug: Option<String>,
    pub equivalent_to: Option<NodeId>,
}

/// Repository interface for classification trees.
pub trait ClassificationRepository {
    /// Creates one tag with an empty `used_trees` relation.
    fn create_tag(&self, tag: &ClassificationTag) -> ClassificationRepoResult<ClassificationTag>;
    fn get_tag(&self, slug: &str) -> ClassificationRepoResult<Option<ClassificationTag>>;
    /// Lists all tags sorted by slug.
    fn list_tags(&self) -> ClassificationRepoResult<Vec<ClassificationTag>>;
    /// Reads the stored `used_trees` slugs of one tag, sorted.
    fn used_trees(&self, tag: &str) -> ClassificationRepoResult<Vec<String>>;
    /// Inserts one node and aligns `used_trees` of its tag atomically.
    fn insert_node(&self, node: &NewNode) -> ClassificationRepoResult<ClassificationNode>;
    /// Inserts `nodes` in order inside one transaction; any failure writes nothing.
    ///
    /// A node may use an earlier node of the batch as parent when both carry
    /// preassigned ids.
    fn insert_nodes(&self, nodes: &[NewNode]) -> ClassificationRepoResult<Vec<ClassificationNode>>;
    /// Applies one partial update and aligns `used_trees` of its tag atomically.
    ///
    /// Re-parent and alias loops are rejected inside the same transaction.
    fn update_node(
        &self,
        node_uuid: NodeId,
        update: &NodeUpdate,
    ) -> ClassificationRepoResult<ClassificationNode>;
    fn get_node(&self, node_uuid: NodeId) -> ClassificationRepoResult<Option<ClassificationNode>>;
    fn get_node_link(&self, node_uuid: NodeId) -> ClassificationRepoResult<Option<NodeLink>>;
    /// Lists direct children in sibling order.
    fn list_children(&self, parent_uuid: NodeId) -> ClassificationRepoResult<Vec<ClassificationNode>>;
    /// Lists parentless nodes of one tag in sibling order.
    fn list_roots(&self, tag: &str) -> ClassificationRepoResult<Vec<ClassificationNode>>;
    /// Lists ancestors ordered root first, excluding the node itself.
    fn list_ancestors(&self, node_uuid: NodeId) -> ClassificationRepoResult<Vec<ClassificationNode>>;
    /// Lists nodes of `tag` that reference `place_slug` directly.
    fn find_direct_nodes(
        &self,
        tag: &str,
        place_slug: &str,
    ) -> ClassificationRepoResult<Vec<ClassificationNode>>;
    /// Lists alias nodes of `tag` whose target belongs to one of `target_tags`.
    fn list_aliases_into(
        &self,
        tag: &str,
        target_tags: &[String],
    ) -> ClassificationRepoResult<Vec<ClassificationNode>>;
    /// Recomputes `used_trees` of one tag from its current alias links.
    fn maintain_used_trees(&self, tag: &str) -> ClassificationRepoResult<UsedTreesReport>;
}

/// SQLite-backed classification repository.
pub struct SqliteClassificationRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteClassificationRepository<'conn> {
    /// Creates repository from migrated connection.
    pub fn try_new(conn: &'conn Connection) -> ClassificationRepoResult<Self> {
        match schema_ready(conn, REQUIRED_TABLES)? {
            SchemaCheck::Ready => Ok(Self { conn }),
            SchemaCheck::VersionMismatch {
                expected_version,
                actual_version,
            } => Err(ClassificationRepoError::UninitializedConnection {
                expected_version,
                actual_version,
            }),
            SchemaCheck::MissingTable(table) => {
                Err(ClassificationRepoError::MissingRequiredTable(table))
            }
        }
    }
}

impl ClassificationRepository for SqliteClassificationRepository<'_> {
    fn create_tag(&self, tag: &ClassificationTag) -> ClassificationRepoResult<ClassificationTag> {
        if self.get_tag(&tag.slug)?.is_some() {
            return Err(ClassificationRepoError::DuplicateTag(tag.slug.clone()));
        }
        self.conn.execute(
            "INSERT INTO classification_tags (slug, label, description) VALUES (?1, ?2, ?3);",
            params![tag.slug.as_str(), tag.label.as_str(), tag.description.as_deref()],
        )?;
        Ok(tag.clone())
    }

    fn get_tag(&self, slug: &str) -> ClassificationRepoResult<Option<ClassificationTag>> {
        let tag = self
            .conn
            .query_row(
                "SELECT slug, label, description
                 FROM classification_tags
                 WHERE slug = ?1;",
                [slug],
                parse_tag_row,
            )
            .optional()?;
        Ok(tag)
    }

    fn list_tags(&self) -> ClassificationRepoResult<Vec<ClassificationTag>> {
        let mut stmt = self.conn.prepare(
            "SELECT slug, label, description
             FROM classification_tags
             ORDER BY slug ASC;",
        )?;
        let rows = stmt.query_map([], parse_tag_row)?;
        let mut items = Vec::new();
        for tag in rows {
            items.push(tag?);
        }
        Ok(items)
    }

    fn used_trees(&self, tag: &str) -> ClassificationRepoResult<Vec<String>> {
        if self.get_tag(tag)?.is_none() {
            return Err(ClassificationRepoError::TagNotFound(tag.to_string()));
        }
        Ok(stored_used_trees(self.conn, tag)?.into_iter().collect())
    }

    fn insert_node(&self, node: &NewNode) -> ClassificationRepoResult<ClassificationNode> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let node_uuid = insert_row(&tx, node)?;
        let report = sync_used_trees(&tx, &node.tag)?;
        let saved = load_required_node(&tx, node_uuid)?;
        tx.commit()?;

        log_node_save("insert", &saved, &report);
        Ok(saved)
    }

    fn insert_nodes(&self, nodes: &[NewNode]) -> ClassificationRepoResult<Vec<ClassificationNode>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            ids.push(insert_row(&tx, node)?);
        }

        let tags: BTreeSet<&str> = nodes.iter().map(|node| node.tag.as_str()).collect();
        let mut changed = Vec::new();
        for tag in tags {
            let report = sync_used_trees(&tx, tag)?;
            if !report.is_noop() {
                changed.push(report.tag);
            }
        }

        let mut saved = Vec::with_capacity(ids.len());
        for node_uuid in ids {
            saved.push(load_required_node(&tx, node_uuid)?);
        }
        tx.commit()?;

        info!(
            "event=node_save module=classification status=ok op=insert_batch count={} used_trees_changed={}",
            saved.len(),
            changed.join(",")
        );
        Ok(saved)
    }

    fn update_node(
        &self,
        node_uuid: NodeId,
        update: &NodeUpdate,
    ) -> ClassificationRepoResult<ClassificationNode> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let current = load_required_node(&tx, node_uuid)?;

        let content = update.content.clone().unwrap_or_else(|| current.content.clone());
        let parent_uuid = update.parent_uuid.unwrap_or(current.parent_uuid);
        let note = update.note.clone().unwrap_or_else(|| current.note.clone());
        let priority = update.priority.unwrap_or(current.priority);
        let start_date = update
            .start_date
            .clone()
            .unwrap_or_else(|| current.start_date.clone());
        let end_date = update
            .end_date
            .clone()
            .unwrap_or_else(|| current.end_date.clone());

        if let Some(parent) = parent_uuid.filter(|_| update.parent_uuid.is_some()) {
            if parent_chain_contains(&tx, parent, node_uuid)? {
                return Err(ClassificationRepoError::ParentCycle {
                    node_uuid,
                    parent_uuid: parent,
                });
            }
        }
        if let Some(NodeContent::Alias(target)) = &update.content {
            if alias_chain_contains(&tx, *target, node_uuid)? {
                return Err(ClassificationRepoError::AliasCycle(node_uuid));
            }
        }

        ensure_unique_slot(
            &tx,
            node_uuid,
            &current.tag,
            parent_uuid,
            start_date.as_deref(),
            content.place_slug(),
        )?;
        let sort_order = if parent_uuid == current.parent_uuid {
            current.sort_order
        } else {
            next_sort_order(&tx, &current.tag, parent_uuid)?
        };

        tx.execute(
            "UPDATE classification_nodes
             SET parent_uuid = ?2,
                 place_slug = ?3,
                 equivalent_to_uuid = ?4,
                 note = ?5,
                 priority = ?6,
                 sort_order = ?7,
                 start_date = ?8,
                 end_date = ?9,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE node_uuid = ?1;",
            params![
                node_uuid.to_string(),
                parent_uuid.map(|value| value.to_string()),
                content.place_slug(),
                content.equivalent_to().map(|value| value.to_string()),
                note.as_deref(),
                priority,
                sort_order,
                start_date.as_deref(),
                end_date.as_deref(),
            ],
        )?;

        let report = sync_used_trees(&tx, &current.tag)?;
        let saved = load_required_node(&tx, node_uuid)?;
        tx.commit()?;

        log_node_save("update", &saved, &report);
        Ok(saved)
    }

    fn get_node(&self, node_uuid: NodeId) -> ClassificationRepoResult<Option<ClassificationNode>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{NODE_SELECT_SQL} WHERE n.node_uuid = ?1;"))?;
        let mut rows = stmt.query([node_uuid.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_node_row(row)?));
        }
        Ok(None)
    }

    fn get_node_link(&self, node_uuid: NodeId) -> ClassificationRepoResult<Option<NodeLink>> {
        let raw = self
            .conn
            .query_row(
                "SELECT tag_slug, place_slug, equivalent_to_uuid
                 FROM classification_nodes
                 WHERE node_uuid = ?1;",
                [node_uuid.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((tag, place_slug, equivalent_to)) = raw else {
            return Ok(None);
        };
        Ok(Some(NodeLink {
            node_uuid,
            tag,
            place_slug,
            equivalent_to: equivalent_to
                .map(|value| parse_uuid(&value, "classification_nodes.equivalent_to_uuid"))
                .transpose()?,
        }))
    }

    fn list_children(&self, parent_uuid: NodeId) -> ClassificationRepoResult<Vec<ClassificationNode>> {
        query_nodes(
            self.conn,
            &format!("{NODE_SELECT_SQL} WHERE n.parent_uuid = ?1 {SIBLING_ORDER_SQL};"),
            &[parent_uuid.to_string()],
        )
    }

    fn list_roots(&self, tag: &str) -> ClassificationRepoResult<Vec<ClassificationNode>> {
        query_nodes(
            self.conn,
            &format!(
                "{NODE_SELECT_SQL} WHERE n.tag_slug = ?1 AND n.parent_uuid IS NULL {SIBLING_ORDER_SQL};"
            ),
            &[tag.to_string()],
        )
    }

    fn list_ancestors(&self, node_uuid: NodeId) -> ClassificationRepoResult<Vec<ClassificationNode>> {
        if self.get_node_link(node_uuid)?.is_none() {
            return Err(ClassificationRepoError::NodeNotFound(node_uuid));
        }
        let sql = format!(
            "WITH RECURSIVE chain(node_uuid, depth) AS (
                SELECT parent_uuid, 1
                FROM classification_nodes
                WHERE node_uuid = ?1
                  AND parent_uuid IS NOT NULL
                UNION ALL
                SELECT p.parent_uuid, chain.depth + 1
                FROM classification_nodes p
                INNER JOIN chain ON p.node_uuid = chain.node_uuid
                WHERE p.parent_uuid IS NOT NULL
                  AND chain.depth < {MAX_TREE_DEPTH}
            )
            {NODE_SELECT_SQL}
            INNER JOIN chain ON chain.node_uuid = n.node_uuid
            ORDER BY chain.depth DESC;"
        );
        query_nodes(self.conn, &sql, &[node_uuid.to_string()])
    }

    fn find_direct_nodes(
        &self,
        tag: &str,
        place_slug: &str,
    ) -> ClassificationRepoResult<Vec<ClassificationNode>> {
        query_nodes(
            self.conn,
            &format!(
                "{NODE_SELECT_SQL} WHERE n.tag_slug = ?1 AND n.place_slug = ?2 {SIBLING_ORDER_SQL};"
            ),
            &[tag.to_string(), place_slug.to_string()],
        )
    }

    fn list_aliases_into(
        &self,
        tag: &str,
        target_tags: &[String],
    ) -> ClassificationRepoResult<Vec<ClassificationNode>> {
        if target_tags.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..target_tags.len())
            .map(|index| format!("?{}", index + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "{NODE_SELECT_SQL}
             INNER JOIN classification_nodes target ON target.node_uuid = n.equivalent_to_uuid
             WHERE n.tag_slug = ?1
               AND target.tag_slug IN ({placeholders})
             {SIBLING_ORDER_SQL};"
        );
        let mut bind = Vec::with_capacity(target_tags.len() + 1);
        bind.push(tag.to_string());
        bind.extend(target_tags.iter().cloned());
        query_nodes(self.conn, &sql, &bind)
    }

    fn maintain_used_trees(&self, tag: &str) -> ClassificationRepoResult<UsedTreesReport> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let exists: i64 = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM classification_tags WHERE slug = ?1);",
            [tag],
            |row| row.get(0),
        )?;
        if exists != 1 {
            return Err(ClassificationRepoError::TagNotFound(tag.to_string()));
        }
        let report = sync_used_trees(&tx, tag)?;
        tx.commit()?;
        Ok(report)
    }
}

/// Recomputes the alias target set of `tag` and applies the diff to storage.
///
/// Must run on a connection that is inside the caller's write transaction.
fn sync_used_trees(conn: &Connection, tag: &str) -> ClassificationRepoResult<UsedTreesReport> {
    let current = current_alias_targets(conn, tag)?;
    let stored = stored_used_trees(conn, tag)?;
    let (added, removed) = used_trees_diff(&current, &stored);

    for used in &removed {
        conn.execute(
            "DELETE FROM classification_used_trees
             WHERE tag_slug = ?1
               AND used_tag_slug = ?2;",
            params![tag, used.as_str()],
        )?;
    }
    for used in &added {
        conn.execute(
            "INSERT INTO classification_used_trees (tag_slug, used_tag_slug) VALUES (?1, ?2);",
            params![tag, used.as_str()],
        )?;
    }

    let report = UsedTreesReport {
        tag: tag.to_string(),
        added,
        removed,
    };
    if report.is_noop() {
        debug!("event=used_trees_sync module=classification status=noop tag={tag}");
    } else {
        info!(
            "event=used_trees_sync module=classification status=ok tag={} added={} removed={}",
            tag,
            report.added.join(","),
            report.removed.join(",")
        );
    }
    Ok(report)
}

fn current_alias_targets(conn: &Connection, tag: &str) -> ClassificationRepoResult<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT target.tag_slug
         FROM classification_nodes n
         INNER JOIN classification_nodes target ON target.node_uuid = n.equivalent_to_uuid
         WHERE n.tag_slug = ?1
           AND n.equivalent_to_uuid IS NOT NULL;",
    )?;
    let mut rows = stmt.query([tag])?;
    let mut targets = BTreeSet::new();
    while let Some(row) = rows.next()? {
        targets.insert(row.get::<_, String>(0)?);
    }
    Ok(targets)
}

fn stored_used_trees(conn: &Connection, tag: &str) -> ClassificationRepoResult<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT used_tag_slug
         FROM classification_used_trees
         WHERE tag_slug = ?1;",
    )?;
    let mut rows = stmt.query([tag])?;
    let mut stored = BTreeSet::new();
    while let Some(row) = rows.next()? {
        stored.insert(row.get::<_, String>(0)?);
    }
    Ok(stored)
}

/// Writes one node row after the uniqueness checks; returns its id.
fn insert_row(conn: &Connection, node: &NewNode) -> ClassificationRepoResult<NodeId> {
    let node_uuid = node.node_uuid.unwrap_or_else(Uuid::new_v4);
    ensure_unique_slot(
        conn,
        node_uuid,
        &node.tag,
        node.parent_uuid,
        node.start_date.as_deref(),
        node.content.place_slug(),
    )?;
    let sort_order = next_sort_order(conn, &node.tag, node.parent_uuid)?;

    conn.execute(
        "INSERT INTO classification_nodes (
            node_uuid,
            tag_slug,
            parent_uuid,
            place_slug,
            equivalent_to_uuid,
            note,
            priority,
            sort_order,
            start_date,
            end_date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
        params![
            node_uuid.to_string(),
            node.tag.as_str(),
            node.parent_uuid.map(|value| value.to_string()),
            node.content.place_slug(),
            node.content.equivalent_to().map(|value| value.to_string()),
            node.note.as_deref(),
            node.priority,
            sort_order,
            node.start_date.as_deref(),
            node.end_date.as_deref(),
        ],
    )?;
    Ok(node_uuid)
}

/// True when `needle` is `start` or one of its ancestors.
fn parent_chain_contains(
    conn: &Connection,
    start: NodeId,
    needle: NodeId,
) -> ClassificationRepoResult<bool> {
    let found: i64 = conn.query_row(
        &format!(
            "WITH RECURSIVE chain(node_uuid, depth) AS (
                SELECT ?1, 0
                UNION ALL
                SELECT n.parent_uuid, chain.depth + 1
                FROM classification_nodes n
                INNER JOIN chain ON n.node_uuid = chain.node_uuid
                WHERE n.parent_uuid IS NOT NULL
                  AND chain.depth < {MAX_TREE_DEPTH}
            )
            SELECT EXISTS(SELECT 1 FROM chain WHERE node_uuid = ?2);"
        ),
        params![start.to_string(), needle.to_string()],
        |row| row.get(0),
    )?;
    Ok(found == 1)
}

/// True when following `equivalent_to` from `start` reaches `needle`.
fn alias_chain_contains(
    conn: &Connection,
    start: NodeId,
    needle: NodeId,
) -> ClassificationRepoResult<bool> {
    let found: i64 = conn.query_row(
        &format!(
            "WITH RECURSIVE chain(node_uuid, depth) AS (
                SELECT ?1, 0
                UNION ALL
                SELECT n.equivalent_to_uuid, chain.depth + 1
                FROM classification_nodes n
                INNER JOIN chain ON n.node_uuid = chain.node_uuid
                WHERE n.place_slug IS NULL
                  AND n.equivalent_to_uuid IS NOT NULL
                  AND chain.depth < {MAX_TREE_DEPTH}
            )
            SELECT EXISTS(SELECT 1 FROM chain WHERE node_uuid = ?2);"
        ),
        params![start.to_string(), needle.to_string()],
        |row| row.get(0),
    )?;
    Ok(found == 1)
}

fn ensure_unique_slot(
    conn: &Connection,
    node_uuid: NodeId,
    tag: &str,
    parent_uuid: Option<NodeId>,
    start_date: Option<&str>,
    place_slug: Option<&str>,
) -> ClassificationRepoResult<()> {
    if let Some(start_date) = start_date {
        let taken: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM classification_nodes
                WHERE tag_slug = ?1
                  AND parent_uuid IS ?2
                  AND start_date = ?3
                  AND node_uuid <> ?4
            );",
            params![
                tag,
                parent_uuid.map(|value| value.to_string()),
                start_date,
                node_uuid.to_string(),
            ],
            |row| row.get(0),
        )?;
        if taken == 1 {
            return Err(ClassificationRepoError::DuplicateSibling {
                tag: tag.to_string(),
                parent_uuid,
                start_date: start_date.to_string(),
            });
        }
    }

    if let Some(place_slug) = place_slug {
        let taken: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM classification_nodes
                WHERE tag_slug = ?1
                  AND place_slug = ?2
                  AND node_uuid <> ?3
            );",
            params![tag, place_slug, node_uuid.to_string()],
            |row| row.get(0),
        )?;
        if taken == 1 {
            return Err(ClassificationRepoError::DuplicatePlaceInTag {
                tag: tag.to_string(),
                place_slug: place_slug.to_string(),
            });
        }
    }

    Ok(())
}

fn next_sort_order(
    conn: &Connection,
    tag: &str,
    parent_uuid: Option<NodeId>,
) -> ClassificationRepoResult<i64> {
    let next = conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1
         FROM classification_nodes
         WHERE tag_slug = ?1
           AND parent_uuid IS ?2;",
        params![tag, parent_uuid.map(|value| value.to_string())],
        |row| row.get(0),
    )?;
    Ok(next)
}

fn load_required_node(conn: &Connection, node_uuid: NodeId) -> ClassificationRepoResult<ClassificationNode> {
    let mut stmt = conn.prepare(&format!("{NODE_SELECT_SQL} WHERE n.node_uuid = ?1;"))?;
    let mut rows = stmt.query([node_uuid.to_string()])?;
    if let Some(row) = rows.next()? {
        return parse_node_row(row);
    }
    Err(ClassificationRepoError::NodeNotFound(node_uuid))
}

fn query_nodes(
    conn: &Connection,
    sql: &str,
    bind: &[String],
) -> ClassificationRepoResult<Vec<ClassificationNode>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(bind.iter()))?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_node_row(row)?);
    }
    Ok(items)
}

fn log_node_save(op: &str, node: &ClassificationNode, report: &UsedTreesReport) {
    info!(
        "event=node_save module=classification status=ok op={} node={} tag={} kind={} used_trees_changed={}",
        op,
        node.node_uuid,
        node.tag,
        match node.content {
            NodeContent::Direct(_) => "direct",
            NodeContent::Alias(_) => "alias",
        },
        !report.is_noop()
    );
}

fn parse_tag_row(row: &Row<'_>) -> rusqlite::Result<ClassificationTag> {
    Ok(ClassificationTag {
        slug: row.get(0)?,
        label: row.get(1)?,
        description: row.get(2)?,
    })
}

fn parse_node_row(row: &Row<'_>) -> ClassificationRepoResult<ClassificationNode> {
    let node_uuid_text: String = row.get("node_uuid")?;
    let node_uuid = parse_uuid(&node_uuid_text, "classification_nodes.node_uuid")?;

    let parent_uuid = row
        .get::<_, Option<String>>("parent_uuid")?
        .map(|value| parse_uuid(&value, "classification_nodes.parent_uuid"))
        .transpose()?;
    let equivalent_to = row
        .get::<_, Option<String>>("equivalent_to_uuid")?
        .map(|value| parse_uuid(&value, "classification_nodes.equivalent_to_uuid"))
        .transpose()?;
    let place_slug: Option<String> = row.get("place_slug")?;

    let content = match (place_slug, equivalent_to) {
        (Some(place_slug), None) => NodeContent::Direct(place_slug),
        (None, Some(target)) => NodeContent::Alias(target),
        (Some(_), Some(_)) => {
            return Err(ClassificationRepoError::InvalidData(format!(
                "node {node_uuid} has both a place and an equivalent_to target"
            )));
        }
        (None, None) => {
            return Err(ClassificationRepoError::InvalidData(format!(
                "node {node_uuid} has neither a place nor an equivalent_to target"
            )));
        }
    };

    Ok(ClassificationNode {
        node_uuid,
        tag: row.get("tag_slug")?,
        parent_uuid,
        content,
        note: row.get("note")?,
        priority: row.get("priority")?,
        sort_order: row.get("sort_order")?,
        start_date: row.get("start_date")?,
        end_date: row.get("end_date")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_uuid(value: &str, column: &'static str) -> ClassificationRepoResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| {
        ClassificationRepoError::InvalidData(format!("invalid uuid `{value}` in {column}"))
    })
}
