//! Declarative classification tree import.
//!
//! # Responsibility
//! - Parse nested tree descriptions (place slugs, optionally `place>tag` leaves).
//! - Plan every node first, then write them through
//!   [`TreeService::create_nodes`] in one transaction.
//!
//! # Invariants
//! - `place>tag` is accepted on leaves only; it creates an alias of the node
//!   of `place` in `tag`.
//! - A place appears at most once per tag, counting nodes already stored.
//! - A failed import writes nothing. Dry runs stop after planning.

use crate::model::classification::{NewNode, NodeId};
use crate::repo::classification_repo::ClassificationRepository;
use crate::service::place_service::PlaceLookup;
use crate::service::tree_service::{TreeError, TreeService};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

const ALIAS_SEPARATOR: char = '>';

/// One item of a tree description.
///
/// Serialized as either a bare string leaf or a single-key map
/// `{ "place-slug": [children...] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeEntry {
    Leaf(String),
    Branch(BTreeMap<String, Option<Vec<TreeEntry>>>),
}

/// Errors from tree import.
#[derive(Debug)]
pub enum ImportError {
    /// Description item is malformed.
    InvalidTreeEntry(String),
    /// `--place-slug` anchor has no node in the target tag.
    AnchorNotFound { place_slug: String, tag: String },
    /// `place>tag` leaf points at a place with no node in that tag.
    AliasTargetMissing { place_slug: String, tag: String },
    /// Tree operation failed.
    Tree(TreeError),
}

impl Display for ImportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTreeEntry(message) => write!(f, "invalid tree entry: {message}"),
            Self::AnchorNotFound { place_slug, tag } => {
                write!(f, "node not found for place {place_slug} in tag {tag}")
            }
            Self::AliasTargetMissing { place_slug, tag } => write!(
                f,
                "equivalent node not found for place {place_slug} in tag {tag}"
            ),
            Self::Tree(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ImportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Tree(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TreeError> for ImportError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

/// Import request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest<'a> {
    /// Tag assigned to every imported node.
    pub tag: &'a str,
    /// Place whose node in `tag` becomes the parent of top-level entries.
    /// `None` imports top-level entries as roots.
    pub under_place: Option<&'a str>,
    pub entries: &'a [TreeEntry],
    pub dry_run: bool,
}

/// Import outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub tag: String,
    /// Nodes created, or that would be created on a dry run.
    pub nodes: usize,
    /// Subset of `nodes` that are aliases.
    pub aliases: usize,
    /// Deepest level reached, top-level entries being level 1.
    pub max_depth: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKey<'a> {
    Place(&'a str),
    Alias { place_slug: &'a str, tag: &'a str },
}

fn parse_key(raw: &str) -> Result<EntryKey<'_>, ImportError> {
    let raw = raw.trim();
    match raw.split_once(ALIAS_SEPARATOR) {
        None if !raw.is_empty() => Ok(EntryKey::Place(raw)),
        None => Err(ImportError::InvalidTreeEntry("empty place slug".to_string())),
        Some((place_slug, tag)) => {
            let (place_slug, tag) = (place_slug.trim(), tag.trim());
            if place_slug.is_empty() || tag.is_empty() || tag.contains(ALIAS_SEPARATOR) {
                return Err(ImportError::InvalidTreeEntry(format!(
                    "`{raw}` is not of the form place_slug>tag_slug"
                )));
            }
            Ok(EntryKey::Alias { place_slug, tag })
        }
    }
}

/// Builds a tree from a declarative description.
///
/// Entries are planned depth first, each parent before its children, so the
/// sibling order of the description is preserved. The planned nodes are then
/// written as one batch.
pub fn import_tree<R, P>(
    service: &TreeService<R, P>,
    request: &ImportRequest<'_>,
) -> Result<ImportReport, ImportError>
where
    R: ClassificationRepository,
    P: PlaceLookup,
{
    let started_at = Instant::now();
    let tag = service.get_tag(request.tag)?;

    let anchor = match request.under_place {
        Some(place_slug) => Some(
            service
                .find_direct_node(place_slug, &tag.slug)?
                .ok_or_else(|| ImportError::AnchorNotFound {
                    place_slug: place_slug.trim().to_string(),
                    tag: tag.slug.clone(),
                })?
                .node_uuid,
        ),
        None => None,
    };

    let mut importer = Importer {
        service,
        tag: tag.slug.as_str(),
        planned: Vec::new(),
        seen_places: HashSet::new(),
        report: ImportReport {
            tag: tag.slug.clone(),
            dry_run: request.dry_run,
            ..ImportReport::default()
        },
    };
    importer.add_entries(request.entries, anchor, 1)?;

    let Importer {
        planned, report, ..
    } = importer;
    if !report.dry_run {
        service.create_nodes(planned)?;
    }

    info!(
        "event=tree_import module=import status=ok tag={} dry_run={} nodes={} aliases={} max_depth={} duration_ms={}",
        report.tag,
        report.dry_run,
        report.nodes,
        report.aliases,
        report.max_depth,
        started_at.elapsed().as_millis()
    );
    Ok(report)
}

struct Importer<'s, R: ClassificationRepository, P: PlaceLookup> {
    service: &'s TreeService<R, P>,
    tag: &'s str,
    planned: Vec<NewNode>,
    seen_places: HashSet<String>,
    report: ImportReport,
}

impl<R: ClassificationRepository, P: PlaceLookup> Importer<'_, R, P> {
    fn add_entries(
        &mut self,
        entries: &[TreeEntry],
        parent: Option<NodeId>,
        depth: usize,
    ) -> Result<(), ImportError> {
        for entry in entries {
            match entry {
                TreeEntry::Leaf(key) => {
                    self.add_node(parse_key(key)?, parent, depth)?;
                }
                TreeEntry::Branch(map) => {
                    let mut items = map.iter();
                    let (Some((key, children)), None) = (items.next(), items.next()) else {
                        return Err(ImportError::InvalidTreeEntry(format!(
                            "branch must have exactly one key, found {}",
                            map.len()
                        )));
                    };
                    let key = parse_key(key)?;
                    if let EntryKey::Alias { place_slug, tag } = key {
                        return Err(ImportError::InvalidTreeEntry(format!(
                            "`{place_slug}>{tag}` may only appear on a leaf"
                        )));
                    }
                    let node = self.add_node(key, parent, depth)?;
                    if let Some(children) = children {
                        self.add_entries(children, Some(node), depth + 1)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Plans one node under `parent`; returns its preassigned id.
    fn add_node(
        &mut self,
        key: EntryKey<'_>,
        parent: Option<NodeId>,
        depth: usize,
    ) -> Result<NodeId, ImportError> {
        let new_node = match key {
            EntryKey::Place(place_slug) => {
                let place = self
                    .service
                    .places()
                    .lookup_place(place_slug)
                    .map_err(TreeError::from)?;
                let taken = !self.seen_places.insert(place.slug.clone())
                    || self.service.find_direct_node(&place.slug, self.tag)?.is_some();
                if taken {
                    return Err(TreeError::DuplicatePlaceInTag {
                        tag: self.tag.to_string(),
                        place_slug: place.slug,
                    }
                    .into());
                }
                NewNode::direct(self.tag, place.slug)
            }
            EntryKey::Alias { place_slug, tag } => {
                let target = self
                    .service
                    .find_direct_node(place_slug, tag)?
                    .ok_or_else(|| ImportError::AliasTargetMissing {
                        place_slug: place_slug.to_string(),
                        tag: tag.to_string(),
                    })?;
                self.report.aliases += 1;
                NewNode::alias(self.tag, target.node_uuid)
            }
        };
        self.report.nodes += 1;
        self.report.max_depth = self.report.max_depth.max(depth);

        let node_uuid = Uuid::new_v4();
        let new_node = match parent {
            Some(parent_uuid) => new_node.under(parent_uuid),
            None => new_node,
        };
        self.planned.push(new_node.with_id(node_uuid));
        debug!(
            "event=tree_import module=import status=planned tag={} node={} depth={}",
            self.tag, node_uuid, depth
        );
        Ok(node_uuid)
    }
}
