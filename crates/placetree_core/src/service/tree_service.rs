//! Classification tree use-case service.
//!
//! # Responsibility
//! - Validate tree invariants above the repository layer.
//! - Provide node creation/update, navigation, alias dereferencing and
//!   place-to-node resolution.
//!
//! # Invariants
//! - A parent belongs to the same tag as its children.
//! - An alias targets a node of a different tag and never closes an alias cycle.
//! - Re-parenting never makes a node its own ancestor.
//! - Both cycle checks run inside the repository write transaction.
//! - `create_nodes` writes all nodes or none.
//! - `resolve` follows `used_trees` one hop only.

use crate::model::classification::{
    ClassificationNode, ClassificationTag, NewNode, NodeContent, NodeId, NodeUpdate,
    UsedTreesReport,
};
use crate::model::place::Place;
use crate::model::validate::{
    normalize_optional, normalize_required, normalize_slug, validate_date_window,
    ValidationError,
};
use crate::repo::classification_repo::{ClassificationRepoError, ClassificationRepository};
use crate::service::place_service::{PlaceLookup, PlaceServiceError};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Errors from classification tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// Input failed field validation.
    Invalid(ValidationError),
    /// No tag with this slug.
    UnknownTag(String),
    /// Tag slug already taken.
    DuplicateTag(String),
    /// Target node does not exist.
    NodeNotFound(NodeId),
    /// Parent node does not exist.
    ParentNotFound(NodeId),
    /// Parent exists but belongs to another tag.
    ParentTagMismatch {
        parent_uuid: NodeId,
        parent_tag: String,
        tag: String,
    },
    /// `equivalent_to` target does not exist.
    AliasTargetNotFound(NodeId),
    /// `equivalent_to` target belongs to the node's own tag.
    AliasSameTag { target: NodeId, tag: String },
    /// Place lookup reported no such place.
    PlaceNotFound(String),
    /// Place lookup failed for another reason.
    PlaceLookup(PlaceServiceError),
    /// `(parent, tag, start_date)` already taken.
    DuplicateSibling {
        tag: String,
        parent_uuid: Option<NodeId>,
        start_date: String,
    },
    /// `(place, tag)` already taken.
    DuplicatePlaceInTag { tag: String, place_slug: String },
    /// Re-parenting would make a node its own ancestor.
    CycleDetected {
        node_uuid: NodeId,
        parent_uuid: NodeId,
    },
    /// Alias chain ends at a node with neither a place nor a reachable target.
    UnresolvedAlias(NodeId),
    /// Alias chain starting at this node loops.
    CyclicAlias(NodeId),
    /// Resolution policy violation: the result set did not hold exactly one node.
    AmbiguousResolution {
        place_slug: String,
        tag: String,
        count: usize,
    },
    /// Repository-level failure.
    Repo(ClassificationRepoError),
}

impl Display for TreeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(err) => write!(f, "{err}"),
            Self::UnknownTag(slug) => write!(f, "unknown classification tag: {slug}"),
            Self::DuplicateTag(slug) => write!(f, "classification tag already exists: {slug}"),
            Self::NodeNotFound(id) => write!(f, "classification node not found: {id}"),
            Self::ParentNotFound(id) => write!(f, "parent node not found: {id}"),
            Self::ParentTagMismatch {
                parent_uuid,
                parent_tag,
                tag,
            } => write!(
                f,
                "parent {parent_uuid} belongs to tag {parent_tag}, not {tag}"
            ),
            Self::AliasTargetNotFound(id) => write!(f, "equivalent_to target not found: {id}"),
            Self::AliasSameTag { target, tag } => write!(
                f,
                "equivalent_to target {target} must belong to a tag other than {tag}"
            ),
            Self::PlaceNotFound(slug) => write!(f, "place not found: {slug}"),
            Self::PlaceLookup(err) => write!(f, "place lookup failed: {err}"),
            Self::DuplicateSibling {
                tag,
                parent_uuid,
                start_date,
            } => match parent_uuid {
                Some(parent) => write!(
                    f,
                    "duplicate sibling: tag {tag} already has a child of {parent} starting {start_date}"
                ),
                None => write!(
                    f,
                    "duplicate sibling: tag {tag} already has a root starting {start_date}"
                ),
            },
            Self::DuplicatePlaceInTag { tag, place_slug } => {
                write!(f, "place {place_slug} already has a node in tag {tag}")
            }
            Self::CycleDetected {
                node_uuid,
                parent_uuid,
            } => write!(
                f,
                "move would create cycle: node {node_uuid} under parent {parent_uuid}"
            ),
            Self::UnresolvedAlias(id) => write!(
                f,
                "alias chain ends at node {id} without reaching a place"
            ),
            Self::CyclicAlias(id) => write!(f, "alias chain starting at node {id} is cyclic"),
            Self::AmbiguousResolution {
                place_slug,
                tag,
                count,
            } => write!(
                f,
                "expected exactly one node for place {place_slug} in tag {tag}, found {count}"
            ),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TreeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Invalid(err) => Some(err),
            Self::PlaceLookup(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for TreeError {
    fn from(value: ValidationError) -> Self {
        Self::Invalid(value)
    }
}

impl From<PlaceServiceError> for TreeError {
    fn from(value: PlaceServiceError) -> Self {
        match value {
            PlaceServiceError::PlaceNotFound(slug) => Self::PlaceNotFound(slug),
            other => Self::PlaceLookup(other),
        }
    }
}

impl From<ClassificationRepoError> for TreeError {
    fn from(value: ClassificationRepoError) -> Self {
        match value {
            ClassificationRepoError::TagNotFound(slug) => Self::UnknownTag(slug),
            ClassificationRepoError::DuplicateTag(slug) => Self::DuplicateTag(slug),
            ClassificationRepoError::NodeNotFound(id) => Self::NodeNotFound(id),
            ClassificationRepoError::DuplicateSibling {
                tag,
                parent_uuid,
                start_date,
            } => Self::DuplicateSibling {
                tag,
                parent_uuid,
                start_date,
            },
            ClassificationRepoError::DuplicatePlaceInTag { tag, place_slug } => {
                Self::DuplicatePlaceInTag { tag, place_slug }
            }
            ClassificationRepoError::ParentCycle {
                node_uuid,
                parent_uuid,
            } => Self::CycleDetected {
                node_uuid,
                parent_uuid,
            },
            ClassificationRepoError::AliasCycle(id) => Self::CyclicAlias(id),
            other => Self::Repo(other),
        }
    }
}

/// Classification tree service facade.
pub struct TreeService<R: ClassificationRepository, P: PlaceLookup> {
    repo: R,
    places: P,
}

impl<R: ClassificationRepository, P: PlaceLookup> TreeService<R, P> {
    /// Creates service from repository and place lookup.
    pub fn new(repo: R, places: P) -> Self {
        Self { repo, places }
    }

    /// Returns the place lookup this service resolves slugs with.
    pub fn places(&self) -> &P {
        &self.places
    }

    pub fn create_tag(
        &self,
        slug: &str,
        label: &str,
        description: Option<&str>,
    ) -> Result<ClassificationTag, TreeError> {
        let tag = ClassificationTag {
            slug: normalize_slug(slug)?,
            label: normalize_required(label, "tag label")?,
            description: normalize_optional(description),
        };
        self.repo.create_tag(&tag).map_err(Into::into)
    }

    /// Loads one tag or fails with `UnknownTag`.
    pub fn get_tag(&self, slug: &str) -> Result<ClassificationTag, TreeError> {
        self.repo
            .get_tag(slug.trim())?
            .ok_or_else(|| TreeError::UnknownTag(slug.trim().to_string()))
    }

    pub fn list_tags(&self) -> Result<Vec<ClassificationTag>, TreeError> {
        self.repo.list_tags().map_err(Into::into)
    }

    /// Reads the maintained `used_trees` slugs of one tag.
    pub fn used_trees(&self, tag: &str) -> Result<Vec<String>, TreeError> {
        self.repo.used_trees(tag.trim()).map_err(Into::into)
    }

    /// Creates one node and aligns `used_trees` of its tag.
    pub fn create_node(&self, input: NewNode) -> Result<ClassificationNode, TreeError> {
        let tag = self.get_tag(&input.tag)?;
        if let Some(parent_uuid) = input.parent_uuid {
            self.ensure_parent_in_tag(parent_uuid, &tag.slug)?;
        }
        let node = self.normalize_new_node(tag, input)?;
        self.repo.insert_node(&node).map_err(Into::into)
    }

    /// Creates `inputs` in order as one unit; any failure writes nothing.
    ///
    /// A node may sit under an earlier node of the same batch and tag when the
    /// parent carries a preassigned id (see [`NewNode::with_id`]).
    pub fn create_nodes(&self, inputs: Vec<NewNode>) -> Result<Vec<ClassificationNode>, TreeError> {
        let mut planned: HashMap<NodeId, String> = HashMap::new();
        let mut nodes = Vec::with_capacity(inputs.len());
        for input in inputs {
            let tag = self.get_tag(&input.tag)?;
            if let Some(parent_uuid) = input.parent_uuid {
                match planned.get(&parent_uuid) {
                    Some(parent_tag) if *parent_tag == tag.slug => {}
                    Some(parent_tag) => {
                        return Err(TreeError::ParentTagMismatch {
                            parent_uuid,
                            parent_tag: parent_tag.clone(),
                            tag: tag.slug,
                        })
                    }
                    None => self.ensure_parent_in_tag(parent_uuid, &tag.slug)?,
                }
            }
            let node = self.normalize_new_node(tag, input)?;
            if let Some(node_uuid) = node.node_uuid {
                planned.insert(node_uuid, node.tag.clone());
            }
            nodes.push(node);
        }
        self.repo.insert_nodes(&nodes).map_err(Into::into)
    }

    /// Re-points, re-parents or edits one node and aligns `used_trees` of its tag.
    pub fn update_node(
        &self,
        node_uuid: NodeId,
        update: NodeUpdate,
    ) -> Result<ClassificationNode, TreeError> {
        let current = self.get_node(node_uuid)?;

        let content = match update.content {
            Some(content) => Some(self.check_content(&current.tag, content)?),
            None => None,
        };

        if let Some(Some(parent_uuid)) = update.parent_uuid {
            self.ensure_parent_in_tag(parent_uuid, &current.tag)?;
        }

        let start = match &update.start_date {
            Some(value) => value.as_deref(),
            None => current.start_date.as_deref(),
        };
        let end = match &update.end_date {
            Some(value) => value.as_deref(),
            None => current.end_date.as_deref(),
        };
        let (start_date, end_date) = validate_date_window(start, end)?;

        let normalized = NodeUpdate {
            content,
            parent_uuid: update.parent_uuid,
            note: update
                .note
                .map(|note| normalize_optional(note.as_deref())),
            priority: update.priority,
            start_date: Some(start_date),
            end_date: Some(end_date),
        };
        self.repo
            .update_node(node_uuid, &normalized)
            .map_err(Into::into)
    }

    /// Loads one node or fails with `NodeNotFound`.
    pub fn get_node(&self, node_uuid: NodeId) -> Result<ClassificationNode, TreeError> {
        self.repo
            .get_node(node_uuid)?
            .ok_or(TreeError::NodeNotFound(node_uuid))
    }

    /// Returns the node of `tag` referencing `place_slug` directly, if any.
    ///
    /// Unlike [`Self::resolve`] this never falls back to aliases.
    pub fn find_direct_node(
        &self,
        place_slug: &str,
        tag: &str,
    ) -> Result<Option<ClassificationNode>, TreeError> {
        let tag = self.get_tag(tag)?;
        Ok(self
            .repo
            .find_direct_nodes(&tag.slug, place_slug.trim())?
            .into_iter()
            .next())
    }

    /// Lists children ordered by priority, then insertion order.
    pub fn get_children(&self, node_uuid: NodeId) -> Result<Vec<ClassificationNode>, TreeError> {
        self.get_node(node_uuid)?;
        self.repo.list_children(node_uuid).map_err(Into::into)
    }

    /// Lists ancestors ordered root first, parent last.
    pub fn get_ancestors(&self, node_uuid: NodeId) -> Result<Vec<ClassificationNode>, TreeError> {
        self.repo.list_ancestors(node_uuid).map_err(Into::into)
    }

    /// Lists the roots of one tag in sibling order.
    pub fn get_roots(&self, tag: &str) -> Result<Vec<ClassificationNode>, TreeError> {
        let tag = self.get_tag(tag)?;
        self.repo.list_roots(&tag.slug).map_err(Into::into)
    }

    /// Returns the first root of one tag, if the tag has any node.
    pub fn get_root(&self, tag: &str) -> Result<Option<ClassificationNode>, TreeError> {
        Ok(self.get_roots(tag)?.into_iter().next())
    }

    /// Lists the whole subtree below `node_uuid` in pre-order, excluding it.
    pub fn get_descendants(&self, node_uuid: NodeId) -> Result<Vec<ClassificationNode>, TreeError> {
        let mut stack = self.get_children(node_uuid)?;
        stack.reverse();
        let mut visited = HashSet::from([node_uuid]);
        let mut items = Vec::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node.node_uuid) {
                continue;
            }
            let mut children = self.repo.list_children(node.node_uuid)?;
            children.reverse();
            stack.extend(children);
            items.push(node);
        }
        Ok(items)
    }

    /// Returns the place a node stands for, dereferencing `equivalent_to` links.
    pub fn reference_place(&self, node_uuid: NodeId) -> Result<Place, TreeError> {
        let slug = self.reference_place_slug(node_uuid)?;
        self.places.lookup_place(&slug).map_err(Into::into)
    }

    /// Returns the slug of the place a node stands for.
    ///
    /// # Errors
    /// - `NodeNotFound` when `node_uuid` does not exist.
    /// - `UnresolvedAlias` when the chain ends without a place.
    /// - `CyclicAlias` when the chain revisits a node.
    pub fn reference_place_slug(&self, node_uuid: NodeId) -> Result<String, TreeError> {
        let mut link = self
            .repo
            .get_node_link(node_uuid)?
            .ok_or(TreeError::NodeNotFound(node_uuid))?;
        let mut visited = HashSet::from([node_uuid]);
        loop {
            if let Some(place_slug) = link.place_slug {
                return Ok(place_slug);
            }
            let Some(target) = link.equivalent_to else {
                return Err(TreeError::UnresolvedAlias(link.node_uuid));
            };
            if !visited.insert(target) {
                return Err(TreeError::CyclicAlias(node_uuid));
            }
            link = self
                .repo
                .get_node_link(target)?
                .ok_or(TreeError::UnresolvedAlias(link.node_uuid))?;
        }
    }

    /// Returns reference-place slugs from the root down to `node_uuid` inclusive.
    pub fn node_path(&self, node_uuid: NodeId) -> Result<Vec<String>, TreeError> {
        let mut path = Vec::new();
        for ancestor in self.get_ancestors(node_uuid)? {
            path.push(self.reference_place_slug(ancestor.node_uuid)?);
        }
        path.push(self.reference_place_slug(node_uuid)?);
        Ok(path)
    }

    /// Re-runs `used_trees` maintenance for one tag.
    ///
    /// Idempotent: a second run without intervening writes reports no change.
    pub fn maintain_used_trees(&self, tag: &str) -> Result<UsedTreesReport, TreeError> {
        self.repo.maintain_used_trees(tag.trim()).map_err(Into::into)
    }

    /// Returns the nodes representing `place_slug` under `tag`.
    ///
    /// Nodes of `tag` referencing the place directly win. Otherwise the
    /// aliases of `tag` pointing into one of its `used_trees` whose reference
    /// place is `place_slug` are returned. Equivalences of equivalences are
    /// not followed.
    pub fn resolve(
        &self,
        place_slug: &str,
        tag: &str,
    ) -> Result<Vec<ClassificationNode>, TreeError> {
        let started_at = Instant::now();
        let tag = self.get_tag(tag)?;
        let place = self.places.lookup_place(place_slug)?;

        let direct = self.repo.find_direct_nodes(&tag.slug, &place.slug)?;
        if !direct.is_empty() {
            log_resolve(&place.slug, &tag.slug, "direct", direct.len(), started_at);
            return Ok(direct);
        }

        let used = self.repo.used_trees(&tag.slug)?;
        let mut matches = Vec::new();
        for candidate in self.repo.list_aliases_into(&tag.slug, &used)? {
            if self.reference_place_slug(candidate.node_uuid)? == place.slug {
                matches.push(candidate);
            }
        }

        let strategy = if matches.is_empty() { "none" } else { "used_trees" };
        log_resolve(&place.slug, &tag.slug, strategy, matches.len(), started_at);
        Ok(matches)
    }

    /// Resolves and requires exactly one node.
    pub fn resolve_one(&self, place_slug: &str, tag: &str) -> Result<ClassificationNode, TreeError> {
        let mut nodes = self.resolve(place_slug, tag)?;
        if nodes.len() != 1 {
            warn!(
                "event=resolve module=classification status=ambiguous place={} tag={} count={}",
                place_slug.trim(),
                tag.trim(),
                nodes.len()
            );
            return Err(TreeError::AmbiguousResolution {
                place_slug: place_slug.trim().to_string(),
                tag: tag.trim().to_string(),
                count: nodes.len(),
            });
        }
        Ok(nodes.remove(0))
    }

    fn normalize_new_node(
        &self,
        tag: ClassificationTag,
        input: NewNode,
    ) -> Result<NewNode, TreeError> {
        let content = self.check_content(&tag.slug, input.content)?;
        let (start_date, end_date) =
            validate_date_window(input.start_date.as_deref(), input.end_date.as_deref())?;
        Ok(NewNode {
            node_uuid: input.node_uuid,
            tag: tag.slug,
            content,
            parent_uuid: input.parent_uuid,
            note: normalize_optional(input.note.as_deref()),
            priority: input.priority,
            start_date,
            end_date,
        })
    }

    fn check_content(&self, tag: &str, content: NodeContent) -> Result<NodeContent, TreeError> {
        match content {
            NodeContent::Direct(place_slug) => {
                let place = self.places.lookup_place(place_slug.trim())?;
                Ok(NodeContent::Direct(place.slug))
            }
            NodeContent::Alias(target) => {
                let link = self
                    .repo
                    .get_node_link(target)?
                    .ok_or(TreeError::AliasTargetNotFound(target))?;
                if link.tag == tag {
                    return Err(TreeError::AliasSameTag {
                        target,
                        tag: tag.to_string(),
                    });
                }
                Ok(NodeContent::Alias(target))
            }
        }
    }

    fn ensure_parent_in_tag(&self, parent_uuid: NodeId, tag: &str) -> Result<(), TreeError> {
        let parent = self
            .repo
            .get_node_link(parent_uuid)?
            .ok_or(TreeError::ParentNotFound(parent_uuid))?;
        if parent.tag != tag {
            return Err(TreeError::ParentTagMismatch {
                parent_uuid,
                parent_tag: parent.tag,
                tag: tag.to_string(),
            });
        }
        Ok(())
    }
}

fn log_resolve(place: &str, tag: &str, strategy: &str, count: usize, started_at: Instant) {
    info!(
        "event=resolve module=classification status=ok place={} tag={} strategy={} count={} duration_ms={}",
        place,
        tag,
        strategy,
        count,
        started_at.elapsed().as_millis()
    );
}
