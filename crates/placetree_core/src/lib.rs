//! Core domain logic for placetree.
//! Owns the place registry, classification trees and their invariants.

pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::classification::{
    ClassificationNode, ClassificationTag, NewNode, NodeContent, NodeId, NodeUpdate,
    UsedTreesReport,
};
pub use model::place::{ExternalIdQuery, Identifier, NewPlace, Place, PlaceIdentifier, PlaceType};
pub use model::validate::ValidationError;
pub use repo::classification_repo::{
    ClassificationRepoError, ClassificationRepository, SqliteClassificationRepository,
};
pub use repo::place_repo::{PlaceRepoError, PlaceRepository, SqlitePlaceRepository};
pub use service::place_service::{PlaceLookup, PlaceService, PlaceServiceError};
pub use service::tree_import::{import_tree, ImportError, ImportReport, ImportRequest, TreeEntry};
pub use service::tree_service::{TreeError, TreeService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
