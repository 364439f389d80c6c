//! Domain model for places and classification trees.
//!
//! # Responsibility
//! - Define the records shared by repositories, services and outer layers.
//! - Hold the pure validation rules for slugs and partial dates.
//!
//! # Invariants
//! - Places, place types, identifiers and tags are identified by slug.
//! - Classification nodes are identified by a stable `NodeId`.

pub mod classification;
pub mod place;
pub mod validate;
