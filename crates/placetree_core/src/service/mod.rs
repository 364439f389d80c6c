//! Use-case services.
//!
//! # Responsibility
//! - Validate input and cross-entity references before any write.
//! - Expose resolution and import on top of the repositories.

pub mod place_service;
pub mod tree_import;
pub mod tree_service;
