//! Repository layer: data access contracts and their SQLite implementations.
//!
//! # Responsibility
//! - Keep SQL and row mapping out of the services.
//! - Keep every multi-statement write inside one transaction.
//!
//! # Invariants
//! - `classification_used_trees` is rewritten in the same transaction as the
//!   node write that changed it.
//! - Repository APIs return semantic errors (`NotFound`, `Duplicate*`) in
//!   addition to DB transport errors.

pub mod classification_repo;
pub mod place_repo;
