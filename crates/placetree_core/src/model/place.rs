//! Place registry records.
//!
//! # Responsibility
//! - Describe administrative/geographic places and their external identifiers.
//!
//! # Invariants
//! - `slug` is the immutable identity key of a place.
//! - A place never lists itself among its successors.

use serde::{Deserialize, Serialize};

/// Slug used as the identity of a place.
pub type PlaceSlug = String;

/// Kind of administrative division (continent, nation, region, city, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceType {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
}

/// Geographic or administrative entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    /// Immutable identity key.
    pub slug: PlaceSlug,
    pub name: String,
    pub place_type: String,
    pub inhabitants: Option<i64>,
    /// Partial ISO date (`YYYY`, `YYYY-MM` or `YYYY-MM-DD`).
    pub start_date: Option<String>,
    /// Partial ISO date; never earlier than `start_date`.
    pub end_date: Option<String>,
    /// Why the place ended (rename, merge, split, ...).
    pub reason_end: Option<String>,
    /// Places that superseded this one after `end_date`, sorted by slug.
    pub successors: Vec<PlaceSlug>,
}

/// Input for creating a place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPlace {
    pub slug: String,
    pub name: String,
    pub place_type: String,
    pub inhabitants: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub reason_end: Option<String>,
}

impl NewPlace {
    /// Shorthand for a place with no lifecycle data.
    pub fn new(
        slug: impl Into<String>,
        name: impl Into<String>,
        place_type: impl Into<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
            place_type: place_type.into(),
            ..Self::default()
        }
    }
}

/// External identifier scheme, e.g. `ISTAT:REGION_ID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub slug: String,
    pub scheme: String,
    pub name: String,
}

/// Identifier value issued to one place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceIdentifier {
    pub place_slug: PlaceSlug,
    pub identifier_slug: String,
    pub value: String,
}

/// Parsed `external_id` lookup expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalIdQuery {
    /// `identifier-slug:value`
    BySlug { slug: String, value: String },
    /// `SCHEME:NAME:value`
    BySchemeName {
        scheme: String,
        name: String,
        value: String,
    },
}

impl ExternalIdQuery {
    /// Parses `slug:value` or `scheme:name:value`; other shapes yield `None`.
    pub fn parse(expr: &str) -> Option<Self> {
        let parts: Vec<&str> = expr.trim().split(':').map(str::trim).collect();
        if parts.iter().any(|part| part.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [slug, value] => Some(Self::BySlug {
                slug: (*slug).to_string(),
                value: (*value).to_string(),
            }),
            [scheme, name, value] => Some(Self::BySchemeName {
                scheme: (*scheme).to_string(),
                name: (*name).to_string(),
                value: (*value).to_string(),
            }),
            _ => None,
        }
    }
}
