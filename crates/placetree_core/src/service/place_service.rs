//! Place registry use-case service.
//!
//! # Responsibility
//! - Normalize and validate place registry input above the repository layer.
//! - Serve as the place lookup used by classification trees.
//!
//! # Invariants
//! - Slugs are kebab-case (`[a-z0-9-]`), names are non-blank.
//! - Lifecycle dates form a valid window.
//! - A place never succeeds itself.

use crate::model::place::{
    ExternalIdQuery, Identifier, NewPlace, Place, PlaceIdentifier, PlaceType,
};
use crate::model::validate::{
    normalize_optional, normalize_required, normalize_slug, validate_date_window,
    validate_non_negative, ValidationError,
};
use crate::repo::place_repo::{PlaceRepoError, PlaceRepository};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Errors from place registry operations.
#[derive(Debug)]
pub enum PlaceServiceError {
    /// Input failed field validation.
    Invalid(ValidationError),
    /// Place slug does not exist.
    PlaceNotFound(String),
    /// Place type slug does not exist.
    PlaceTypeNotFound(String),
    /// Identifier slug does not exist.
    IdentifierNotFound(String),
    /// Record with the same key already exists.
    Duplicate { entity: &'static str, key: String },
    /// `external_id` expression is neither `slug:value` nor `scheme:name:value`.
    InvalidExternalId(String),
    /// Place listed among its own successors.
    SelfSuccession(String),
    /// Repository-level failure.
    Repo(PlaceRepoError),
}

impl Display for PlaceServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(err) => write!(f, "{err}"),
            Self::PlaceNotFound(slug) => write!(f, "place not found: {slug}"),
            Self::PlaceTypeNotFound(slug) => write!(f, "place type not found: {slug}"),
            Self::IdentifierNotFound(slug) => write!(f, "identifier not found: {slug}"),
            Self::Duplicate { entity, key } => write!(f, "{entity} already exists: {key}"),
            Self::InvalidExternalId(expr) => write!(
                f,
                "invalid external id `{expr}`; expected slug:value or scheme:name:value"
            ),
            Self::SelfSuccession(slug) => write!(f, "place {slug} cannot succeed itself"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for PlaceServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Invalid(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for PlaceServiceError {
    fn from(value: ValidationError) -> Self {
        Self::Invalid(value)
    }
}

impl From<PlaceRepoError> for PlaceServiceError {
    fn from(value: PlaceRepoError) -> Self {
        match value {
            PlaceRepoError::NotFound { entity: "place", key } => Self::PlaceNotFound(key),
            PlaceRepoError::NotFound {
                entity: "place type",
                key,
            } => Self::PlaceTypeNotFound(key),
            PlaceRepoError::NotFound {
                entity: "identifier",
                key,
            } => Self::IdentifierNotFound(key),
            PlaceRepoError::Duplicate { entity, key } => Self::Duplicate { entity, key },
            other => Self::Repo(other),
        }
    }
}

/// Resolves place slugs to places.
///
/// The classification tree depends on this seam rather than on the place
/// repository, so trees can be exercised against any place source.
pub trait PlaceLookup {
    /// Returns the place or `PlaceServiceError::PlaceNotFound`.
    fn lookup_place(&self, slug: &str) -> Result<Place, PlaceServiceError>;
}

/// Place registry service facade.
pub struct PlaceService<R: PlaceRepository> {
    repo: R,
}

impl<R: PlaceRepository> PlaceService<R> {
    /// Creates service from repository implementation.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn create_place_type(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<PlaceType, PlaceServiceError> {
        let place_type = PlaceType {
            slug: normalize_slug(slug)?,
            name: normalize_required(name, "place type name")?,
            description: normalize_optional(description),
        };
        self.repo.create_place_type(&place_type)?;
        Ok(place_type)
    }

    /// Creates one place after validating slug, name and lifecycle window.
    pub fn create_place(&self, input: NewPlace) -> Result<Place, PlaceServiceError> {
        let (start_date, end_date) =
            validate_date_window(input.start_date.as_deref(), input.end_date.as_deref())?;
        let normalized = NewPlace {
            slug: normalize_slug(&input.slug)?,
            name: normalize_required(&input.name, "place name")?,
            place_type: normalize_slug(&input.place_type)?,
            inhabitants: validate_non_negative(input.inhabitants, "inhabitants")?,
            start_date,
            end_date,
            reason_end: normalize_optional(input.reason_end.as_deref()),
        };
        self.repo.create_place(&normalized).map_err(Into::into)
    }

    /// Loads one place by slug.
    pub fn get_place(&self, slug: &str) -> Result<Place, PlaceServiceError> {
        self.repo
            .get_place(slug.trim())?
            .ok_or_else(|| PlaceServiceError::PlaceNotFound(slug.trim().to_string()))
    }

    /// Replaces the places that superseded `slug` (rename, split, merge).
    pub fn set_successors(
        &self,
        slug: &str,
        successors: &[&str],
    ) -> Result<Place, PlaceServiceError> {
        let slug = normalize_slug(slug)?;
        let mut normalized = BTreeSet::new();
        for successor in successors {
            let successor = normalize_slug(successor)?;
            if successor == slug {
                return Err(PlaceServiceError::SelfSuccession(slug));
            }
            normalized.insert(successor);
        }
        let normalized: Vec<String> = normalized.into_iter().collect();
        self.repo.set_successors(&slug, &normalized)?;
        self.get_place(&slug)
    }

    pub fn create_identifier(
        &self,
        scheme: &str,
        name: &str,
        slug: &str,
    ) -> Result<Identifier, PlaceServiceError> {
        let identifier = Identifier {
            slug: normalize_slug(slug)?,
            scheme: normalize_required(scheme, "identifier scheme")?,
            name: normalize_required(name, "identifier name")?,
        };
        self.repo.create_identifier(&identifier)?;
        Ok(identifier)
    }

    /// Records the value issued to `place_slug` under `identifier_slug`.
    pub fn add_place_identifier(
        &self,
        place_slug: &str,
        identifier_slug: &str,
        value: &str,
    ) -> Result<PlaceIdentifier, PlaceServiceError> {
        let item = PlaceIdentifier {
            place_slug: normalize_slug(place_slug)?,
            identifier_slug: normalize_slug(identifier_slug)?,
            value: normalize_required(value, "identifier value")?,
        };
        self.repo.set_place_identifier(&item)?;
        Ok(item)
    }

    pub fn list_place_identifiers(
        &self,
        place_slug: &str,
    ) -> Result<Vec<PlaceIdentifier>, PlaceServiceError> {
        let place = self.get_place(place_slug)?;
        self.repo
            .list_place_identifiers(&place.slug)
            .map_err(Into::into)
    }

    /// Finds places by `slug:value` or `scheme:name:value`.
    pub fn find_by_external_id(&self, expr: &str) -> Result<Vec<Place>, PlaceServiceError> {
        let query = ExternalIdQuery::parse(expr)
            .ok_or_else(|| PlaceServiceError::InvalidExternalId(expr.to_string()))?;
        self.repo.find_by_external_id(&query).map_err(Into::into)
    }
}

impl<R: PlaceRepository> PlaceLookup for PlaceService<R> {
    fn lookup_place(&self, slug: &str) -> Result<Place, PlaceServiceError> {
        self.get_place(slug)
    }
}
