//! Slug and partial-date validation shared by the place registry and the tree.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid slug regex"));
static PARTIAL_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}(?:-(0[1-9]|1[0-2])(?:-(0[1-9]|[12]\d|3[01]))?)?$")
        .expect("valid partial date regex")
});

/// Field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Slug is empty or contains characters outside `[a-z0-9-]`.
    InvalidSlug(String),
    /// Required text field is blank after trim.
    BlankField(&'static str),
    /// Date is not `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
    InvalidDate(String),
    /// End date precedes start date.
    EndBeforeStart { start: String, end: String },
    /// Count field holds a negative number.
    NegativeValue { field: &'static str, value: i64 },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSlug(value) => write!(f, "invalid slug: `{value}`"),
            Self::BlankField(field) => write!(f, "{field} must not be blank"),
            Self::InvalidDate(value) => {
                write!(f, "invalid date `{value}`; expected YYYY, YYYY-MM or YYYY-MM-DD")
            }
            Self::EndBeforeStart { start, end } => {
                write!(f, "end date {end} precedes start date {start}")
            }
            Self::NegativeValue { field, value } => {
                write!(f, "{field} must not be negative, got {value}")
            }
        }
    }
}

impl Error for ValidationError {}

/// Trims and checks a slug.
pub fn normalize_slug(value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if !SLUG_RE.is_match(trimmed) {
        return Err(ValidationError::InvalidSlug(value.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Trims a required text field.
pub fn normalize_required(value: &str, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::BlankField(field));
    }
    Ok(trimmed.to_string())
}

/// Trims an optional text field, mapping blank input to `None`.
pub fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Rejects negative counts; `None` passes through.
pub fn validate_non_negative(
    value: Option<i64>,
    field: &'static str,
) -> Result<Option<i64>, ValidationError> {
    match value {
        Some(value) if value < 0 => Err(ValidationError::NegativeValue { field, value }),
        other => Ok(other),
    }
}

/// Validates an optional `[start, end]` window of partial ISO dates.
///
/// Partial dates compare lexicographically, so `2001` precedes `2001-03`.
pub fn validate_date_window(
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(Option<String>, Option<String>), ValidationError> {
    let start = normalize_optional(start).map(check_date).transpose()?;
    let end = normalize_optional(end).map(check_date).transpose()?;
    if let (Some(start), Some(end)) = (&start, &end) {
        if end < start {
            return Err(ValidationError::EndBeforeStart {
                start: start.clone(),
                end: end.clone(),
            });
        }
    }
    Ok((start, end))
}

fn check_date(value: String) -> Result<String, ValidationError> {
    if PARTIAL_DATE_RE.is_match(&value) {
        Ok(value)
    } else {
        Err(ValidationError::InvalidDate(value))
    }
}
