//! Place registry repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist place types, places, successor links and external identifiers.
//! - Answer slug and external-identifier lookups.
//!
//! # Invariants
//! - Write paths receive already-normalized input from the service layer.
//! - Successor lists are returned sorted by slug.

use crate::db::{schema_ready, DbError, SchemaCheck};
use crate::model::place::{ExternalIdQuery, Identifier, NewPlace, Place, PlaceIdentifier, PlaceType};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};

const PLACE_SELECT_SQL: &str = "SELECT
    p.slug AS slug,
    p.name AS name,
    p.place_type_slug AS place_type_slug,
    p.inhabitants AS inhabitants,
    p.start_date AS start_date,
    p.end_date AS end_date,
    p.reason_end AS reason_end
FROM places p";

const REQUIRED_TABLES: &[&str] = &[
    "place_types",
    "places",
    "place_successors",
    "identifiers",
    "place_identifiers",
];

pub type PlaceRepoResult<T> = Result<T, PlaceRepoError>;

/// Errors from place registry persistence.
#[derive(Debug)]
pub enum PlaceRepoError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Referenced record does not exist.
    NotFound { entity: &'static str, key: String },
    /// Record with the same key already exists.
    Duplicate { entity: &'static str, key: String },
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
}

impl Display for PlaceRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { entity, key } => write!(f, "{entity} not found: {key}"),
            Self::Duplicate { entity, key } => write!(f, "{entity} already exists: {key}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "place repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "place repository requires table `{table}`")
            }
        }
    }
}

impl Error for PlaceRepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for PlaceRepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for PlaceRepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Repository interface for the place registry.
pub trait PlaceRepository {
    fn create_place_type(&self, place_type: &PlaceType) -> PlaceRepoResult<()>;
    fn create_place(&self, place: &NewPlace) -> PlaceRepoResult<Place>;
    fn get_place(&self, slug: &str) -> PlaceRepoResult<Option<Place>>;
    /// Replaces the full successor set of one place.
    fn set_successors(&self, slug: &str, successors: &[String]) -> PlaceRepoResult<()>;
    fn create_identifier(&self, identifier: &Identifier) -> PlaceRepoResult<()>;
    /// Inserts or replaces the value issued to a place under one identifier.
    fn set_place_identifier(&self, item: &PlaceIdentifier) -> PlaceRepoResult<()>;
    fn list_place_identifiers(&self, place_slug: &str) -> PlaceRepoResult<Vec<PlaceIdentifier>>;
    fn find_by_external_id(&self, query: &ExternalIdQuery) -> PlaceRepoResult<Vec<Place>>;
}

/// SQLite-backed place repository.
pub struct SqlitePlaceRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqlitePlaceRepository<'conn> {
    /// Creates repository from migrated connection.
    pub fn try_new(conn: &'conn Connection) -> PlaceRepoResult<Self> {
        match schema_ready(conn, REQUIRED_TABLES)? {
            SchemaCheck::Ready => Ok(Self { conn }),
            SchemaCheck::VersionMismatch {
                expected_version,
                actual_version,
            } => Err(PlaceRepoError::UninitializedConnection {
                expected_version,
                actual_version,
            }),
            SchemaCheck::MissingTable(table) => Err(PlaceRepoError::MissingRequiredTable(table)),
        }
    }
}

impl PlaceRepository for SqlitePlaceRepository<'_> {
    fn create_place_type(&self, place_type: &PlaceType) -> PlaceRepoResult<()> {
        if row_exists(self.conn, "place_types", &place_type.slug)? {
            return Err(PlaceRepoError::Duplicate {
                entity: "place type",
                key: place_type.slug.clone(),
            });
        }
        self.conn.execute(
            "INSERT INTO place_types (slug, name, description) VALUES (?1, ?2, ?3);",
            params![
                place_type.slug.as_str(),
                place_type.name.as_str(),
                place_type.description.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn create_place(&self, place: &NewPlace) -> PlaceRepoResult<Place> {
        if row_exists(self.conn, "places", &place.slug)? {
            return Err(PlaceRepoError::Duplicate {
                entity: "place",
                key: place.slug.clone(),
            });
        }
        if !row_exists(self.conn, "place_types", &place.place_type)? {
            return Err(PlaceRepoError::NotFound {
                entity: "place type",
                key: place.place_type.clone(),
            });
        }
        self.conn.execute(
            "INSERT INTO places (
                slug,
                name,
                place_type_slug,
                inhabitants,
                start_date,
                end_date,
                reason_end
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                place.slug.as_str(),
                place.name.as_str(),
                place.place_type.as_str(),
                place.inhabitants,
                place.start_date.as_deref(),
                place.end_date.as_deref(),
                place.reason_end.as_deref(),
            ],
        )?;
        self.get_place(&place.slug)?
            .ok_or_else(|| PlaceRepoError::NotFound {
                entity: "place",
                key: place.slug.clone(),
            })
    }

    fn get_place(&self, slug: &str) -> PlaceRepoResult<Option<Place>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PLACE_SELECT_SQL} WHERE p.slug = ?1;"))?;
        let place = stmt.query_row([slug], parse_place_row).optional()?;
        match place {
            Some(mut place) => {
                place.successors = list_successors(self.conn, &place.slug)?;
                Ok(Some(place))
            }
            None => Ok(None),
        }
    }

    fn set_successors(&self, slug: &str, successors: &[String]) -> PlaceRepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        for key in std::iter::once(slug).chain(successors.iter().map(String::as_str)) {
            if !row_exists(&tx, "places", key)? {
                return Err(PlaceRepoError::NotFound {
                    entity: "place",
                    key: key.to_string(),
                });
            }
        }

        tx.execute("DELETE FROM place_successors WHERE place_slug = ?1;", [slug])?;
        for successor in successors {
            tx.execute(
                "INSERT OR IGNORE INTO place_successors (place_slug, successor_slug)
                 VALUES (?1, ?2);",
                params![slug, successor.as_str()],
            )?;
        }
        tx.execute(
            "UPDATE places
             SET updated_at = (strftime('%s', 'now') * 1000)
             WHERE slug = ?1;",
            [slug],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn create_identifier(&self, identifier: &Identifier) -> PlaceRepoResult<()> {
        if row_exists(self.conn, "identifiers", &identifier.slug)? {
            return Err(PlaceRepoError::Duplicate {
                entity: "identifier",
                key: identifier.slug.clone(),
            });
        }
        let pair_taken: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM identifiers
                WHERE scheme = ?1 AND name = ?2
            );",
            params![identifier.scheme.as_str(), identifier.name.as_str()],
            |row| row.get(0),
        )?;
        if pair_taken == 1 {
            return Err(PlaceRepoError::Duplicate {
                entity: "identifier",
                key: format!("{}:{}", identifier.scheme, identifier.name),
            });
        }
        self.conn.execute(
            "INSERT INTO identifiers (slug, scheme, name) VALUES (?1, ?2, ?3);",
            params![
                identifier.slug.as_str(),
                identifier.scheme.as_str(),
                identifier.name.as_str(),
            ],
        )?;
        Ok(())
    }

    fn set_place_identifier(&self, item: &PlaceIdentifier) -> PlaceRepoResult<()> {
        if !row_exists(self.conn, "places", &item.place_slug)? {
            return Err(PlaceRepoError::NotFound {
                entity: "place",
                key: item.place_slug.clone(),
            });
        }
        if !row_exists(self.conn, "identifiers", &item.identifier_slug)? {
            return Err(PlaceRepoError::NotFound {
                entity: "identifier",
                key: item.identifier_slug.clone(),
            });
        }
        self.conn.execute(
            "INSERT INTO place_identifiers (place_slug, identifier_slug, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (place_slug, identifier_slug) DO UPDATE SET value = excluded.value;",
            params![
                item.place_slug.as_str(),
                item.identifier_slug.as_str(),
                item.value.as_str(),
            ],
        )?;
        Ok(())
    }

    fn list_place_identifiers(&self, place_slug: &str) -> PlaceRepoResult<Vec<PlaceIdentifier>> {
        let mut stmt = self.conn.prepare(
            "SELECT place_slug, identifier_slug, value
             FROM place_identifiers
             WHERE place_slug = ?1
             ORDER BY identifier_slug ASC;",
        )?;
        let rows = stmt.query_map([place_slug], |row| {
            Ok(PlaceIdentifier {
                place_slug: row.get(0)?,
                identifier_slug: row.get(1)?,
                value: row.get(2)?,
            })
        })?;
        let mut items = Vec::new();
        for item in rows {
            items.push(item?);
        }
        Ok(items)
    }

    fn find_by_external_id(&self, query: &ExternalIdQuery) -> PlaceRepoResult<Vec<Place>> {
        let mut slugs = Vec::new();
        {
            let (sql, bind): (&str, Vec<&str>) = match query {
                ExternalIdQuery::BySlug { slug, value } => (
                    "SELECT pi.place_slug
                     FROM place_identifiers pi
                     WHERE pi.identifier_slug = ?1
                       AND pi.value = ?2
                     ORDER BY pi.place_slug ASC;",
                    vec![slug.as_str(), value.as_str()],
                ),
                ExternalIdQuery::BySchemeName {
                    scheme,
                    name,
                    value,
                } => (
                    "SELECT pi.place_slug
                     FROM place_identifiers pi
                     INNER JOIN identifiers i ON i.slug = pi.identifier_slug
                     WHERE i.scheme = ?1
                       AND i.name = ?2
                       AND pi.value = ?3
                     ORDER BY pi.place_slug ASC;",
                    vec![scheme.as_str(), name.as_str(), value.as_str()],
                ),
            };
            let mut stmt = self.conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(bind))?;
            while let Some(row) = rows.next()? {
                slugs.push(row.get::<_, String>(0)?);
            }
        }

        let mut places = Vec::with_capacity(slugs.len());
        for slug in slugs {
            if let Some(place) = self.get_place(&slug)? {
                places.push(place);
            }
        }
        Ok(places)
    }
}

fn parse_place_row(row: &Row<'_>) -> rusqlite::Result<Place> {
    Ok(Place {
        slug: row.get("slug")?,
        name: row.get("name")?,
        place_type: row.get("place_type_slug")?,
        inhabitants: row.get("inhabitants")?,
        start_date: row.get("start_date")?,
        end_date: row.get("end_date")?,
        reason_end: row.get("reason_end")?,
        successors: Vec::new(),
    })
}

fn list_successors(conn: &Connection, slug: &str) -> PlaceRepoResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT successor_slug
         FROM place_successors
         WHERE place_slug = ?1
         ORDER BY successor_slug ASC;",
    )?;
    let mut rows = stmt.query([slug])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(row.get(0)?);
    }
    Ok(items)
}

fn row_exists(conn: &Connection, table: &'static str, slug: &str) -> PlaceRepoResult<bool> {
    let exists: i64 = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE slug = ?1);"),
        [slug],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
