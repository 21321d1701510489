//! Database layer for rangedl
//!
//! SQLite persistence for the entity store. Each persisted entity type has a
//! table of `(id, data)` rows where `data` is the JSON object of the entity's
//! persistence-channel attributes.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by concern:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`entities`] - Row loading and batched diff application
//! - [`state`] - Runtime state (id counter, shutdown tracking)

use crate::model::{CHUNK, FILE, PACKAGE};
use crate::types::EntityId;
use serde_json::{Map, Value};
use sqlx::{FromRow, sqlite::SqlitePool};

mod entities;
mod migrations;
mod state;

/// Raw row of an entity table
#[derive(Debug, Clone, FromRow)]
pub struct EntityRow {
    /// Entity id
    pub id: EntityId,
    /// JSON object of persisted attributes
    pub data: String,
}

/// Decoded row, ready to be recreated in the store
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntity {
    /// Entity id
    pub id: EntityId,
    /// Attribute name → persisted value
    pub values: Map<String, Value>,
}

/// Table holding rows of `entity_type`, if that type is persisted
pub fn table_for(entity_type: &str) -> Option<&'static str> {
    match entity_type {
        PACKAGE => Some("packages"),
        FILE => Some("files"),
        CHUNK => Some("chunks"),
        _ => None,
    }
}

/// Database handle for rangedl
pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
