//! Entity rows: load on startup, batched diff application at runtime.

use crate::error::DatabaseError;
use crate::store::{DiffAction, EntityDiff};
use crate::{Error, Result};
use serde_json::{Map, Value};

use super::{Database, EntityRow, PersistedEntity, table_for};

fn query_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{context}: {e}")))
}

impl Database {
    /// Load every persisted row of `entity_type`
    ///
    /// Packages come back ordered by their `position` attribute, everything
    /// else by id. Rows whose data is not a JSON object are skipped with an
    /// error log.
    pub async fn load_entities(&self, entity_type: &str) -> Result<Vec<PersistedEntity>> {
        let Some(table) = table_for(entity_type) else {
            return Ok(Vec::new());
        };
        let order = if table == "packages" {
            "COALESCE(json_extract(data, '$.position'), 0), id"
        } else {
            "id"
        };
        let rows: Vec<EntityRow> =
            sqlx::query_as(&format!("SELECT id, data FROM {table} ORDER BY {order}"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| query_error(&format!("Failed to load {table}"), e))?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_str::<Map<String, Value>>(&row.data) {
                Ok(values) => entities.push(PersistedEntity { id: row.id, values }),
                Err(e) => tracing::error!(
                    table,
                    entity_id = row.id.0,
                    error = %e,
                    "dropping malformed row"
                ),
            }
        }
        Ok(entities)
    }

    /// Write one batch of persistence diffs in a single SQL transaction
    ///
    /// `new` replaces the row, `update` merges the changed attributes into
    /// the stored object (`json_patch`, so a `null` removes the key and the
    /// attribute falls back to its default on load), `delete` removes it.
    pub async fn apply_diffs(&self, diffs: &[EntityDiff]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_error("Failed to begin transaction", e))?;

        for diff in diffs {
            let Some(table) = table_for(&diff.entity_type) else {
                continue;
            };
            match diff.action {
                DiffAction::New => {
                    let data = serde_json::to_string(&diff.attributes)?;
                    sqlx::query(&format!(
                        "INSERT OR REPLACE INTO {table} (id, data) VALUES (?, ?)"
                    ))
                    .bind(diff.id)
                    .bind(data)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| query_error(&format!("Failed to insert into {table}"), e))?;
                }
                DiffAction::Update => {
                    let patch = serde_json::to_string(&diff.attributes)?;
                    let result = sqlx::query(&format!(
                        "UPDATE {table} SET data = json_patch(data, ?) WHERE id = ?"
                    ))
                    .bind(patch)
                    .bind(diff.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| query_error(&format!("Failed to update {table}"), e))?;
                    if result.rows_affected() == 0 {
                        tracing::debug!(table, entity_id = diff.id.0, "update for missing row");
                    }
                }
                DiffAction::Delete => {
                    sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
                        .bind(diff.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| query_error(&format!("Failed to delete from {table}"), e))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| query_error("Failed to commit diff batch", e))?;
        Ok(())
    }

    /// Number of rows in the table of `entity_type`
    pub async fn count_entities(&self, entity_type: &str) -> Result<i64> {
        let Some(table) = table_for(entity_type) else {
            return Ok(0);
        };
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error(&format!("Failed to count {table}"), e))
    }

    /// Highest id stored in any entity table
    pub async fn max_entity_id(&self) -> Result<Option<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT MAX(id) FROM (
                SELECT id FROM packages
                UNION ALL SELECT id FROM files
                UNION ALL SELECT id FROM chunks
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("Failed to query max entity id", e))
    }
}
