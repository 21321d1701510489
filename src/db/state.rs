//! Runtime state tracking: id counter and shutdown detection.

use crate::error::DatabaseError;
use crate::types::EntityId;
use crate::{Error, Result};

use super::Database;

impl Database {
    async fn meta(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read {key}: {}",
                    e
                )))
            })
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO store_meta (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write {key}: {}",
                e
            )))
        })?;
        Ok(())
    }

    /// Next entity id to hand out, if one was saved
    ///
    /// The id counter is monotonic across restarts: it never goes below one
    /// past the highest id in any entity table.
    pub async fn load_next_id(&self) -> Result<Option<EntityId>> {
        let saved = self
            .meta("next_id")
            .await?
            .and_then(|v| v.parse::<u64>().ok());
        let floor = self.max_entity_id().await?.map(|max| max as u64 + 1);
        Ok(match (saved, floor) {
            (Some(a), Some(b)) => Some(EntityId(a.max(b))),
            (a, b) => a.or(b).map(EntityId),
        })
    }

    /// Persist the id counter
    pub async fn save_next_id(&self, next: EntityId) -> Result<()> {
        self.set_meta("next_id", &next.0.to_string()).await
    }

    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call `set_clean_shutdown()`,
    /// indicating a crash or forced termination.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        Ok(self
            .meta("clean_shutdown")
            .await?
            .is_none_or(|v| v != "true"))
    }

    /// Mark that the application has started
    ///
    /// If shutdown is not recorded before the next startup,
    /// [`Self::was_unclean_shutdown`] returns true.
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_meta("clean_shutdown", "false").await
    }

    /// Mark that the application is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_meta("clean_shutdown", "true").await
    }
}
