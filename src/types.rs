//! Core types for rangedl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-unique entity identifier (monotonic, persisted across restarts)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Get the inner value
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Decode an id stored in a JSON attribute value (`null` means no reference)
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value.as_u64().map(Self)
    }

    /// Encode as a JSON attribute value
    pub fn to_value(self) -> serde_json::Value {
        serde_json::Value::from(self.0)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl PartialEq<u64> for EntityId {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// SQLite stores integers as i64; ids never exceed i64::MAX in practice.
impl sqlx::Type<sqlx::Sqlite> for EntityId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for EntityId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&(self.0 as i64), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for EntityId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id as u64))
    }
}

/// Engine-level event emitted during the download lifecycle.
///
/// Attribute-level changes travel through store listeners; these events
/// describe transitions that are interesting to the embedding application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A file task acquired its slots and started streaming
    FileStarted {
        /// File id
        id: EntityId,
        /// Account used for the download
        account: String,
    },

    /// A recoverable error was hit; the file resumes after `delay_secs`
    RetryScheduled {
        /// File id
        id: EntityId,
        /// Error message recorded on the file
        message: String,
        /// Delay before the next attempt
        delay_secs: u64,
    },

    /// The hoster asked for a new IP before the next attempt
    ReconnectRequested {
        /// File id that triggered the request
        id: EntityId,
    },

    /// All chunks are complete and the file was moved to its destination
    FileComplete {
        /// File id
        id: EntityId,
        /// Final location on disk
        path: PathBuf,
    },

    /// The file hit a terminal error and was disabled
    FileFailed {
        /// File id
        id: EntityId,
        /// Error message recorded on the file
        error: String,
    },

    /// Every file of the package reached `download_complete`
    PackageComplete {
        /// Package id
        id: EntityId,
    },

    /// Speed limit changed
    SpeedLimitChanged {
        /// New limit in bytes per second (None = unlimited)
        limit_bps: Option<u64>,
    },

    /// Graceful shutdown finished
    Shutdown,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_value_encoding() {
        assert_eq!(
            EntityId::from_value(&serde_json::json!(12)),
            Some(EntityId(12))
        );
        assert_eq!(EntityId::from_value(&serde_json::Value::Null), None);
        assert_eq!(EntityId(5).to_value(), serde_json::json!(5));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::FileComplete {
            id: EntityId(4),
            path: PathBuf::from("/done/a.bin"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_complete");
        assert_eq!(json["id"], 4);
    }
}
