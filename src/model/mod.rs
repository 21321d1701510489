//! Package / File / Chunk entity declarations
//!
//! The download engine works exclusively through these entities; every
//! attribute listed here is exported on the channels it declares.

macro_rules! string_state {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Stored string form
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} {other:?}", stringify!($name))),
                }
            }
        }

        impl From<$name> for serde_json::Value {
            fn from(state: $name) -> Self {
                serde_json::Value::from(state.as_str())
            }
        }
    };
}

pub(crate) use string_state;

pub mod chunk;
pub mod file;
pub mod package;

pub use chunk::ChunkState;
pub use file::{FileSnapshot, FileState};
pub use package::{PackageSnapshot, PackageState};

use crate::error::SchemaError;
use crate::store::Schema;

/// Entity type name of packages
pub const PACKAGE: &str = "package";
/// Entity type name of files
pub const FILE: &str = "file";
/// Entity type name of chunks
pub const CHUNK: &str = "chunk";

/// Schema holding the three download entity types
pub fn schema() -> Result<Schema, SchemaError> {
    Schema::new(vec![
        package::entity_type(),
        file::entity_type(),
        chunk::entity_type(),
    ])
}
