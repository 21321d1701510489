//! Chunk entity: a contiguous byte range `[begin, end)` of a file

use super::{CHUNK, FILE, string_state};
use crate::error::Result;
use crate::store::{Affects, Attribute, Channel, EntityType, ForeignKey, TransactionContext};
use crate::types::EntityId;
use serde_json::json;

string_state! {
    /// Chunk lifecycle
    ChunkState {
        /// Bytes between `pos` and `end` are still missing
        Download => "download",
        /// Every byte of the range is on disk
        Complete => "complete",
    }
}

const PERSISTED: &[Channel] = &[Channel::PERSISTENCE, Channel::INTERNAL];

fn file_attr(attribute: &'static str) -> Affects {
    Affects::Related {
        via: "file",
        attribute,
    }
}

/// Declaration of the `chunk` entity type
pub fn entity_type() -> EntityType {
    EntityType::new(CHUNK)
        .attribute(
            Attribute::new("file")
                .channels(&[Channel::PERSISTENCE])
                .foreign_key(ForeignKey::new(FILE, "chunks"))
                .affects(file_attr("progress"))
                .affects(file_attr("speed")),
        )
        .attribute(
            Attribute::new("begin")
                .default_value(0)
                .channels(PERSISTED)
                .affects(file_attr("progress")),
        )
        // null while the file size is unknown: read until EOF
        .attribute(Attribute::new("end").channels(PERSISTED))
        .attribute(
            Attribute::new("pos")
                .default_value(0)
                .channels(PERSISTED)
                .affects(file_attr("progress")),
        )
        .attribute(
            Attribute::new("state")
                .default_value(ChunkState::Download)
                .channels(PERSISTED),
        )
        .attribute(
            Attribute::new("speed")
                .default_value(json!(0.0))
                .channels(&[Channel::INTERNAL])
                .affects(file_attr("speed")),
        )
}

/// Byte range and cursor of one chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Chunk id
    pub id: EntityId,
    /// First byte of the range
    pub begin: u64,
    /// One past the last byte (`None` = until EOF)
    pub end: Option<u64>,
    /// Next byte to write
    pub pos: u64,
    /// Lifecycle state
    pub state: ChunkState,
}

impl ChunkLayout {
    /// Bytes still missing, `None` when the end is unknown
    pub fn remaining(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.pos))
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.pos.saturating_sub(self.begin)
    }

    /// Whether the chunk is finished
    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Complete
    }
}

/// Read the layout of one chunk
pub fn layout(ctx: &TransactionContext, id: EntityId) -> Result<ChunkLayout> {
    Ok(ChunkLayout {
        id,
        begin: ctx.get_as(id, "begin")?,
        end: ctx.get_as(id, "end")?,
        pos: ctx.get_as(id, "pos")?,
        state: ctx.get_as(id, "state")?,
    })
}

/// Create a chunk covering `[begin, end)` of `file`
pub fn create(
    ctx: &mut TransactionContext,
    file: EntityId,
    begin: u64,
    end: Option<u64>,
) -> Result<EntityId> {
    ctx.create(
        CHUNK,
        &[
            ("file", file.to_value()),
            ("begin", json!(begin)),
            ("end", json!(end)),
            ("pos", json!(begin)),
        ],
    )
}

/// Owning file of a chunk
pub fn file_of(ctx: &TransactionContext, id: EntityId) -> Result<Option<EntityId>> {
    Ok(EntityId::from_value(&ctx.get(id, "file")?))
}
