//! File entity: one download target made of byte-range chunks

use super::{FILE, PACKAGE, chunk, package, string_state};
use crate::error::Result;
use crate::store::{Affects, Attribute, Channel, EntityType, EntityView, ForeignKey, TransactionContext};
use crate::types::EntityId;
use crate::utils::parse_size;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

string_state! {
    /// File lifecycle
    FileState {
        /// Waiting for the hoster plugin to report name and size
        Check => "check",
        /// Checked, not yet started
        Collect => "collect",
        /// Queued or downloading
        Download => "download",
        /// All chunks finished and the file was moved into place
        DownloadComplete => "download_complete",
    }
}

const SYNCED: &[Channel] = &[Channel::REMOTE_SYNC, Channel::PERSISTENCE];

/// Declaration of the `file` entity type
pub fn entity_type() -> EntityType {
    EntityType::new(FILE)
        .attribute(
            Attribute::new("package")
                .channels(SYNCED)
                .foreign_key(ForeignKey::new(PACKAGE, "files"))
                .affects(related("size"))
                .affects(related("progress"))
                .affects(related("speed")),
        )
        .attribute(Attribute::new("url").channels(SYNCED))
        .attribute(Attribute::new("name").channels(SYNCED))
        .attribute(
            Attribute::new("size")
                .default_value(0)
                .channels(SYNCED)
                .setter(size_setter)
                .affects(related("size"))
                .affects(Affects::Local("progress")),
        )
        .attribute(
            Attribute::new("size_is_approximate")
                .default_value(false)
                .channels(SYNCED),
        )
        .attribute(
            Attribute::new("state")
                .default_value(FileState::Check)
                .channels(SYNCED)
                .fire_event()
                .setter(|value| {
                    let text = value.as_str().ok_or("state must be a string")?;
                    text.parse::<FileState>()?;
                    Ok(value)
                })
                .affects(Affects::Local("progress"))
                .on_change(|ctx, id, _old, new| {
                    if new.as_str() == Some(FileState::DownloadComplete.as_str()) {
                        package::complete_if_done(ctx, id)?;
                    }
                    Ok(())
                }),
        )
        .attribute(
            Attribute::new("enabled")
                .default_value(true)
                .channels(SYNCED)
                .fire_event(),
        )
        .attribute(
            Attribute::new("can_resume")
                .default_value(true)
                .channels(SYNCED),
        )
        .attribute(Attribute::new("max_chunks").channels(&[Channel::PERSISTENCE]))
        .attribute(
            Attribute::new("account")
                .channels(&[Channel::REMOTE_SYNC])
                .read_only(),
        )
        .attribute(Attribute::new("last_error").channels(SYNCED))
        .attribute(Attribute::new("next_try").channels(SYNCED))
        .attribute(
            Attribute::new("retry_count")
                .default_value(0)
                .channels(&[Channel::PERSISTENCE]),
        )
        .attribute(
            Attribute::new("mirrors")
                .default_value(json!([]))
                .channels(SYNCED),
        )
        .attribute(Attribute::new("added").channels(SYNCED))
        .attribute(
            Attribute::new("progress")
                .channels(&[Channel::REMOTE_SYNC])
                .getter(progress)
                .affects(related("progress")),
        )
        .attribute(
            Attribute::new("speed")
                .channels(&[Channel::REMOTE_SYNC])
                .getter(|view| {
                    let speed: f64 = view
                        .children("chunks")
                        .into_iter()
                        .map(|c| view.related(c).get_f64("speed"))
                        .sum();
                    json!(speed.round() as u64)
                })
                .affects(related("speed")),
        )
}

fn related(attribute: &'static str) -> Affects {
    Affects::Related {
        via: "package",
        attribute,
    }
}

/// Accepts byte counts, `null` (unknown) or human-readable strings like `"1.5 MB"`
fn size_setter(value: Value) -> std::result::Result<Value, String> {
    match &value {
        Value::Null => Ok(json!(0)),
        Value::Number(n) if n.is_u64() => Ok(value),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f >= 0.0 => Ok(json!(f.round() as u64)),
            _ => Err(format!("invalid size {n}")),
        },
        Value::String(s) => parse_size(s)
            .map(|bytes| json!(bytes))
            .ok_or_else(|| format!("cannot parse size {s:?}")),
        other => Err(format!("invalid size {other}")),
    }
}

/// Bytes written so far; the full size once complete
fn progress(view: &EntityView<'_>) -> Value {
    if view.get_str("state").as_deref() == Some(FileState::DownloadComplete.as_str()) {
        return json!(view.get_u64("size"));
    }
    let done: u64 = view
        .children("chunks")
        .into_iter()
        .map(|c| {
            let chunk = view.related(c);
            chunk.get_u64("pos").saturating_sub(chunk.get_u64("begin"))
        })
        .sum();
    json!(done)
}

/// Plain-data view of a file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// Entity id
    pub id: EntityId,
    /// Owning package
    pub package: Option<EntityId>,
    /// Primary URL
    pub url: String,
    /// File name once known
    pub name: Option<String>,
    /// Size in bytes (0 = unknown)
    pub size: u64,
    /// Whether the size is an estimate
    pub size_is_approximate: bool,
    /// Lifecycle state
    pub state: FileState,
    /// Disabled files are never started
    pub enabled: bool,
    /// Whether byte ranges are supported
    pub can_resume: bool,
    /// Chunk budget override
    pub max_chunks: Option<u32>,
    /// Account used for the current download
    pub account: Option<String>,
    /// Last recorded failure
    pub last_error: Option<String>,
    /// Unix timestamp of the scheduled retry
    pub next_try: Option<i64>,
    /// Retries since the last success
    pub retry_count: u32,
    /// Alternative URLs
    pub mirrors: Vec<String>,
    /// Unix timestamp of creation
    pub added: Option<i64>,
    /// Bytes downloaded
    pub progress: u64,
    /// Combined chunk throughput in bytes per second
    pub speed: u64,
}

/// Read a file's attributes as seen by `ctx`
pub fn snapshot(ctx: &TransactionContext, id: EntityId) -> Result<FileSnapshot> {
    let mut map: serde_json::Map<String, Value> = ctx
        .serialize(id, &[Channel::REMOTE_SYNC, Channel::PERSISTENCE])?
        .into_iter()
        .collect();
    map.insert("id".to_string(), id.to_value());
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Current state of a file
pub fn state(ctx: &TransactionContext, id: EntityId) -> Result<FileState> {
    ctx.get_as(id, "state")
}

/// Chunks of a file ordered by their start offset
pub fn chunks(ctx: &TransactionContext, id: EntityId) -> Result<Vec<chunk::ChunkLayout>> {
    let mut layouts = ctx
        .children(id, "chunks")?
        .into_iter()
        .map(|c| chunk::layout(ctx, c))
        .collect::<Result<Vec<_>>>()?;
    layouts.sort_by_key(|c| c.begin);
    Ok(layouts)
}

/// Delete every chunk of a file
pub fn clear_chunks(ctx: &mut TransactionContext, id: EntityId) -> Result<()> {
    for chunk in ctx.children(id, "chunks")? {
        ctx.delete(chunk)?;
    }
    Ok(())
}

/// All file ids in the store visible to `ctx`
pub fn all(ctx: &TransactionContext) -> Vec<EntityId> {
    ctx.ids(FILE)
}
