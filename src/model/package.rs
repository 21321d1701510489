//! Package entity: a named group of files sharing a destination

use super::file::FileState;
use super::{PACKAGE, string_state};
use crate::error::Result;
use crate::store::{Attribute, Channel, EntityType, EntityView, TransactionContext};
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

string_state! {
    /// Package lifecycle
    PackageState {
        /// Links collected, not started
        Collect => "collect",
        /// At least one file was started
        Download => "download",
        /// Every enabled file finished
        DownloadComplete => "download_complete",
    }
}

const SYNCED: &[Channel] = &[Channel::REMOTE_SYNC, Channel::PERSISTENCE];

/// Declaration of the `package` entity type
pub fn entity_type() -> EntityType {
    EntityType::new(PACKAGE)
        .attribute(Attribute::new("name").channels(SYNCED))
        .attribute(Attribute::new("destination").channels(SYNCED))
        .attribute(
            Attribute::new("position")
                .default_value(0)
                .channels(SYNCED),
        )
        .attribute(
            Attribute::new("state")
                .default_value(PackageState::Collect)
                .channels(SYNCED)
                .fire_event()
                .setter(|value| {
                    let text = value.as_str().ok_or("state must be a string")?;
                    text.parse::<PackageState>()?;
                    Ok(value)
                }),
        )
        .attribute(Attribute::new("added").channels(SYNCED))
        .attribute(
            Attribute::new("size")
                .channels(&[Channel::REMOTE_SYNC])
                .getter(|view| json!(sum_files(view, "size")))
                .cached(),
        )
        .attribute(
            Attribute::new("progress")
                .channels(&[Channel::REMOTE_SYNC])
                .getter(|view| json!(sum_files(view, "progress"))),
        )
        .attribute(
            Attribute::new("speed")
                .channels(&[Channel::REMOTE_SYNC])
                .getter(|view| json!(sum_files(view, "speed"))),
        )
}

fn sum_files(view: &EntityView<'_>, attribute: &str) -> u64 {
    view.children("files")
        .into_iter()
        .map(|f| view.related(f).get_u64(attribute))
        .sum()
}

/// Create a package in `collect` state at the end of the queue
pub fn create(ctx: &mut TransactionContext, name: &str, destination: Option<&str>) -> Result<EntityId> {
    let position = ctx
        .ids(PACKAGE)
        .into_iter()
        .filter_map(|id| ctx.get_as::<i64>(id, "position").ok())
        .max()
        .map_or(0, |p| p + 1);
    ctx.create(
        PACKAGE,
        &[
            ("name", json!(name)),
            ("destination", json!(destination.unwrap_or(name))),
            ("position", json!(position)),
            ("added", json!(chrono::Utc::now().timestamp())),
        ],
    )
}

/// Promote the owning package of `file` once all its enabled files are done
///
/// Disabled files (fatal errors, duplicates) do not hold the package back,
/// but at least one file must have completed.
pub fn complete_if_done(ctx: &mut TransactionContext, file: EntityId) -> Result<()> {
    let Some(package) = EntityId::from_value(&ctx.get(file, "package")?) else {
        return Ok(());
    };
    if !ctx.exists(package) {
        return Ok(());
    }
    let mut any_complete = false;
    for member in ctx.children(package, "files")? {
        let state: FileState = ctx.get_as(member, "state")?;
        if state == FileState::DownloadComplete {
            any_complete = true;
            continue;
        }
        if ctx.get_as::<bool>(member, "enabled")? {
            return Ok(());
        }
    }
    if any_complete && ctx.set(package, "state", PackageState::DownloadComplete)? {
        tracing::info!(package_id = package.0, "package complete");
    }
    Ok(())
}

/// Plain-data view of a package
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageSnapshot {
    /// Entity id
    pub id: EntityId,
    /// Display name
    pub name: String,
    /// Folder below the download directory
    pub destination: Option<String>,
    /// Queue position
    pub position: i64,
    /// Lifecycle state
    pub state: PackageState,
    /// Unix timestamp of creation
    pub added: Option<i64>,
    /// Sum of file sizes
    pub size: u64,
    /// Sum of bytes downloaded
    pub progress: u64,
    /// Combined throughput in bytes per second
    pub speed: u64,
    /// Member files in insertion order
    pub files: Vec<EntityId>,
}

/// Read a package's attributes as seen by `ctx`
pub fn snapshot(ctx: &TransactionContext, id: EntityId) -> Result<PackageSnapshot> {
    let mut map: serde_json::Map<String, Value> = ctx
        .serialize(id, &[Channel::REMOTE_SYNC, Channel::PERSISTENCE])?
        .into_iter()
        .collect();
    map.insert("id".to_string(), id.to_value());
    map.insert("files".to_string(), json!(ctx.children(id, "files")?));
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Files of a package
pub fn files(ctx: &TransactionContext, id: EntityId) -> Result<Vec<EntityId>> {
    ctx.children(id, "files")
}

/// Packages ordered by queue position
pub fn ordered(ctx: &TransactionContext) -> Vec<EntityId> {
    let mut ids: Vec<(i64, EntityId)> = ctx
        .ids(PACKAGE)
        .into_iter()
        .map(|id| (ctx.get_as(id, "position").unwrap_or(0), id))
        .collect();
    ids.sort();
    ids.into_iter().map(|(_, id)| id).collect()
}
