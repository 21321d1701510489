//! Layout changes on a running download
//!
//! Every function here runs inside a transaction owned by the caller, so a
//! failure leaves the committed layout untouched.

use crate::Result;
use crate::model::{ChunkState, chunk, file};
use crate::store::TransactionContext;
use crate::types::EntityId;
use serde_json::json;

/// Outcome of repairing a rejected range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RangeRepair {
    /// The chunk starts over from its first byte
    Restarted,
    /// The chunk was folded into the given predecessor
    MergedInto(EntityId),
    /// The range was rejected at its very start; nothing left to repair
    Exhausted,
}

/// Turn the layout into a single chunk `keep` covering the whole file
///
/// Used when the server turned out not to support ranges while `keep` is
/// already streaming from offset 0.
pub(crate) fn collapse_to_single(
    ctx: &mut TransactionContext,
    file_id: EntityId,
    keep: EntityId,
    size: Option<u64>,
) -> Result<()> {
    let others: Vec<_> = file::chunks(ctx, file_id)?
        .into_iter()
        .filter(|c| c.id != keep)
        .collect();
    for other in &others {
        ctx.delete(other.id)?;
    }
    ctx.set(keep, "begin", 0)?;
    ctx.set(keep, "end", json!(size))?;
    ctx.set(file_id, "can_resume", false)?;
    if !others.is_empty() {
        tracing::info!(
            file_id = file_id.0,
            dropped = others.len(),
            "server does not support ranges, continuing with a single connection"
        );
    }
    Ok(())
}

/// Repair the layout after the server rejected the range of `chunk_id`
///
/// A lone chunk (or the first one) restarts from its beginning, unless it
/// was already rejected there, which yields [`RangeRepair::Exhausted`]. Any other
/// chunk is merged backward into its predecessor, which is reopened if it
/// had already finished, and the file's chunk budget shrinks by one.
pub(crate) fn repair_rejected_range(
    ctx: &mut TransactionContext,
    file_id: EntityId,
    chunk_id: EntityId,
    budget: u32,
) -> Result<RangeRepair> {
    let layouts = file::chunks(ctx, file_id)?;
    let Some(idx) = layouts.iter().position(|c| c.id == chunk_id) else {
        return Ok(RangeRepair::Restarted);
    };
    let rejected = layouts[idx];

    if idx == 0 {
        let begin = if layouts.len() == 1 { 0 } else { rejected.begin };
        if rejected.pos == begin {
            return Ok(RangeRepair::Exhausted);
        }
        ctx.set(chunk_id, "begin", begin)?;
        ctx.set(chunk_id, "pos", begin)?;
        tracing::warn!(
            file_id = file_id.0,
            chunk_id = chunk_id.0,
            offset = begin,
            "range rejected, restarting chunk"
        );
        return Ok(RangeRepair::Restarted);
    }

    let previous = layouts[idx - 1];
    ctx.set(previous.id, "end", json!(rejected.end))?;
    if previous.is_complete() {
        ctx.set(previous.id, "state", ChunkState::Download)?;
    }
    ctx.delete(chunk_id)?;
    ctx.set(file_id, "max_chunks", budget.saturating_sub(1).max(1))?;
    tracing::warn!(
        file_id = file_id.0,
        chunk_id = chunk_id.0,
        into = previous.id.0,
        "range rejected, merged into previous chunk"
    );
    Ok(RangeRepair::MergedInto(previous.id))
}

/// Absorb the idle successor of `chunk_id` if it has barely started
///
/// `threshold` is the number of bytes below which the successor counts as
/// a straggler. Returns the extended end when a merge happened.
pub(crate) fn try_tail_merge(
    ctx: &mut TransactionContext,
    chunk_id: EntityId,
    is_running: impl Fn(EntityId) -> bool,
    threshold: u64,
) -> Result<Option<Option<u64>>> {
    let current = chunk::layout(ctx, chunk_id)?;
    let Some(end) = current.end else {
        return Ok(None);
    };
    let Some(file_id) = chunk::file_of(ctx, chunk_id)? else {
        return Ok(None);
    };
    let Some(next) = file::chunks(ctx, file_id)?
        .into_iter()
        .find(|c| c.begin == end && !c.is_complete())
    else {
        return Ok(None);
    };
    if is_running(next.id) || next.written() >= threshold {
        return Ok(None);
    }

    ctx.set(chunk_id, "end", json!(next.end))?;
    ctx.delete(next.id)?;
    tracing::debug!(
        file_id = file_id.0,
        chunk_id = chunk_id.0,
        absorbed = next.id.0,
        "tail merge"
    );
    Ok(Some(next.end))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{self, FILE};
    use crate::store::Store;

    fn planned(size: u64, chunks: u32) -> (Store, EntityId, Vec<EntityId>) {
        let store = Store::new(model::schema().unwrap());
        let mut ctx = store.context();
        let file_id = ctx
            .transaction(|ctx| {
                let package = model::package::create(ctx, "pkg", None)?;
                let f = ctx.create(
                    FILE,
                    &[
                        ("package", package.to_value()),
                        ("url", json!("http://host.example/f")),
                        ("size", json!(size)),
                    ],
                )?;
                crate::downloader::planning::prepare(ctx, f, false, true, chunks, 1)?;
                Ok(f)
            })
            .unwrap();
        let ids = file::chunks(&ctx, file_id)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        (store, file_id, ids)
    }

    #[test]
    fn rejected_middle_chunk_merges_backward() {
        let (store, file_id, ids) = planned(300, 3);
        let mut ctx = store.context();
        ctx.transaction(|ctx| {
            ctx.set(ids[0], "pos", 100)?;
            ctx.set(ids[0], "state", ChunkState::Complete)?;
            Ok(())
        })
        .unwrap();

        let repair = ctx
            .transaction(|ctx| repair_rejected_range(ctx, file_id, ids[1], 3))
            .unwrap();
        assert_eq!(repair, RangeRepair::MergedInto(ids[0]));

        let layouts = file::chunks(&ctx, file_id).unwrap();
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[0].end, Some(200));
        assert_eq!(layouts[0].state, ChunkState::Download);
        assert_eq!(ctx.get_as::<u32>(file_id, "max_chunks").unwrap(), 2);
    }

    #[test]
    fn rejected_lone_chunk_restarts_from_zero() {
        let (store, file_id, ids) = planned(300, 1);
        let mut ctx = store.context();
        ctx.transaction(|ctx| {
            ctx.set(ids[0], "pos", 120)?;
            Ok(())
        })
        .unwrap();

        let repair = ctx
            .transaction(|ctx| repair_rejected_range(ctx, file_id, ids[0], 1))
            .unwrap();
        assert_eq!(repair, RangeRepair::Restarted);
        assert_eq!(chunk::layout(&ctx, ids[0]).unwrap().pos, 0);

        let again = ctx
            .transaction(|ctx| repair_rejected_range(ctx, file_id, ids[0], 1))
            .unwrap();
        assert_eq!(again, RangeRepair::Exhausted);
    }

    #[test]
    fn idle_straggler_is_absorbed() {
        let (store, file_id, ids) = planned(300, 3);
        let mut ctx = store.context();
        ctx.transaction(|ctx| {
            ctx.set(ids[0], "pos", 100)?;
            ctx.set(ids[1], "pos", 105)?;
            Ok(())
        })
        .unwrap();

        let merged = ctx
            .transaction(|ctx| try_tail_merge(ctx, ids[0], |_| false, 10))
            .unwrap();
        assert_eq!(merged, Some(Some(200)));
        assert!(!ctx.exists(ids[1]));
        assert_eq!(file::chunks(&ctx, file_id).unwrap().len(), 2);
    }

    #[test]
    fn running_or_advanced_successor_is_left_alone() {
        let (store, _file_id, ids) = planned(300, 3);
        let mut ctx = store.context();
        ctx.transaction(|ctx| {
            ctx.set(ids[0], "pos", 100)?;
            ctx.set(ids[1], "pos", 150)?;
            Ok(())
        })
        .unwrap();

        let running = ids[1];
        assert_eq!(
            ctx.transaction(|ctx| try_tail_merge(ctx, ids[0], |id| id == running, 1_000))
                .unwrap(),
            None
        );
        assert_eq!(
            ctx.transaction(|ctx| try_tail_merge(ctx, ids[0], |_| false, 10))
                .unwrap(),
            None
        );
        assert!(ctx.exists(ids[1]));
    }

    #[test]
    fn collapse_keeps_one_whole_file_chunk() {
        let (store, file_id, ids) = planned(300, 3);
        let mut ctx = store.context();
        ctx.transaction(|ctx| collapse_to_single(ctx, file_id, ids[0], Some(300)))
            .unwrap();

        let layouts = file::chunks(&ctx, file_id).unwrap();
        assert_eq!(layouts.len(), 1);
        assert_eq!((layouts[0].begin, layouts[0].end), (0, Some(300)));
        assert!(!ctx.get_as::<bool>(file_id, "can_resume").unwrap());
    }
}
