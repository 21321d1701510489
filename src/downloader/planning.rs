//! Chunk planning and resume
//!
//! Runs inside the transaction that moves a file into `download`. Decides
//! whether the persisted layout can be reused or has to be laid out again.

use crate::Result;
use crate::model::{chunk, file};
use crate::store::TransactionContext;
use crate::types::EntityId;

use super::account::Account;

/// What happened to the on-disk data while laying out chunks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Layout {
    /// Persisted chunks are reused, the temp file keeps its content
    Resumed,
    /// Chunks were (re)planned, the temp file starts empty
    Fresh,
}

/// Split `[0, size)` into contiguous ranges
///
/// Uses at most `max_chunks` ranges and never makes them smaller than
/// `min_chunk_size` (except the only one). Every range but the last has the
/// same length. An unknown size (`0`) yields a single open-ended range.
pub fn plan_ranges(size: u64, max_chunks: u32, min_chunk_size: u64) -> Vec<(u64, Option<u64>)> {
    if size == 0 {
        return vec![(0, None)];
    }
    let by_size = (size / min_chunk_size.max(1)).max(1);
    let count = u64::from(max_chunks.max(1)).min(by_size);
    let step = size / count;
    (0..count)
        .map(|i| {
            let begin = i * step;
            let end = if i + 1 == count { size } else { begin + step };
            (begin, Some(end))
        })
        .collect()
}

/// Effective chunk budget: the file's own cap, the configured default and the
/// account's cap, whichever is lowest
pub(crate) fn chunk_budget(file_cap: Option<u32>, default_cap: u32, account: &Account) -> u32 {
    let mut budget = file_cap.unwrap_or(default_cap).min(default_cap);
    if let Some(cap) = account.max_chunks {
        budget = budget.min(cap);
    }
    budget.max(1)
}

/// Reuse or rebuild the chunk layout of `id`
///
/// Persisted chunks are only trusted when the temp file still exists and
/// the download can resume; otherwise they are discarded and the file is
/// planned from scratch. Non-resumable downloads always get exactly one
/// chunk spanning the whole file.
pub(crate) fn prepare(
    ctx: &mut TransactionContext,
    id: EntityId,
    temp_exists: bool,
    can_resume: bool,
    budget: u32,
    min_chunk_size: u64,
) -> Result<Layout> {
    let existing = file::chunks(ctx, id)?;
    if !existing.is_empty() {
        if temp_exists && can_resume {
            tracing::debug!(
                file_id = id.0,
                chunks = existing.len(),
                "resuming persisted chunk layout"
            );
            return Ok(Layout::Resumed);
        }
        tracing::warn!(
            file_id = id.0,
            temp_exists,
            can_resume,
            "discarding persisted chunks"
        );
        file::clear_chunks(ctx, id)?;
    }

    let size: u64 = ctx.get_as(id, "size")?;
    let ranges = if can_resume {
        plan_ranges(size, budget, min_chunk_size)
    } else {
        vec![(0, (size > 0).then_some(size))]
    };
    for (begin, end) in &ranges {
        chunk::create(ctx, id, *begin, *end)?;
    }
    tracing::debug!(file_id = id.0, size, chunks = ranges.len(), "planned chunks");
    Ok(Layout::Fresh)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{self, ChunkState, FILE};
    use crate::store::Store;
    use serde_json::json;

    fn store_with_file(size: u64) -> (Store, EntityId) {
        let store = Store::new(model::schema().unwrap());
        let mut ctx = store.context();
        let file = ctx
            .transaction(|ctx| {
                let package = model::package::create(ctx, "pkg", None)?;
                ctx.create(
                    FILE,
                    &[
                        ("package", package.to_value()),
                        ("url", json!("http://host.example/f")),
                        ("size", json!(size)),
                    ],
                )
            })
            .unwrap();
        (store, file)
    }

    #[test]
    fn ranges_are_contiguous_and_equal_but_the_last() {
        let ranges = plan_ranges(3_000_001, 3, 500_000);
        assert_eq!(
            ranges,
            vec![
                (0, Some(1_000_000)),
                (1_000_000, Some(2_000_000)),
                (2_000_000, Some(3_000_001)),
            ]
        );
    }

    #[test]
    fn small_files_get_fewer_chunks() {
        assert_eq!(plan_ranges(1_200_000, 8, 500_000).len(), 2);
        assert_eq!(plan_ranges(100, 8, 500_000), vec![(0, Some(100))]);
    }

    #[test]
    fn unknown_size_is_one_open_range() {
        assert_eq!(plan_ranges(0, 4, 500_000), vec![(0, None)]);
    }

    #[test]
    fn budget_takes_the_lowest_cap() {
        let free = Account::new("free", "*", 1).with_max_chunks(1);
        let premium = Account::new("premium", "*", 8);
        assert_eq!(chunk_budget(None, 3, &free), 1);
        assert_eq!(chunk_budget(None, 3, &premium), 3);
        assert_eq!(chunk_budget(Some(2), 3, &premium), 2);
        assert_eq!(chunk_budget(Some(0), 3, &premium), 1);
    }

    #[test]
    fn fresh_file_is_planned() {
        let (store, file) = store_with_file(3_000_000);
        let mut ctx = store.context();
        let layout = ctx
            .transaction(|ctx| prepare(ctx, file, false, true, 3, 500_000))
            .unwrap();
        assert_eq!(layout, Layout::Fresh);

        let chunks = file::chunks(&ctx, file).unwrap();
        let ranges: Vec<_> = chunks.iter().map(|c| (c.begin, c.end, c.pos)).collect();
        assert_eq!(
            ranges,
            vec![
                (0, Some(1_000_000), 0),
                (1_000_000, Some(2_000_000), 1_000_000),
                (2_000_000, Some(3_000_000), 2_000_000),
            ]
        );
    }

    #[test]
    fn persisted_layout_is_resumed_when_temp_file_exists() {
        let (store, file) = store_with_file(3_000_000);
        let mut ctx = store.context();
        ctx.transaction(|ctx| prepare(ctx, file, false, true, 3, 500_000))
            .unwrap();
        let first = file::chunks(&ctx, file).unwrap()[0].id;
        ctx.transaction(|ctx| {
            ctx.set(first, "pos", 400_000)?;
            Ok(())
        })
        .unwrap();

        let layout = ctx
            .transaction(|ctx| prepare(ctx, file, true, true, 3, 500_000))
            .unwrap();
        assert_eq!(layout, Layout::Resumed);
        let chunks = file::chunks(&ctx, file).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].pos, 400_000);
    }

    #[test]
    fn missing_temp_file_discards_chunks() {
        let (store, file) = store_with_file(3_000_000);
        let mut ctx = store.context();
        ctx.transaction(|ctx| prepare(ctx, file, false, true, 3, 500_000))
            .unwrap();
        let old: Vec<_> = file::chunks(&ctx, file)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();

        ctx.transaction(|ctx| prepare(ctx, file, false, true, 3, 500_000))
            .unwrap();
        let new = file::chunks(&ctx, file).unwrap();
        assert_eq!(new.len(), 3);
        assert!(new.iter().all(|c| !old.contains(&c.id)));
    }

    #[test]
    fn non_resumable_file_gets_one_chunk() {
        let (store, file) = store_with_file(3_000_000);
        let mut ctx = store.context();
        ctx.transaction(|ctx| prepare(ctx, file, false, true, 3, 500_000))
            .unwrap();

        let layout = ctx
            .transaction(|ctx| prepare(ctx, file, true, false, 3, 500_000))
            .unwrap();
        assert_eq!(layout, Layout::Fresh);
        let chunks = file::chunks(&ctx, file).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].begin, chunks[0].end), (0, Some(3_000_000)));
        assert_eq!(chunks[0].state, ChunkState::Download);
    }
}
