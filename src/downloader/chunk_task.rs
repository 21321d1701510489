//! One connection streaming one byte range into the temp file
//!
//! A chunk task opens `[pos, end)`, writes blocks at their offset and
//! commits `pos`/`speed` every `commit_interval`. When the range is
//! exhausted it either picks up more work (its `end` was extended, or it
//! absorbed an idle straggler) or marks the chunk complete.

use crate::error::Error;
use crate::model::{ChunkState, chunk};
use crate::retry::IsRetryable;
use crate::types::EntityId;
use futures::StreamExt;
use serde_json::json;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::file_task::{FileRun, Gate, Slots};
use super::hoster::{ByteStream, ChunkRequest, ChunkResponse, HosterError};
use super::speed::SpeedCounter;
use super::surgery;

/// Why a chunk task stopped
#[derive(Debug)]
pub(super) enum ChunkStop {
    /// The chunk reached `complete`
    Complete,
    /// The chunk entity disappeared (absorbed, collapsed or deleted)
    Removed,
    /// The server refused the range
    RangeRejected,
    /// The hoster has no connection left for this chunk
    NoConnection,
    /// Recoverable failure
    Retry {
        message: String,
        delay: Option<Duration>,
        reconnect: bool,
    },
    /// Terminal failure
    Fatal(String),
    /// Stopped through the file's cancellation token
    Cancelled,
}

impl From<HosterError> for ChunkStop {
    fn from(e: HosterError) -> Self {
        match e {
            HosterError::RangeRejected => ChunkStop::RangeRejected,
            HosterError::NoMoreConnections => ChunkStop::NoConnection,
            HosterError::Retry {
                message,
                delay,
                reconnect,
            } => ChunkStop::Retry {
                message,
                delay,
                reconnect,
            },
            HosterError::Fatal(message) => ChunkStop::Fatal(message),
            other if other.is_retryable() => ChunkStop::Retry {
                message: other.to_string(),
                delay: None,
                reconnect: false,
            },
            other => ChunkStop::Fatal(other.to_string()),
        }
    }
}

/// How a streamed range ended
enum StreamEnd {
    /// Range exhausted; carries the last throughput sample
    Done(f64),
    Stopped(ChunkStop),
}

/// Drive `chunk_id` until it completes or stops
///
/// `first` marks the task that opens the initial connection of this run;
/// it publishes the plugin's continuation through the run's gate.
pub(super) async fn run(run: Arc<FileRun>, chunk_id: EntityId, first: bool, slots: Slots) -> ChunkStop {
    let stop = drive(&run, chunk_id, first).await;
    drop(slots);
    if !matches!(stop, ChunkStop::Complete | ChunkStop::Removed) {
        let mut ctx = run.engine.store.context();
        let reset = ctx.transaction(|ctx| {
            if ctx.exists(chunk_id) {
                ctx.set(chunk_id, "speed", json!(0.0))?;
            }
            Ok(())
        });
        if let Err(e) = reset {
            tracing::debug!(chunk_id = chunk_id.0, error = %e, "could not reset chunk speed");
        }
    }
    stop
}

async fn drive(run: &FileRun, chunk_id: EntityId, mut first: bool) -> ChunkStop {
    let mut last_rate = 0.0;
    loop {
        let layout = {
            let ctx = run.engine.store.context();
            if !ctx.exists(chunk_id) {
                return ChunkStop::Removed;
            }
            match chunk::layout(&ctx, chunk_id) {
                Ok(layout) => layout,
                Err(e) => return store_stop(run, chunk_id, e),
            }
        };
        if layout.is_complete() {
            return ChunkStop::Complete;
        }
        if layout.end.is_some_and(|end| layout.pos >= end) {
            match finish_range(run, chunk_id, last_rate) {
                Ok(true) => return ChunkStop::Complete,
                Ok(false) => continue,
                Err(e) => return store_stop(run, chunk_id, e),
            }
        }
        if run.cancel.is_cancelled() {
            return ChunkStop::Cancelled;
        }

        let request = ChunkRequest {
            file: run.file,
            url: run.url.clone(),
            begin: layout.pos,
            end: layout.end,
            account: run.account.clone(),
        };
        let continuation = run.continuation();
        let hoster = Arc::clone(&run.engine.hoster);
        let open = async {
            if first {
                hoster.open_first(&request).await
            } else {
                hoster.open_next(&request, continuation.as_ref()).await
            }
        };
        let opened = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return ChunkStop::Cancelled,
            opened = open => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(
                    file_id = run.file.0,
                    chunk_id = chunk_id.0,
                    offset = layout.pos,
                    error = %e,
                    "could not open range"
                );
                return e.into();
            }
        };

        let end = match apply_response(run, chunk_id, layout.pos, &response) {
            Ok(Some(end)) => end,
            Ok(None) => return ChunkStop::RangeRejected,
            Err(e) => return store_stop(run, chunk_id, e),
        };
        if first {
            run.gate.send_replace(Gate::Open(response.continuation.clone()));
            first = false;
        }

        match stream_range(run, chunk_id, layout.pos, end, response.stream).await {
            StreamEnd::Done(rate) => last_rate = rate,
            StreamEnd::Stopped(stop) => return stop,
        }
        match finish_range(run, chunk_id, last_rate) {
            Ok(true) => return ChunkStop::Complete,
            Ok(false) => {}
            Err(e) => return store_stop(run, chunk_id, e),
        }
    }
}

/// Fold what the server announced into the file
///
/// Size and name follow first-writer-wins; a server that cannot resume
/// collapses the layout to this chunk if it streams from offset 0, and is a
/// range rejection otherwise. Returns the end to stream to.
fn apply_response(
    run: &FileRun,
    chunk_id: EntityId,
    offset: u64,
    response: &ChunkResponse,
) -> crate::Result<Option<Option<u64>>> {
    let file_id = run.file;
    let mut ctx = run.engine.store.context();
    ctx.transaction(|ctx| {
        if let Some(size) = response.size {
            let recorded: u64 = ctx.get_as(file_id, "size")?;
            let approximate: bool = ctx.get_as(file_id, "size_is_approximate")?;
            if recorded == 0 || approximate {
                ctx.set(file_id, "size", size)?;
                ctx.set(file_id, "size_is_approximate", false)?;
            } else if recorded != size {
                tracing::warn!(
                    file_id = file_id.0,
                    recorded,
                    announced = size,
                    "server announced a different size, keeping the recorded one"
                );
            }
        }
        if let Some(name) = &response.name {
            match ctx.get_as::<Option<String>>(file_id, "name")? {
                None => {
                    ctx.set(file_id, "name", name.as_str())?;
                }
                Some(recorded) if recorded != *name => tracing::warn!(
                    file_id = file_id.0,
                    recorded = %recorded,
                    announced = %name,
                    "server announced a different name, keeping the recorded one"
                ),
                Some(_) => {}
            }
        }

        let size: u64 = ctx.get_as(file_id, "size")?;
        let size = (size > 0).then_some(size);
        let mut end = chunk::layout(ctx, chunk_id)?.end;
        if response.can_resume == Some(false) {
            if offset != 0 {
                return Ok(None);
            }
            surgery::collapse_to_single(ctx, file_id, chunk_id, size)?;
            end = size;
        } else if end.is_none() && size.is_some() {
            ctx.set(chunk_id, "end", json!(size))?;
            end = size;
        }
        Ok(Some(end))
    })
}

async fn stream_range(
    run: &FileRun,
    chunk_id: EntityId,
    start: u64,
    end: Option<u64>,
    mut stream: ByteStream,
) -> StreamEnd {
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .open(&run.temp_path)
        .await
    {
        Ok(file) => file,
        Err(e) => return StreamEnd::Stopped(ChunkStop::Fatal(format!("cannot open temp file: {e}"))),
    };
    if let Err(e) = file.seek(SeekFrom::Start(start)).await {
        return StreamEnd::Stopped(ChunkStop::Fatal(format!("cannot seek temp file: {e}")));
    }

    let interval = run.engine.config.download.commit_interval;
    let mut speed = SpeedCounter::new();
    let mut rate = 0.0;
    let mut pos = start;
    let mut last_commit = Instant::now();

    let stop = loop {
        let item = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => break Some(ChunkStop::Cancelled),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(block)) => {
                let take = match end {
                    Some(end) => end.saturating_sub(pos).min(block.len() as u64) as usize,
                    None => block.len(),
                };
                if take > 0 {
                    tokio::select! {
                        biased;
                        _ = run.cancel.cancelled() => break Some(ChunkStop::Cancelled),
                        _ = run.engine.speed_limiter.acquire(take as u64) => {}
                    }
                    if let Err(e) = file.write_all(&block[..take]).await {
                        break Some(ChunkStop::Fatal(format!("write failed: {e}")));
                    }
                    pos += take as u64;
                    speed.add(take as u64);
                }
                if end.is_some_and(|end| pos >= end) {
                    break None;
                }
                if last_commit.elapsed() >= interval {
                    if let Err(e) = file.flush().await {
                        break Some(ChunkStop::Fatal(format!("write failed: {e}")));
                    }
                    rate = speed.sample();
                    if let Err(stop) = commit(run, chunk_id, pos, rate) {
                        break Some(stop);
                    }
                    last_commit = Instant::now();
                }
            }
            Some(Err(e)) => break Some(e.into()),
            None => match end {
                None => {
                    // EOF of an open-ended range defines the size
                    if let Err(stop) = settle_open_end(run, chunk_id, pos) {
                        break Some(stop);
                    }
                    break None;
                }
                Some(end) => {
                    break Some(ChunkStop::Retry {
                        message: format!("connection closed at byte {pos} of {end}"),
                        delay: None,
                        reconnect: false,
                    });
                }
            },
        }
    };

    if let Err(e) = file.flush().await {
        return StreamEnd::Stopped(ChunkStop::Fatal(format!("write failed: {e}")));
    }
    if stop.is_none() {
        rate = speed.sample();
    }
    let committed = commit(run, chunk_id, pos, 0.0);
    match (stop, committed) {
        (Some(stop), _) => StreamEnd::Stopped(stop),
        (None, Err(stop)) => StreamEnd::Stopped(stop),
        (None, Ok(())) => StreamEnd::Done(rate),
    }
}

fn commit(run: &FileRun, chunk_id: EntityId, pos: u64, rate: f64) -> Result<(), ChunkStop> {
    let mut ctx = run.engine.store.context();
    ctx.transaction(|ctx| {
        ctx.set(chunk_id, "pos", pos)?;
        ctx.set(chunk_id, "speed", json!(rate))?;
        Ok(())
    })
    .map_err(|e| store_stop(run, chunk_id, e))
}

fn settle_open_end(run: &FileRun, chunk_id: EntityId, pos: u64) -> Result<(), ChunkStop> {
    let file_id = run.file;
    let mut ctx = run.engine.store.context();
    ctx.transaction(|ctx| {
        ctx.set(chunk_id, "end", pos)?;
        let recorded: u64 = ctx.get_as(file_id, "size")?;
        let approximate: bool = ctx.get_as(file_id, "size_is_approximate")?;
        if recorded == 0 || approximate {
            ctx.set(file_id, "size", pos)?;
            ctx.set(file_id, "size_is_approximate", false)?;
        }
        Ok(())
    })
    .map_err(|e| store_stop(run, chunk_id, e))
}

/// Close out an exhausted range
///
/// Returns `false` when the chunk has more to do: its `end` was extended by
/// a backward merge, or it absorbed an idle successor.
fn finish_range(run: &FileRun, chunk_id: EntityId, own_rate: f64) -> crate::Result<bool> {
    let config = &run.engine.config.download;
    let file_id = run.file;
    let mut ctx = run.engine.store.context();
    ctx.transaction(|ctx| {
        let layout = chunk::layout(ctx, chunk_id)?;
        if layout.end.is_some_and(|end| layout.pos < end) {
            return Ok(false);
        }

        let others: u64 = ctx.get_as(file_id, "speed")?;
        let combined = others as f64 + own_rate;
        let threshold =
            (config.tail_merge_factor * combined * config.commit_interval.as_secs_f64()) as u64;
        let running = |id: EntityId| run.running.lock().contains(&id);
        if surgery::try_tail_merge(ctx, chunk_id, running, threshold)?.is_some() {
            return Ok(false);
        }

        ctx.set(chunk_id, "state", ChunkState::Complete)?;
        ctx.set(chunk_id, "speed", json!(0.0))?;
        Ok(true)
    })
}

fn store_stop(run: &FileRun, chunk_id: EntityId, e: Error) -> ChunkStop {
    if !run.engine.store.exists(chunk_id) {
        return ChunkStop::Removed;
    }
    tracing::error!(
        file_id = run.file.0,
        chunk_id = chunk_id.0,
        error = %e,
        "chunk bookkeeping failed"
    );
    ChunkStop::Fatal(e.to_string())
}
