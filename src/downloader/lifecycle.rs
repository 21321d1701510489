//! Startup and shutdown coordination.

use crate::db::{Database, PersistedEntity};
use crate::error::Result;
use crate::model::{CHUNK, FILE, FileState, PACKAGE, PackageState, file};
use crate::store::{
    Channel, DebouncedListener, EntityDiff, ListenerId, Store, StoreEvent, TransactionContext,
};
use crate::types::{EntityId, Event};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Downloader;

/// Time allowed for running file tasks to wind down on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Debounced listener on the persistence channel plus the task draining it
pub(crate) struct PersistenceWriter {
    listener_id: ListenerId,
    flush_token: CancellationToken,
    flusher: JoinHandle<()>,
    writer_stop: CancellationToken,
    writer: JoinHandle<()>,
}

/// Rebuild the store from the database inside one outer transaction
///
/// Packages load first, then files, then chunks, so every foreign key finds
/// its parent. A row that cannot be recreated (unknown parent, value rejected
/// by a setter) is dropped with an error log. File states are applied last,
/// once every file exists, so completion hooks see the whole package.
pub(crate) async fn restore(store: &Store, db: &Database) -> Result<()> {
    let packages = db.load_entities(PACKAGE).await?;
    let files = db.load_entities(FILE).await?;
    let chunks = db.load_entities(CHUNK).await?;

    let mut ctx = store.context();
    let restored = ctx.transaction(|ctx| {
        let mut restored = 0usize;
        let mut file_states: Vec<(EntityId, Value)> = Vec::new();

        for (entity_type, rows) in [(PACKAGE, &packages), (FILE, &files), (CHUNK, &chunks)] {
            for row in rows {
                let mut values = restorable_values(ctx, entity_type, row)?;
                if entity_type == FILE
                    && let Some(idx) = values.iter().position(|(name, _)| *name == "state")
                {
                    file_states.push((row.id, values.remove(idx).1));
                }
                if restore_row(ctx, entity_type, row.id, &values) {
                    restored += 1;
                }
            }
        }

        for (id, state) in file_states {
            if !ctx.exists(id) {
                continue;
            }
            ctx.begin();
            match ctx.set(id, "state", state) {
                Ok(_) => {
                    ctx.commit()?;
                }
                Err(e) => {
                    ctx.abort()?;
                    tracing::error!(file_id = id.0, error = %e, "dropping invalid file state");
                }
            }
        }
        Ok(restored)
    })?;

    if let Some(next) = db.load_next_id().await? {
        store.reserve_ids_through(EntityId(next.0.saturating_sub(1)));
    }

    tracing::info!(
        packages = packages.len(),
        files = files.len(),
        chunks = chunks.len(),
        restored,
        "store restored from database"
    );
    Ok(())
}

/// Persisted values of `row` that the current schema still declares
fn restorable_values(
    ctx: &TransactionContext,
    entity_type: &str,
    row: &PersistedEntity,
) -> Result<Vec<(&'static str, Value)>> {
    let ty = ctx.store().schema().entity_type(entity_type)?.clone();
    let mut values = Vec::with_capacity(row.values.len());
    for (name, value) in &row.values {
        match ty.attributes().iter().find(|a| a.name() == name.as_str()) {
            Some(attribute) if !attribute.is_computed() => {
                values.push((attribute.name(), value.clone()));
            }
            Some(_) => {}
            None => tracing::warn!(
                entity_type,
                entity_id = row.id.0,
                attribute = %name,
                "ignoring unknown persisted attribute"
            ),
        }
    }
    Ok(values)
}

/// Recreate one row in a nested frame; false if it was dropped
fn restore_row(
    ctx: &mut TransactionContext,
    entity_type: &str,
    id: EntityId,
    values: &[(&'static str, Value)],
) -> bool {
    ctx.begin();
    let created = ctx.create_with_id(entity_type, id, values);
    let closed = match &created {
        Ok(_) => ctx.commit().map(|_| ()),
        Err(_) => ctx.abort(),
    };
    match (created, closed) {
        (Ok(_), Ok(())) => true,
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(entity_type, entity_id = id.0, error = %e, "dropping persisted row");
            false
        }
    }
}

impl Downloader {
    /// Start mirroring the persistence channel into SQLite
    ///
    /// Commits are buffered and written as one SQL transaction per flush
    /// interval; a failed batch is logged and the next one carries on.
    pub(super) async fn start_persistence(&self) -> Result<()> {
        let flush_token = CancellationToken::new();
        let (listener, mut rx, flusher) = DebouncedListener::spawn(
            &[Channel::PERSISTENCE],
            self.config.persistence.flush_interval,
            flush_token.clone(),
        );
        let listener_id = self.store.subscribe(listener);

        let writer_stop = CancellationToken::new();
        let stop = writer_stop.clone();
        let db = self.db.clone();
        let store = self.store.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    batch = rx.recv() => match batch {
                        Some(batch) => write_batch(&db, &store, &batch).await,
                        None => break,
                    },
                    _ = stop.cancelled() => {
                        while let Ok(batch) = rx.try_recv() {
                            write_batch(&db, &store, &batch).await;
                        }
                        break;
                    }
                }
            }
        });

        *self.persistence.lock().await = Some(PersistenceWriter {
            listener_id,
            flush_token,
            flusher,
            writer_stop,
            writer,
        });
        Ok(())
    }

    /// Debounced feed of remote-sync diffs
    ///
    /// Batches are merged per entity and released every
    /// `sync.debounce_interval`; shutdown releases one last batch.
    /// Pass the returned id to [`Store::unsubscribe`] to stop the feed.
    pub fn sync_changes(&self) -> (ListenerId, mpsc::UnboundedReceiver<Vec<EntityDiff>>) {
        let (listener, rx, _flusher) = DebouncedListener::spawn(
            &[Channel::REMOTE_SYNC],
            self.config.sync.debounce_interval,
            self.tasks.shutdown.child_token(),
        );
        (self.store.subscribe(listener), rx)
    }

    /// Translate store events into engine events
    pub(super) fn spawn_event_bridge(&self) {
        let mut events = self.store.events();
        let engine = self.clone();
        let shutdown = self.tasks.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(StoreEvent::Changed {
                        id,
                        entity_type: PACKAGE,
                        attribute: "state",
                        value,
                    }) if value.as_str() == Some(PackageState::DownloadComplete.as_str()) => {
                        engine.emit_event(Event::PackageComplete { id });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "store event bridge lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Restart every enabled file that was downloading
    ///
    /// Files waiting for a retry keep their schedule: they start once the
    /// persisted `next_try` has passed.
    pub fn resume_all(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut resumed = 0usize;
        let mut delayed = 0usize;
        let pending = {
            let ctx = self.store.context();
            let mut pending = Vec::new();
            for id in file::all(&ctx) {
                let snapshot = file::snapshot(&ctx, id)?;
                if snapshot.enabled && snapshot.state == FileState::Download {
                    pending.push((id, snapshot.next_try));
                }
            }
            pending
        };

        for (id, next_try) in pending {
            match next_try {
                Some(at) if at > now => {
                    self.schedule_start(id, Duration::from_secs((at - now) as u64));
                    delayed += 1;
                }
                _ => {
                    if self.spawn_file_task(id) {
                        resumed += 1;
                    }
                }
            }
        }

        if resumed + delayed > 0 {
            tracing::info!(resumed, delayed, "resumed downloads");
        }
        Ok(())
    }

    /// Gracefully shut down the engine
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new file tasks and cancels running ones
    /// 2. Waits for the file tasks to commit their progress (30 seconds max)
    /// 3. Flushes the persistence writer
    /// 4. Saves the id counter and marks a clean shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the final database writes fail. Every step is
    /// attempted even if an earlier one failed.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("initiating graceful shutdown");

        self.tasks
            .accepting_new
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.tasks.shutdown.cancel();

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.wait_for_active_files())
            .await
            .is_err()
        {
            tracing::warn!("timeout waiting for file tasks, proceeding with shutdown");
        }

        if let Some(writer) = self.persistence.lock().await.take() {
            self.store.unsubscribe(writer.listener_id);
            writer.flush_token.cancel();
            if let Err(e) = writer.flusher.await {
                tracing::error!(error = %e, "persistence flusher ended abnormally");
            }
            writer.writer_stop.cancel();
            if let Err(e) = writer.writer.await {
                tracing::error!(error = %e, "persistence writer ended abnormally");
            }
        }

        let saved = self.db.save_next_id(self.store.next_id()).await;
        if let Err(e) = &saved {
            tracing::error!(error = %e, "failed to save id counter");
        }
        self.db.set_clean_shutdown().await?;
        saved?;

        self.emit_event(Event::Shutdown);
        tracing::info!("graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_active_files(&self) {
        loop {
            let active = self.tasks.active.lock().len();
            if active == 0 {
                return;
            }
            tracing::debug!(active, "waiting for file tasks to stop");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn write_batch(db: &Database, store: &Store, batch: &[EntityDiff]) {
    match db.apply_diffs(batch).await {
        Ok(()) => {
            if let Err(e) = db.save_next_id(store.next_id()).await {
                tracing::error!(error = %e, "failed to save id counter");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, diffs = batch.len(), "failed to persist change batch");
        }
    }
}
