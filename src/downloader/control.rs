//! File and package control: start, stop, enable, delete, mirrors, speed limit.

use crate::error::{DownloadError, Error, Result};
use crate::model::{FILE, FileState, PACKAGE, file, package};
use crate::store::ObservableList;
use crate::types::{EntityId, Event};
use serde_json::Value;
use std::sync::atomic::Ordering;

use super::Downloader;
use super::file_task::paths_for;
use super::intake::require;

impl Downloader {
    /// Start downloading a file now
    ///
    /// A pending retry timer is discarded. Starting a file whose task is
    /// already running is a no-op; a task that is still stopping hands over
    /// to a fresh run once it has unwound.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::NotFound`] if `id` is not a file
    /// - [`DownloadError::InvalidState`] if the file is disabled or complete
    /// - [`Error::ShuttingDown`] once [`Self::shutdown`] has begun
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use rangedl::*;
    /// # async fn example(downloader: Downloader, id: EntityId) -> Result<()> {
    /// downloader.start_file(id)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn start_file(&self, id: EntityId) -> Result<()> {
        if !self.tasks.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let mut ctx = self.store.context();
        require(&ctx, FILE, id)?;
        let snapshot = file::snapshot(&ctx, id)?;
        if !snapshot.enabled {
            return Err(invalid_state(id, "start", "disabled"));
        }
        if snapshot.state == FileState::DownloadComplete {
            return Err(invalid_state(id, "start", snapshot.state.as_str()));
        }
        ctx.transaction(|ctx| {
            ctx.set(id, "state", FileState::Download)?;
            ctx.set(id, "next_try", Value::Null)?;
            Ok(())
        })?;
        self.spawn_file_task(id);
        Ok(())
    }

    /// Stop a file and keep its progress
    ///
    /// The running task is cancelled (its connection slots are released as
    /// it unwinds), pending retries are dropped and the file goes back to
    /// `collect`. Chunk positions stay, so a later start resumes.
    pub fn stop_file(&self, id: EntityId) -> Result<()> {
        let mut ctx = self.store.context();
        require(&ctx, FILE, id)?;
        self.cancel_file_tasks(id);
        ctx.transaction(|ctx| {
            if file::state(ctx, id)? == FileState::Download {
                ctx.set(id, "state", FileState::Collect)?;
            }
            ctx.set(id, "next_try", Value::Null)?;
            Ok(())
        })?;
        tracing::info!(file_id = id.0, "file stopped");
        Ok(())
    }

    /// Re-enable a file after a terminal failure
    ///
    /// Clears the recorded error and the retry counter; a file that was
    /// downloading starts again right away.
    pub fn enable_file(&self, id: EntityId) -> Result<()> {
        let mut ctx = self.store.context();
        require(&ctx, FILE, id)?;
        let state = ctx.transaction(|ctx| {
            ctx.set(id, "enabled", true)?;
            ctx.set(id, "last_error", Value::Null)?;
            ctx.set(id, "retry_count", 0)?;
            file::state(ctx, id)
        })?;
        tracing::info!(file_id = id.0, "file enabled");
        if state == FileState::Download {
            self.spawn_file_task(id);
        }
        Ok(())
    }

    /// Delete a file, its chunks and its partial data
    pub async fn delete_file(&self, id: EntityId) -> Result<()> {
        let mut ctx = self.store.context();
        require(&ctx, FILE, id)?;
        let temp = paths_for(&ctx, &self.config, id)?.temp;
        self.cancel_file_tasks(id);
        ctx.transaction(|ctx| ctx.delete(id))?;
        remove_partial(&temp).await;
        tracing::info!(file_id = id.0, "file deleted");
        Ok(())
    }

    /// Delete a package together with all of its files
    pub async fn delete_package(&self, id: EntityId) -> Result<()> {
        let mut ctx = self.store.context();
        require(&ctx, PACKAGE, id)?;
        let files = package::files(&ctx, id)?;
        let mut temps = Vec::with_capacity(files.len());
        for member in &files {
            temps.push(paths_for(&ctx, &self.config, *member)?.temp);
            self.cancel_file_tasks(*member);
        }
        ctx.transaction(|ctx| ctx.delete(id))?;
        for temp in temps {
            remove_partial(&temp).await;
        }
        tracing::info!(package_id = id.0, files = files.len(), "package deleted");
        Ok(())
    }

    /// Append an alternative URL to a file's mirror list
    ///
    /// Returns false if the URL was already listed.
    pub fn add_mirror(&self, id: EntityId, url: &str) -> Result<bool> {
        let mut ctx = self.store.context();
        require(&ctx, FILE, id)?;
        ctx.transaction(|ctx| {
            let mut mirrors = ObservableList::new(ctx, id, "mirrors");
            if mirrors.items()?.iter().any(|m| m.as_str() == Some(url)) {
                return Ok(false);
            }
            mirrors.push(url)
        })
    }

    /// Change the global bandwidth limit (`None` = unlimited)
    pub fn set_speed_limit(&self, limit_bps: Option<u64>) {
        self.speed_limiter.set_limit(limit_bps);
        tracing::info!(?limit_bps, "speed limit changed");
        self.emit_event(Event::SpeedLimitChanged { limit_bps });
    }

    /// Current global bandwidth limit
    pub fn get_speed_limit(&self) -> Option<u64> {
        self.speed_limiter.get_limit()
    }

    /// Cancel the running task and any pending restart of `id`
    ///
    /// The task removes itself from the active set once it has unwound.
    pub(super) fn cancel_file_tasks(&self, id: EntityId) {
        if let Some(active) = self.tasks.active.lock().get_mut(&id) {
            active.cancel.cancel();
            active.restart = false;
        }
        if let Some(timer) = self.tasks.scheduled.lock().remove(&id) {
            timer.cancel();
        }
    }
}

fn invalid_state(id: EntityId, operation: &str, current_state: &str) -> Error {
    DownloadError::InvalidState {
        id,
        operation: operation.to_string(),
        current_state: current_state.to_string(),
    }
    .into()
}

async fn remove_partial(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove partial download"),
    }
}
