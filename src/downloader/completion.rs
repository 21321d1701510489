//! End of a file run: final move, dedup, retry and failure bookkeeping

use crate::error::Result;
use crate::model::{FileState, file, package};
use crate::retry::backoff_delay;
use crate::types::{EntityId, Event};
use crate::utils::{get_unique_path, move_file};
use serde_json::Value;
use std::time::Duration;

use super::Downloader;
use super::file_task::{FileOutcome, FilePaths, paths_for};

impl Downloader {
    /// Move the finished temp file into place and retire the chunk layout
    ///
    /// The move happens first so that a file is never marked complete while
    /// its data is still in the temp directory. Other enabled files aiming at
    /// the same destination are disabled as "downloaded via" this one.
    pub(super) async fn finalize(&self, file_id: EntityId, paths: &FilePaths) -> Result<FileOutcome> {
        let final_path = match get_unique_path(&paths.target, self.config.download.file_collision) {
            Ok(path) => path,
            Err(e) => return Ok(FileOutcome::Fatal(e.to_string())),
        };
        move_file(&paths.temp, &final_path).await?;

        let duplicates = {
            let mut ctx = self.store.context();
            ctx.transaction(|ctx| {
                let url: String = ctx.get_as(file_id, "url")?;
                let mut duplicates = Vec::new();
                for other in file::all(ctx) {
                    if other == file_id
                        || !ctx.get_as::<bool>(other, "enabled")?
                        || file::state(ctx, other)? == FileState::DownloadComplete
                    {
                        continue;
                    }
                    if paths_for(ctx, &self.config, other)?.target != paths.target {
                        continue;
                    }
                    ctx.set(other, "enabled", false)?;
                    ctx.set(other, "last_error", format!("downloaded via {url}"))?;
                    ctx.set(other, "next_try", Value::Null)?;
                    duplicates.push(other);
                }

                file::clear_chunks(ctx, file_id)?;
                ctx.set(file_id, "retry_count", 0)?;
                ctx.set(file_id, "last_error", Value::Null)?;
                ctx.set(file_id, "next_try", Value::Null)?;
                ctx.set(file_id, "state", FileState::DownloadComplete)?;
                Ok(duplicates)
            })?
        };
        for duplicate in duplicates {
            tracing::info!(
                file_id = duplicate.0,
                via = file_id.0,
                "mirror already downloaded, disabling"
            );
            self.cancel_file_tasks(duplicate);
        }

        tracing::info!(
            file_id = file_id.0,
            path = %final_path.display(),
            "download complete"
        );
        Ok(FileOutcome::Complete(final_path))
    }

    /// Record how a run ended and schedule whatever comes next
    pub(super) fn settle(&self, file_id: EntityId, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Complete(path) => self.emit_event(Event::FileComplete { id: file_id, path }),
            FileOutcome::Retry {
                message,
                delay,
                reconnect,
            } => self.record_retry(file_id, message, delay, reconnect),
            FileOutcome::Deferred(delay) => self.schedule_start(file_id, delay),
            FileOutcome::Fatal(message) => self.record_failure(file_id, &message),
            FileOutcome::Cancelled => {
                tracing::debug!(file_id = file_id.0, "file task cancelled");
            }
            FileOutcome::Skipped => {}
        }
    }

    /// Recoverable failure: count it, publish `last_error`/`next_try` and
    /// schedule a resume; past the retry budget it becomes a failure
    fn record_retry(&self, file_id: EntityId, message: String, delay: Option<Duration>, reconnect: bool) {
        let retry = &self.config.retry;
        let mut ctx = self.store.context();
        let recorded = ctx.transaction(|ctx| {
            let attempt = ctx.get_as::<u32>(file_id, "retry_count")? + 1;
            if attempt > retry.max_attempts {
                return Ok(None);
            }
            let delay = delay.unwrap_or_else(|| backoff_delay(retry, attempt));
            let next_try = chrono::Utc::now().timestamp() + delay.as_secs_f64().ceil() as i64;
            ctx.set(file_id, "retry_count", attempt)?;
            ctx.set(file_id, "last_error", message.as_str())?;
            ctx.set(file_id, "next_try", next_try)?;
            Ok(Some((attempt, delay)))
        });

        match recorded {
            Ok(Some((attempt, delay))) => {
                tracing::warn!(
                    file_id = file_id.0,
                    error = %message,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reconnect,
                    "download failed, retry scheduled"
                );
                self.emit_event(Event::RetryScheduled {
                    id: file_id,
                    message,
                    delay_secs: delay.as_secs(),
                });
                if reconnect {
                    self.emit_event(Event::ReconnectRequested { id: file_id });
                }
                self.schedule_start(file_id, delay);
            }
            Ok(None) => {
                let message = format!(
                    "{message} (gave up after {} attempts)",
                    retry.max_attempts
                );
                self.record_failure(file_id, &message);
            }
            Err(e) => {
                tracing::debug!(file_id = file_id.0, error = %e, "could not record retry");
            }
        }
    }

    /// Terminal failure: disable the file until it is explicitly re-enabled
    pub(super) fn record_failure(&self, file_id: EntityId, message: &str) {
        let mut ctx = self.store.context();
        let recorded = ctx.transaction(|ctx| {
            ctx.set(file_id, "enabled", false)?;
            ctx.set(file_id, "last_error", message)?;
            ctx.set(file_id, "next_try", Value::Null)?;
            package::complete_if_done(ctx, file_id)
        });
        match recorded {
            Ok(()) => {
                tracing::error!(file_id = file_id.0, error = %message, "download failed");
                self.emit_event(Event::FileFailed {
                    id: file_id,
                    error: message.to_string(),
                });
            }
            Err(e) => {
                tracing::debug!(file_id = file_id.0, error = %e, "could not record failure");
            }
        }
    }

    /// Start `file_id` again after `delay`, replacing any pending timer
    pub(super) fn schedule_start(&self, file_id: EntityId, delay: Duration) {
        let timer = self.tasks.shutdown.child_token();
        if let Some(previous) = self.tasks.scheduled.lock().insert(file_id, timer.clone()) {
            previous.cancel();
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    engine.tasks.scheduled.lock().remove(&file_id);
                    let mut ctx = engine.store.context();
                    let cleared = ctx.transaction(|ctx| {
                        ctx.set(file_id, "next_try", Value::Null)?;
                        Ok(())
                    });
                    if cleared.is_ok() {
                        engine.spawn_file_task(file_id);
                    }
                }
            }
        });
    }
}
