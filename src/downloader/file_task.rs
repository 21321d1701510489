//! Per-file orchestration
//!
//! A file task claims the destination path, picks an account, waits for a
//! first connection slot, lays out chunks and then supervises the chunk
//! tasks: the first one opens alone, the rest fan out once it has an
//! answer from the server and only while pool capacity is free.

use crate::config::Config;
use crate::error::{DownloadError, Result};
use crate::model::{FileSnapshot, FileState, PackageState, file};
use crate::store::TransactionContext;
use crate::types::{EntityId, Event};
use crate::utils::{filename_from_url, temp_path};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Downloader;
use super::account::Account;
use super::chunk_task::{self, ChunkStop};
use super::hoster::{Continuation, HosterError};
use super::planning::{self, Layout};
use super::pool::{DownloadPool, PoolSlot};
use super::surgery::{self, RangeRepair};

/// How one run of a file ended
#[derive(Debug)]
pub(super) enum FileOutcome {
    /// Moved into place
    Complete(PathBuf),
    /// Recoverable failure, counts against the retry budget
    Retry {
        message: String,
        delay: Option<Duration>,
        reconnect: bool,
    },
    /// Admission refused for now; try again later without recording an error
    Deferred(Duration),
    /// Terminal failure, disables the file
    Fatal(String),
    /// Stopped through the cancellation token
    Cancelled,
    /// Nothing to do (disabled, finished or deleted)
    Skipped,
}

impl From<ChunkStop> for FileOutcome {
    fn from(stop: ChunkStop) -> Self {
        match stop {
            ChunkStop::Retry {
                message,
                delay,
                reconnect,
            } => FileOutcome::Retry {
                message,
                delay,
                reconnect,
            },
            ChunkStop::Fatal(message) => FileOutcome::Fatal(message),
            ChunkStop::Cancelled => FileOutcome::Cancelled,
            ChunkStop::NoConnection => FileOutcome::Retry {
                message: HosterError::NoMoreConnections.to_string(),
                delay: None,
                reconnect: false,
            },
            ChunkStop::RangeRejected => FileOutcome::Retry {
                message: HosterError::RangeRejected.to_string(),
                delay: None,
                reconnect: false,
            },
            ChunkStop::Complete | ChunkStop::Removed => FileOutcome::Skipped,
        }
    }
}

/// Whether later chunks may open, and with what
#[derive(Clone)]
pub(super) enum Gate {
    /// The first connection has not answered yet
    Pending,
    /// Open; carries the plugin's continuation, if any
    Open(Option<Continuation>),
}

/// One host slot plus one account slot
#[derive(Debug)]
pub(super) struct Slots {
    _host: PoolSlot,
    _account: PoolSlot,
}

impl Slots {
    async fn acquire(host: &DownloadPool, account: &DownloadPool) -> Self {
        let account = account.acquire().await;
        let host = host.acquire().await;
        Self {
            _host: host,
            _account: account,
        }
    }

    fn try_acquire(host: &DownloadPool, account: &DownloadPool) -> Option<Self> {
        let account = account.try_acquire()?;
        let host = host.try_acquire()?;
        Some(Self {
            _host: host,
            _account: account,
        })
    }
}

/// State shared between a file task and its chunk tasks
pub(super) struct FileRun {
    pub(super) engine: Downloader,
    pub(super) file: EntityId,
    pub(super) url: String,
    pub(super) account: Account,
    pub(super) host_pool: DownloadPool,
    pub(super) temp_path: PathBuf,
    /// Chunks that currently have a task
    pub(super) running: Mutex<HashSet<EntityId>>,
    pub(super) gate: watch::Sender<Gate>,
    /// Child of the file's token; also fired when a sibling fails
    pub(super) cancel: CancellationToken,
}

impl FileRun {
    pub(super) fn continuation(&self) -> Option<Continuation> {
        match &*self.gate.borrow() {
            Gate::Open(continuation) => continuation.clone(),
            Gate::Pending => None,
        }
    }

    fn gate_open(&self) -> bool {
        matches!(*self.gate.borrow(), Gate::Open(_))
    }
}

/// Where a file lives while downloading and once done
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct FilePaths {
    pub(super) name: String,
    pub(super) target: PathBuf,
    pub(super) temp: PathBuf,
}

/// Resolve the paths of `id`; unnamed files are named after their URL
pub(super) fn paths_for(ctx: &TransactionContext, config: &Config, id: EntityId) -> Result<FilePaths> {
    let url: String = ctx.get_as(id, "url")?;
    let name = match ctx.get_as::<Option<String>>(id, "name")? {
        Some(name) => name,
        None => filename_from_url(&url).unwrap_or_else(|| format!("file-{}", id.0)),
    };
    let destination = match EntityId::from_value(&ctx.get(id, "package")?) {
        Some(package) if ctx.exists(package) => ctx.get_as::<Option<String>>(package, "destination")?,
        _ => None,
    };
    let (target_dir, temp_dir) = match &destination {
        Some(dest) => (config.download_dir().join(dest), config.temp_dir().join(dest)),
        None => (config.download_dir().clone(), config.temp_dir().clone()),
    };
    Ok(FilePaths {
        target: target_dir.join(&name),
        temp: temp_path(&temp_dir, &name, &config.download.temp_suffix),
        name,
    })
}

/// Exclusive claim on a destination path, released on drop
pub(super) struct PathClaim {
    engine: Downloader,
    path: PathBuf,
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        self.engine.tasks.claimed_paths.lock().remove(&self.path);
    }
}

impl Downloader {
    /// Spawn the task for `file` unless one is already running
    ///
    /// If the current run was cancelled but has not exited yet, a new run is
    /// queued behind it instead.
    pub(super) fn spawn_file_task(&self, file: EntityId) -> bool {
        if !self
            .tasks
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return false;
        }
        let cancel = self.tasks.shutdown.child_token();
        let run = self
            .tasks
            .next_run
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        {
            let mut active = self.tasks.active.lock();
            if let Some(current) = active.get_mut(&file) {
                if current.cancel.is_cancelled() {
                    current.restart = true;
                    tracing::debug!(file_id = file.0, "restart queued behind stopping task");
                    return true;
                }
                return false;
            }
            active.insert(
                file,
                super::ActiveFile {
                    run,
                    cancel: cancel.clone(),
                    restart: false,
                },
            );
        }
        if let Some(timer) = self.tasks.scheduled.lock().remove(&file) {
            timer.cancel();
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = match engine.drive_file(file, &cancel).await {
                Ok(outcome) => outcome,
                Err(_) if !engine.store.exists(file) => FileOutcome::Skipped,
                Err(e) => {
                    tracing::error!(file_id = file.0, error = %e, "file task failed");
                    FileOutcome::Fatal(e.to_string())
                }
            };
            engine.settle(file, outcome);
            let restart = {
                let mut active = engine.tasks.active.lock();
                if active.get(&file).is_some_and(|current| current.run == run) {
                    active.remove(&file).is_some_and(|done| done.restart)
                } else {
                    false
                }
            };
            if restart {
                engine.spawn_file_task(file);
            }
        });
        true
    }

    fn claim_path(&self, path: &Path, file: EntityId) -> Option<PathClaim> {
        let mut claimed = self.tasks.claimed_paths.lock();
        match claimed.get(path) {
            Some(owner) if *owner != file => None,
            _ => {
                claimed.insert(path.to_path_buf(), file);
                Some(PathClaim {
                    engine: self.clone(),
                    path: path.to_path_buf(),
                })
            }
        }
    }

    async fn drive_file(&self, file_id: EntityId, cancel: &CancellationToken) -> Result<FileOutcome> {
        let config = &self.config.download;
        let (snapshot, paths): (FileSnapshot, FilePaths) = {
            let ctx = self.store.context();
            (file::snapshot(&ctx, file_id)?, paths_for(&ctx, &self.config, file_id)?)
        };
        if !snapshot.enabled || snapshot.state == FileState::DownloadComplete {
            return Ok(FileOutcome::Skipped);
        }

        let Some(_claim) = self.claim_path(&paths.target, file_id) else {
            tracing::debug!(
                file_id = file_id.0,
                path = %paths.target.display(),
                "destination busy, deferring"
            );
            return Ok(FileOutcome::Deferred(config.admission_retry));
        };

        let host = self.hoster.host_of(&snapshot.url);
        let Some(account) = self.accounts.select(&host) else {
            return Ok(FileOutcome::Retry {
                message: DownloadError::NoAccount { id: file_id }.to_string(),
                delay: Some(config.admission_retry),
                reconnect: false,
            });
        };
        let host_pool = self.host_pools.pool_for(&host);
        let slots = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(FileOutcome::Cancelled),
            slots = Slots::acquire(&host_pool, &account.pool) => slots,
        };

        let can_resume = snapshot.can_resume && account.can_resume;
        let budget = planning::chunk_budget(snapshot.max_chunks, config.max_chunks, &account);
        if let Some(parent) = paths.temp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_exists = tokio::fs::try_exists(&paths.temp).await.unwrap_or(false);

        let layout = {
            let mut ctx = self.store.context();
            ctx.transaction(|ctx| {
                if snapshot.name.is_none() {
                    ctx.set(file_id, "name", paths.name.as_str())?;
                }
                ctx.set(file_id, "state", FileState::Download)?;
                ctx.set(file_id, "account", account.name.as_str())?;
                ctx.set(file_id, "last_error", Value::Null)?;
                ctx.set(file_id, "next_try", Value::Null)?;
                if let Some(package) = snapshot.package
                    && ctx.exists(package)
                    && ctx.get_as::<PackageState>(package, "state")? == PackageState::Collect
                {
                    ctx.set(package, "state", PackageState::Download)?;
                }
                planning::prepare(
                    ctx,
                    file_id,
                    temp_exists,
                    can_resume,
                    budget,
                    config.min_chunk_size,
                )
            })?
        };
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(layout == Layout::Fresh)
            .open(&paths.temp)
            .await?;

        tracing::info!(
            file_id = file_id.0,
            url = %snapshot.url,
            account = %account.name,
            resumed = layout == Layout::Resumed,
            "download started"
        );
        self.emit_event(Event::FileStarted {
            id: file_id,
            account: account.name.clone(),
        });

        let run = Arc::new(FileRun {
            engine: self.clone(),
            file: file_id,
            url: snapshot.url.clone(),
            account,
            host_pool,
            temp_path: paths.temp.clone(),
            running: Mutex::new(HashSet::new()),
            gate: watch::channel(Gate::Pending).0,
            cancel: cancel.child_token(),
        });

        match supervise(&run, slots, budget).await? {
            None => self.finalize(file_id, &paths).await,
            Some(outcome) => Ok(outcome),
        }
    }
}

/// Run chunk tasks until every chunk is complete (`None`) or the run stops
async fn supervise(run: &Arc<FileRun>, first_slots: Slots, mut budget: u32) -> Result<Option<FileOutcome>> {
    let config = &run.engine.config.download;
    let mut tasks: JoinSet<(EntityId, ChunkStop)> = JoinSet::new();
    let mut gate_rx = run.gate.subscribe();
    let mut spare = Some(first_slots);
    let mut throttled: HashSet<EntityId> = HashSet::new();

    loop {
        let layouts = {
            let ctx = run.engine.store.context();
            file::chunks(&ctx, run.file)?
        };
        let pending: Vec<EntityId> = layouts
            .iter()
            .filter(|c| !c.is_complete())
            .map(|c| c.id)
            .collect();
        if pending.is_empty() && tasks.is_empty() {
            return Ok(None);
        }

        let gate_open = run.gate_open();
        for id in pending {
            let running = run.running.lock().len();
            if running >= budget as usize || (!gate_open && running > 0) {
                break;
            }
            if run.running.lock().contains(&id) || throttled.contains(&id) {
                continue;
            }
            let slots = match spare.take() {
                Some(slots) => slots,
                None if running == 0 => tokio::select! {
                    biased;
                    _ = run.cancel.cancelled() => return Ok(Some(FileOutcome::Cancelled)),
                    slots = Slots::acquire(&run.host_pool, &run.account.pool) => slots,
                },
                None => match Slots::try_acquire(&run.host_pool, &run.account.pool) {
                    Some(slots) => slots,
                    None => break,
                },
            };
            run.running.lock().insert(id);
            let first = !gate_open;
            let task_run = Arc::clone(run);
            tasks.spawn(async move { (id, chunk_task::run(task_run, id, first, slots).await) });
            if first {
                break;
            }
        }
        spare = None;

        if tasks.is_empty() {
            return Ok(Some(FileOutcome::Retry {
                message: HosterError::NoMoreConnections.to_string(),
                delay: Some(config.admission_retry),
                reconnect: false,
            }));
        }

        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => {
                drain(&mut tasks).await;
                return Ok(Some(FileOutcome::Cancelled));
            }
            _ = gate_rx.changed(), if !gate_open => {}
            joined = tasks.join_next() => {
                let Some(joined) = joined else { continue };
                let (id, stop) = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        run.cancel.cancel();
                        drain(&mut tasks).await;
                        return Ok(Some(FileOutcome::Fatal(format!("chunk task failed: {e}"))));
                    }
                };
                run.running.lock().remove(&id);
                match stop {
                    ChunkStop::Complete => throttled.clear(),
                    ChunkStop::Removed => {}
                    ChunkStop::NoConnection => {
                        tracing::debug!(file_id = run.file.0, chunk_id = id.0, "no connection left, chunk stays idle");
                        throttled.insert(id);
                    }
                    ChunkStop::RangeRejected => {
                        let mut ctx = run.engine.store.context();
                        let repair = ctx.transaction(|ctx| {
                            surgery::repair_rejected_range(ctx, run.file, id, budget)
                        })?;
                        match repair {
                            RangeRepair::MergedInto(_) => budget = budget.saturating_sub(1).max(1),
                            RangeRepair::Restarted => {}
                            RangeRepair::Exhausted => {
                                run.cancel.cancel();
                                drain(&mut tasks).await;
                                return Ok(Some(ChunkStop::RangeRejected.into()));
                            }
                        }
                    }
                    stop => {
                        run.cancel.cancel();
                        drain(&mut tasks).await;
                        return Ok(Some(stop.into()));
                    }
                }
            }
        }
    }
}

async fn drain(tasks: &mut JoinSet<(EntityId, ChunkStop)>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "chunk task ended abnormally");
        }
    }
}
