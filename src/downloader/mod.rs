//! Download engine split into focused submodules.
//!
//! The [`Downloader`] struct and its methods are organized by domain:
//! - [`hoster`] - Plugin boundary (link checks, range streams)
//! - [`http`] - Plain HTTP(S) hoster on top of reqwest
//! - [`account`] - Accounts and weight-based selection
//! - [`pool`] - Resizable connection pools (per host and per account)
//! - [`planning`] - Chunk layout planning and resume
//! - [`intake`] - Adding packages, link checks, queueing
//! - [`control`] - Start / stop / enable / delete / speed limit
//! - [`lifecycle`] - Restore, persistence writer, shutdown
//! - `file_task` - Per-file supervisor (admission, chunk fan-out)
//! - `chunk_task` - One streaming connection writing one byte range
//! - `surgery` - Tail merge and range-rejection repair
//! - `completion` - Final move, dedup and retry bookkeeping

pub mod account;
mod chunk_task;
mod completion;
mod control;
mod file_task;
pub mod hoster;
pub mod http;
mod intake;
mod lifecycle;
pub mod planning;
pub mod pool;
mod speed;
mod surgery;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use account::{ANY_HOST, Account, AccountList, AccountSelector};
pub use hoster::{
    ByteStream, ChunkRequest, ChunkResponse, Continuation, HosterError, HosterPlugin, LinkInfo,
};
pub use http::HttpHoster;
pub use planning::plan_ranges;
pub use pool::{DownloadPool, HostPools, PoolSlot};

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::speed_limiter::SpeedLimiter;
use crate::store::Store;
use crate::types::{EntityId, Event};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use tokio_util::sync::CancellationToken;

/// Running file task, keyed by file id
#[derive(Debug)]
pub(crate) struct ActiveFile {
    /// Distinguishes successive runs of the same file
    pub(crate) run: u64,
    pub(crate) cancel: CancellationToken,
    /// Started again while this run was unwinding
    pub(crate) restart: bool,
}

/// Task bookkeeping shared by every clone of the engine
#[derive(Clone, Debug)]
pub(crate) struct TaskState {
    /// File tasks currently running
    pub(crate) active: Arc<Mutex<HashMap<EntityId, ActiveFile>>>,
    /// Delayed restarts waiting for their timer
    pub(crate) scheduled: Arc<Mutex<HashMap<EntityId, CancellationToken>>>,
    /// Destination paths owned by running files
    pub(crate) claimed_paths: Arc<Mutex<HashMap<PathBuf, EntityId>>>,
    pub(crate) next_run: Arc<AtomicU64>,
    /// Cleared during shutdown; no new file task starts afterwards
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Stops background loops (event bridge, delayed restarts)
    pub(crate) shutdown: CancellationToken,
}

impl TaskState {
    fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            scheduled: Arc::new(Mutex::new(HashMap::new())),
            claimed_paths: Arc::new(Mutex::new(HashMap::new())),
            next_run: Arc::new(AtomicU64::new(1)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Main engine instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Downloader {
    /// Database instance for persistence
    /// Public for integration tests to inspect persisted rows
    pub db: Arc<Database>,
    /// Entity store holding packages, files and chunks
    pub(crate) store: Store,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Plugin that talks to the remote side
    pub(crate) hoster: Arc<dyn HosterPlugin>,
    /// Account selection for admission
    pub(crate) accounts: Arc<dyn AccountSelector>,
    /// Per-host connection pools
    pub(crate) host_pools: HostPools,
    /// Global speed limiter shared across all chunks (token bucket algorithm)
    pub(crate) speed_limiter: SpeedLimiter,
    /// Running and scheduled file tasks
    pub(crate) tasks: TaskState,
    /// Background writer mirroring the store into SQLite
    pub(crate) persistence: Arc<tokio::sync::Mutex<Option<lifecycle::PersistenceWriter>>>,
}

impl Downloader {
    /// Create an engine that downloads over plain HTTP(S)
    ///
    /// Every host is served by one anonymous account allowed
    /// `max_connections_per_host` connections.
    pub async fn new(config: Config) -> Result<Self> {
        let hoster = Arc::new(HttpHoster::new()?);
        let accounts = Arc::new(AccountList::anonymous(
            config.download.max_connections_per_host,
        ));
        Self::with_plugins(config, hoster, accounts).await
    }

    /// Create an engine with a custom hoster plugin and account selector
    ///
    /// This initializes all core components:
    /// - Creates the download and temp directories
    /// - Opens/creates the SQLite database and runs migrations
    /// - Restores packages, files and chunks into the store
    /// - Starts the persistence writer
    /// - Resumes every file that was downloading
    pub async fn with_plugins(
        config: Config,
        hoster: Arc<dyn HosterPlugin>,
        accounts: Arc<dyn AccountSelector>,
    ) -> Result<Self> {
        config.validate()?;

        for (dir, what) in [
            (&config.download.download_dir, "download"),
            (&config.download.temp_dir, "temp"),
        ] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create {what} directory '{}': {}", dir.display(), e),
                ))
            })?;
        }

        let db = Database::new(&config.persistence.database_path).await?;
        if db.was_unclean_shutdown().await? {
            tracing::warn!("previous session did not shut down cleanly, resuming from last flush");
        }
        db.set_clean_start().await?;

        let store = Store::new(crate::model::schema()?);
        lifecycle::restore(&store, &db).await?;

        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
        let speed_limiter = SpeedLimiter::new(config.download.speed_limit_bps);
        let host_pools = HostPools::new(config.download.max_connections_per_host);

        tracing::info!(
            hoster = hoster.name(),
            entities = store.len(),
            "download engine initialized"
        );

        let downloader = Self {
            db: Arc::new(db),
            store,
            event_tx,
            config: Arc::new(config),
            hoster,
            accounts,
            host_pools,
            speed_limiter,
            tasks: TaskState::new(),
            persistence: Arc::new(tokio::sync::Mutex::new(None)),
        };

        downloader.start_persistence().await?;
        downloader.spawn_event_bridge();
        downloader.resume_all()?;

        Ok(downloader)
    }

    /// Subscribe to engine events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// If a subscriber falls behind by more than 1000 events it receives
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The entity store
    ///
    /// Remote-sync listeners subscribe here; every read through a fresh
    /// context sees committed state only.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Resize the connection pool of one host
    pub fn set_host_connections(&self, host: &str, connections: usize) {
        self.host_pools.resize(host, connections);
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("hoster", &self.hoster.name())
            .field("active", &self.tasks.active.lock().len())
            .field("entities", &self.store.len())
            .finish()
    }
}
