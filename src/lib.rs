//! # rangedl
//!
//! Chunked, resumable download engine on top of a transactional entity store.
//!
//! Packages, files and byte-range chunks live in an in-memory [`Store`] with
//! typed attributes, foreign keys and nested transactions. Every committed
//! change is fanned out to listeners per channel: one debounced listener
//! mirrors the store into SQLite, another feeds remote clients.
//!
//! The [`Downloader`] splits each file into chunks, streams them in parallel
//! through a [`downloader::HosterPlugin`] and persists progress so an
//! interrupted download restarts from the bytes it already has.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rangedl::{Config, Downloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = Downloader::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let package = downloader.add_package(
//!         "isos",
//!         &["https://example.com/debian.iso".to_string()],
//!     )?;
//!     downloader.check_files(package).await?;
//!     downloader.start_package(package)?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Download engine (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Entity types: packages, files, chunks
pub mod model;
/// Retry logic with exponential backoff
pub mod retry;
/// Speed limiting with token bucket
pub mod speed_limiter;
/// Transactional entity store and change fan-out
pub mod store;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, FileCollisionAction};
pub use db::Database;
pub use downloader::{Account, AccountList, Downloader, HosterPlugin, HttpHoster};
pub use error::{DownloadError, Error, Result};
pub use model::{FileSnapshot, FileState, PackageSnapshot, PackageState};
pub use store::{Channel, ChannelListener, DiffAction, EntityDiff, Store, TransactionContext};
pub use types::{EntityId, Event};

/// Run the engine until a termination signal arrives, then shut it down.
///
/// Running downloads commit their progress and the store is flushed before
/// this returns, so the next start resumes where this one stopped.
///
/// On Unix both SIGTERM and Ctrl+C count; elsewhere only Ctrl+C.
///
/// # Example
///
/// ```no_run
/// use rangedl::{Downloader, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let downloader = Downloader::new(config).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(downloader).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: Downloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // registration can fail in sandboxes; ctrl_c still works there
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C, shutting down"),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C, shutting down"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
