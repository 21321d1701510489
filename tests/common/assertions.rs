//! Custom test assertions for integration tests

use rangedl::{Downloader, EntityId, Event};
use std::time::Duration;

/// Result of waiting for a file to finish
#[derive(Debug)]
pub enum WaitResult {
    /// File downloaded and moved into place
    Completed,
    /// File failed with error
    Failed(String),
    /// Timeout waiting for completion
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for a file to reach a terminal state (complete or failed)
///
/// Subscribe before triggering the download and pass the receiver in, so
/// no event can slip by in between.
pub async fn wait_for_file(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    id: EntityId,
    timeout: Duration,
) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::FileComplete { id: event_id, .. }) if event_id == id => {
                    return WaitResult::Completed;
                }
                Ok(Event::FileFailed { id: event_id, error }) if event_id == id => {
                    return WaitResult::Failed(error);
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}

/// Wait for `PackageComplete` of `id`
pub async fn wait_for_package(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    id: EntityId,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::PackageComplete { id: event_id }) if event_id == id => return true,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

/// Assert that the package's files are all complete and nothing is left in temp
pub fn assert_package_done(downloader: &Downloader, package: EntityId) {
    let snapshot = downloader.package(package).expect("package exists");
    assert_eq!(snapshot.state, rangedl::PackageState::DownloadComplete);
    for id in snapshot.files {
        let file = downloader.file(id).expect("file exists");
        if file.enabled {
            assert_eq!(file.state, rangedl::FileState::DownloadComplete);
            assert_eq!(file.progress, file.size);
        }
    }
    assert!(
        downloader.store().ids(rangedl::model::CHUNK).is_empty(),
        "finished files keep no chunks"
    );
}
