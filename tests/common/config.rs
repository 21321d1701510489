//! Test configuration helpers

use rangedl::{Config, Downloader};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Config rooted in `dir` with short intervals
///
/// Chunks may be as small as 1 KB so a few hundred kilobytes already split
/// into the default three ranges.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("rangedl.db");
    config.persistence.flush_interval = Duration::from_millis(20);
    config.download.download_dir = dir.join("downloads");
    config.download.temp_dir = dir.join("temp");
    config.download.min_chunk_size = 1_000;
    config.download.commit_interval = Duration::from_millis(50);
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(20);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter = false;
    config
}

/// HTTP engine in a fresh temp dir
///
/// Returns the downloader and temp directory (keep temp_dir alive for test duration)
pub async fn create_test_downloader() -> (Downloader, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let downloader = Downloader::new(test_config(temp_dir.path()))
        .await
        .expect("Failed to create downloader");
    (downloader, temp_dir)
}
