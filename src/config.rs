//! Configuration types for rangedl

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Download behavior configuration (directories, chunking, bandwidth)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Completion directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Temporary directory used while chunks are in flight (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Suffix appended to the file name while it is being downloaded (default: ".part")
    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,

    /// Chunk budget used when an account does not cap it lower (default: 3)
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,

    /// Smallest range worth a separate connection, in bytes (default: 500 000)
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,

    /// How often chunk progress is committed to the store (default: 1 second)
    #[serde(default = "default_commit_interval", with = "duration_millis_serde")]
    pub commit_interval: Duration,

    /// Tail-merge threshold, in commit intervals of combined throughput (default: 3.0)
    ///
    /// When a chunk finishes and its idle successor has made less progress than
    /// `tail_merge_factor × throughput × commit_interval`, the successor is
    /// absorbed instead of being left as a straggler.
    #[serde(default = "default_tail_merge_factor")]
    pub tail_merge_factor: f64,

    /// Speed limit in bytes per second (None = unlimited)
    #[serde(default)]
    pub speed_limit_bps: Option<u64>,

    /// Concurrent connections allowed per host (default: 4)
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    /// File collision handling at the completion directory
    #[serde(default)]
    pub file_collision: FileCollisionAction,

    /// Delay before re-checking admission when the destination is busy (default: 10 seconds)
    #[serde(default = "default_admission_retry", with = "duration_serde")]
    pub admission_retry: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            temp_dir: default_temp_dir(),
            temp_suffix: default_temp_suffix(),
            max_chunks: default_max_chunks(),
            min_chunk_size: default_min_chunk_size(),
            commit_interval: default_commit_interval(),
            tail_merge_factor: default_tail_merge_factor(),
            speed_limit_bps: None,
            max_connections_per_host: default_max_connections_per_host(),
            file_collision: FileCollisionAction::default(),
            admission_retry: default_admission_retry(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts before a file is disabled (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./rangedl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How often buffered entity changes are flushed to SQLite (default: 500 ms)
    #[serde(default = "default_flush_interval", with = "duration_millis_serde")]
    pub flush_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            flush_interval: default_flush_interval(),
        }
    }
}

/// Remote UI synchronization configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Debounce window for remote-sync listeners (default: 250 ms)
    #[serde(default = "default_debounce_interval", with = "duration_millis_serde")]
    pub debounce_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_interval: default_debounce_interval(),
        }
    }
}

/// Main configuration for [`crate::Downloader`]
///
/// Download settings are flattened so the serialized form stays a single
/// level, matching how the other sections are nested by name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Retry policy for recoverable errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Remote UI synchronization
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Completion directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.download.download_dir
    }

    /// Temporary directory
    pub fn temp_dir(&self) -> &PathBuf {
        &self.download.temp_dir
    }

    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.download.max_chunks == 0 {
            return Err(crate::Error::Config {
                message: "max_chunks must be at least 1".to_string(),
                key: Some("max_chunks".to_string()),
            });
        }
        if self.download.min_chunk_size == 0 {
            return Err(crate::Error::Config {
                message: "min_chunk_size must be positive".to_string(),
                key: Some("min_chunk_size".to_string()),
            });
        }
        if self.download.commit_interval.is_zero() {
            return Err(crate::Error::Config {
                message: "commit_interval must be positive".to_string(),
                key: Some("commit_interval".to_string()),
            });
        }
        if self.download.max_connections_per_host == 0 {
            return Err(crate::Error::Config {
                message: "max_connections_per_host must be at least 1".to_string(),
                key: Some("max_connections_per_host".to_string()),
            });
        }
        Ok(())
    }
}

/// File collision handling strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCollisionAction {
    /// Append (1), (2), etc. to filename (default)
    #[default]
    Rename,
    /// Overwrite existing file
    Overwrite,
    /// Keep the existing file and fail the move
    Skip,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_temp_suffix() -> String {
    ".part".to_string()
}

fn default_max_chunks() -> u32 {
    3
}

fn default_min_chunk_size() -> u64 {
    500_000
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_tail_merge_factor() -> f64 {
    3.0
}

fn default_max_connections_per_host() -> usize {
    4
}

fn default_admission_retry() -> Duration {
    Duration::from_secs(10)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./rangedl.db")
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_debounce_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Sub-second intervals are configured in milliseconds
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.download.max_chunks, 3);
        assert_eq!(config.download.min_chunk_size, 500_000);
        assert_eq!(config.download.temp_suffix, ".part");
        assert_eq!(config.download.commit_interval, Duration::from_secs(1));
        assert_eq!(config.download.tail_merge_factor, 3.0);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.sync.debounce_interval, Duration::from_millis(250));
        config.validate().unwrap();
    }

    #[test]
    fn download_settings_are_flattened() {
        let config: Config = serde_json::from_str(
            r#"{"max_chunks": 8, "commit_interval": 200, "retry": {"max_attempts": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.download.max_chunks, 8);
        assert_eq!(config.download.commit_interval, Duration::from_millis(200));
        assert_eq!(config.retry.max_attempts, 2);
        // untouched retry fields keep their defaults
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["max_chunks"], 8);
        assert_eq!(json["retry"]["max_attempts"], 2);
    }

    #[test]
    fn validate_rejects_zero_chunk_budget() {
        let mut config = Config::default();
        config.download.max_chunks = 0;
        match config.validate() {
            Err(crate::Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("max_chunks"))
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn file_collision_uses_snake_case() {
        let action: FileCollisionAction = serde_json::from_str("\"overwrite\"").unwrap();
        assert_eq!(action, FileCollisionAction::Overwrite);
        assert_eq!(FileCollisionAction::default(), FileCollisionAction::Rename);
    }
}
