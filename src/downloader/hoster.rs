//! Hoster plugin boundary
//!
//! The engine never interprets protocol details: it asks a [`HosterPlugin`]
//! to check links and to open byte-range streams, and reacts to the typed
//! [`ChunkResponse`] / [`HosterError`] it gets back.

use crate::types::EntityId;
use futures::Stream;
use std::any::Any;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::account::Account;

/// Body of an opened range, yielded in blocks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, HosterError>> + Send>>;

/// Opaque state a plugin hands from the first connection to later ones
/// (session cookies, resolved direct links, ...)
pub type Continuation = Arc<dyn Any + Send + Sync>;

/// Failures reported by a hoster plugin
#[derive(Debug, Error)]
pub enum HosterError {
    /// Connection could not be established or broke mid-stream
    #[error("connection error: {0}")]
    Connection(String),

    /// Unexpected HTTP status
    #[error("server returned status {0}")]
    Status(u16),

    /// The server refused the requested byte range
    #[error("requested range was rejected")]
    RangeRejected,

    /// The hoster allows no further parallel connections right now
    #[error("no more connections available")]
    NoMoreConnections,

    /// Plugin-requested retry
    #[error("{message}")]
    Retry {
        /// Reason recorded on the file
        message: String,
        /// Explicit delay; backoff applies when absent
        delay: Option<Duration>,
        /// Ask for a new IP before retrying
        reconnect: bool,
    },

    /// Unrecoverable failure (offline file, missing download link, ...)
    #[error("{0}")]
    Fatal(String),

    /// Local I/O failure while streaming
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for HosterError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => HosterError::Status(status.as_u16()),
            None => HosterError::Connection(e.to_string()),
        }
    }
}

/// Result of a link check
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkInfo {
    /// File name announced by the hoster
    pub name: Option<String>,
    /// Size in bytes, if known
    pub size: Option<u64>,
    /// Whether `size` is only an estimate
    pub size_is_approximate: bool,
}

/// Byte range the engine wants from a link
#[derive(Clone)]
pub struct ChunkRequest {
    /// File being downloaded
    pub file: EntityId,
    /// Link to download from
    pub url: String,
    /// First byte to deliver
    pub begin: u64,
    /// One past the last byte, `None` for "until EOF"
    pub end: Option<u64>,
    /// Account the download runs under
    pub account: Account,
}

impl std::fmt::Debug for ChunkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRequest")
            .field("file", &self.file)
            .field("url", &self.url)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("account", &self.account.name)
            .finish()
    }
}

/// Opened stream plus whatever the server told us about the file
pub struct ChunkResponse {
    /// Body starting at the requested `begin`
    pub stream: ByteStream,
    /// Whether the server honors byte ranges (`None` = did not say)
    pub can_resume: Option<bool>,
    /// Total size of the file, if announced
    pub size: Option<u64>,
    /// File name, if announced
    pub name: Option<String>,
    /// State to pass to [`HosterPlugin::open_next`] for later chunks
    pub continuation: Option<Continuation>,
}

impl ChunkResponse {
    /// Response around a bare stream
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            can_resume: None,
            size: None,
            name: None,
            continuation: None,
        }
    }
}

impl std::fmt::Debug for ChunkResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkResponse")
            .field("can_resume", &self.can_resume)
            .field("size", &self.size)
            .field("name", &self.name)
            .field("continuation", &self.continuation.is_some())
            .finish()
    }
}

/// Provider-specific download logic
#[async_trait::async_trait]
pub trait HosterPlugin: Send + Sync {
    /// Plugin name, used in logs
    fn name(&self) -> &str;

    /// Host key for per-host connection pools
    fn host_of(&self, url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Resolve name and size without downloading
    async fn check(&self, url: &str) -> Result<LinkInfo, HosterError>;

    /// Open the first connection of a download
    async fn open_first(&self, request: &ChunkRequest) -> Result<ChunkResponse, HosterError>;

    /// Open a further chunk, reusing what the first connection established
    async fn open_next(
        &self,
        request: &ChunkRequest,
        continuation: Option<&Continuation>,
    ) -> Result<ChunkResponse, HosterError> {
        let _ = continuation;
        self.open_first(request).await
    }
}
