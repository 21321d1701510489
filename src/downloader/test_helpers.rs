//! Shared test helpers: an in-memory hoster and engine constructors.

use crate::config::Config;
use crate::downloader::{
    AccountList, ChunkRequest, ChunkResponse, Downloader, HosterError, HosterPlugin, LinkInfo,
};
use crate::types::Event;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// Hoster serving bodies from memory
///
/// Every open is recorded as `(begin, end)`. Streams can be held back until a
/// number of connections is open, so tests control how chunks interleave.
pub(crate) struct ScriptedHoster {
    bodies: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    resumable: AtomicBool,
    failures: Mutex<VecDeque<HosterError>>,
    rejections: Mutex<Vec<u64>>,
    requests: Mutex<Vec<(u64, Option<u64>)>>,
    opened: watch::Sender<usize>,
    release_at: Mutex<usize>,
    block_size: usize,
}

impl ScriptedHoster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(HashMap::new()),
            resumable: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            rejections: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            opened: watch::channel(0).0,
            release_at: Mutex::new(0),
            block_size: 64 * 1024,
        })
    }

    /// Serve `body` at `url`
    pub(crate) fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().insert(url.to_string(), Arc::new(body));
    }

    /// Toggle byte-range support
    pub(crate) fn set_resumable(&self, resumable: bool) {
        self.resumable.store(resumable, Ordering::SeqCst);
    }

    /// Fail the next open with `error`
    pub(crate) fn fail_next(&self, error: HosterError) {
        self.failures.lock().push_back(error);
    }

    /// Reject the next range starting at `offset`
    pub(crate) fn reject_once_at(&self, offset: u64) {
        self.rejections.lock().push(offset);
    }

    /// Hold every stream until `connections` ranges have been opened
    pub(crate) fn release_after(&self, connections: usize) {
        *self.release_at.lock() = connections;
    }

    /// Ranges requested so far, in order
    pub(crate) fn requests(&self) -> Vec<(u64, Option<u64>)> {
        self.requests.lock().clone()
    }

    fn body(&self, url: &str) -> Result<Arc<Vec<u8>>, HosterError> {
        self.bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| HosterError::Fatal(format!("no such link {url}")))
    }

    fn open(&self, request: &ChunkRequest) -> Result<ChunkResponse, HosterError> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        {
            let mut rejections = self.rejections.lock();
            if let Some(idx) = rejections.iter().position(|o| *o == request.begin) {
                rejections.remove(idx);
                return Err(HosterError::RangeRejected);
            }
        }
        let body = self.body(&request.url)?;
        let len = body.len() as u64;
        let resumable = self.resumable.load(Ordering::SeqCst);
        if request.begin >= len && len > 0 {
            return Err(HosterError::RangeRejected);
        }
        if !resumable && request.begin > 0 {
            return Err(HosterError::RangeRejected);
        }
        self.requests.lock().push((request.begin, request.end));

        let start = if resumable { request.begin } else { 0 };
        let stop = if resumable {
            request.end.map_or(len, |end| end.min(len))
        } else {
            len
        };
        self.opened.send_modify(|n| *n += 1);
        let release_at = *self.release_at.lock();
        let gate = (release_at > 0).then(|| self.opened.subscribe());
        let block = self.block_size as u64;

        let stream = futures::stream::unfold((start, gate), move |(pos, gate)| {
            let body = Arc::clone(&body);
            async move {
                if let Some(mut gate) = gate {
                    gate.wait_for(|n| *n >= release_at).await.ok()?;
                }
                if pos >= stop {
                    return None;
                }
                let next = (pos + block).min(stop);
                let chunk = body[pos as usize..next as usize].to_vec();
                Some((Ok(chunk), (next, None)))
            }
        })
        .boxed();

        let mut response = ChunkResponse::new(stream);
        response.can_resume = Some(resumable);
        response.size = Some(len);
        Ok(response)
    }
}

#[async_trait::async_trait]
impl HosterPlugin for ScriptedHoster {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check(&self, url: &str) -> Result<LinkInfo, HosterError> {
        let body = self.body(url)?;
        Ok(LinkInfo {
            name: crate::utils::filename_from_url(url),
            size: Some(body.len() as u64),
            size_is_approximate: false,
        })
    }

    async fn open_first(&self, request: &ChunkRequest) -> Result<ChunkResponse, HosterError> {
        self.open(request)
    }
}

/// Config rooted in `dir` with short intervals and deterministic retries
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("test.db");
    config.persistence.flush_interval = Duration::from_millis(20);
    config.download.download_dir = dir.join("downloads");
    config.download.temp_dir = dir.join("temp");
    config.download.commit_interval = Duration::from_millis(20);
    config.download.admission_retry = Duration::from_millis(50);
    config.retry.max_attempts = 3;
    config.retry.initial_delay = Duration::from_millis(20);
    config.retry.max_delay = Duration::from_millis(100);
    config.retry.jitter = false;
    config
}

/// Engine on `config` backed by `hoster` with one anonymous account
pub(crate) async fn downloader_with(config: Config, hoster: Arc<ScriptedHoster>) -> Downloader {
    let accounts = Arc::new(AccountList::anonymous(
        config.download.max_connections_per_host,
    ));
    Downloader::with_plugins(config, hoster, accounts).await.unwrap()
}

/// Engine in a fresh temp dir; keep the `TempDir` alive for the test
pub(crate) async fn create_test_downloader() -> (Downloader, Arc<ScriptedHoster>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let hoster = ScriptedHoster::new();
    let downloader = downloader_with(test_config(dir.path()), Arc::clone(&hoster)).await;
    (downloader, hoster, dir)
}

/// Deterministic body of `len` bytes
pub(crate) fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll until `file` reaches `state`, panicking after five seconds
pub(crate) async fn wait_for_state(
    downloader: &Downloader,
    file: crate::types::EntityId,
    state: crate::model::FileState,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if downloader.store().get_as::<crate::model::FileState>(file, "state").ok() == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for file state")
}

/// Poll until no file task is running
pub(crate) async fn wait_until_idle(downloader: &Downloader) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !downloader.tasks.active.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for file tasks");
}

/// Create a package with one file in `collect`, bypassing the link check
pub(crate) fn add_file(
    downloader: &Downloader,
    url: &str,
    size: u64,
    max_chunks: Option<u32>,
) -> (crate::types::EntityId, crate::types::EntityId) {
    let mut ctx = downloader.store().context();
    ctx.transaction(|ctx| {
        let package = crate::model::package::create(ctx, "pkg", None)?;
        let file = ctx.create(
            crate::model::FILE,
            &[
                ("package", package.to_value()),
                ("url", serde_json::json!(url)),
                ("size", serde_json::json!(size)),
                ("max_chunks", serde_json::json!(max_chunks)),
                ("state", crate::model::FileState::Collect.into()),
            ],
        )?;
        Ok((package, file))
    })
    .unwrap()
}

/// Wait for the first event matching `pred`, panicking after five seconds
pub(crate) async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
