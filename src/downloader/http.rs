//! Plain HTTP(S) hoster
//!
//! Ranges go out as `Range: bytes=a-b`. A `206` is checked against its
//! `Content-Range`; a `200` for a non-zero offset means the server ignored
//! the range, which the engine repairs like an explicit `416`.

use crate::Result;
use crate::utils::{extract_filename_from_response, filename_from_content_disposition};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_RANGE, RANGE};
use std::time::Duration;

use super::hoster::{ChunkRequest, ChunkResponse, HosterError, HosterPlugin, LinkInfo};

/// Hoster for direct links
#[derive(Clone, Debug)]
pub struct HttpHoster {
    client: reqwest::Client,
}

impl HttpHoster {
    /// Hoster with a default client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rangedl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// Hoster around an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn open(&self, request: &ChunkRequest) -> std::result::Result<ChunkResponse, HosterError> {
        let ranged = request.begin > 0 || request.end.is_some();
        let mut builder = self.client.get(&request.url);
        if ranged {
            builder = builder.header(RANGE, range_header(request.begin, request.end));
        }
        let response = builder.send().await?;
        let status = response.status();

        let (can_resume, size) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let Some((start, total)) = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                else {
                    return Err(HosterError::RangeRejected);
                };
                if start != request.begin {
                    return Err(HosterError::RangeRejected);
                }
                (Some(true), total)
            }
            StatusCode::OK if request.begin > 0 => return Err(HosterError::RangeRejected),
            StatusCode::OK => {
                let can_resume = if ranged {
                    Some(false)
                } else {
                    accepts_ranges(&response)
                };
                (can_resume, response.content_length())
            }
            StatusCode::RANGE_NOT_SATISFIABLE => return Err(HosterError::RangeRejected),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(HosterError::Fatal(format!("file is offline ({status})")));
            }
            other => return Err(HosterError::Status(other.as_u16())),
        };

        let name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_content_disposition);

        tracing::debug!(
            url = %request.url,
            begin = request.begin,
            end = ?request.end,
            status = status.as_u16(),
            ?size,
            "range opened"
        );

        let stream = response
            .bytes_stream()
            .map(|block| block.map(|b| b.to_vec()).map_err(HosterError::from))
            .boxed();
        Ok(ChunkResponse {
            stream,
            can_resume,
            size,
            name,
            continuation: None,
        })
    }
}

#[async_trait::async_trait]
impl HosterPlugin for HttpHoster {
    fn name(&self) -> &str {
        "http"
    }

    async fn check(&self, url: &str) -> std::result::Result<LinkInfo, HosterError> {
        let mut response = self.client.head(url).send().await?;
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            // headers only; the body is dropped unread
            response = self.client.get(url).send().await?;
        }
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(HosterError::Fatal(format!("file is offline ({status})")));
        }
        if !status.is_success() {
            return Err(HosterError::Status(status.as_u16()));
        }
        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Ok(LinkInfo {
            name: Some(extract_filename_from_response(&response, url)),
            size,
            size_is_approximate: false,
        })
    }

    async fn open_first(&self, request: &ChunkRequest) -> std::result::Result<ChunkResponse, HosterError> {
        self.open(request).await
    }
}

fn range_header(begin: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", begin, end.saturating_sub(1)),
        None => format!("bytes={begin}-"),
    }
}

fn accepts_ranges(response: &reqwest::Response) -> Option<bool> {
    response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
}

/// `bytes a-b/total` → (a, total); `*` totals come back as `None`
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}
