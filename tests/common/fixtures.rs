//! HTTP fixtures: a byte-range aware wiremock responder

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic body of `len` bytes
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

/// Serves a fixed body and honors `Range: bytes=a-b`
///
/// `HEAD` is answered with 405 so link checks exercise the `GET` fallback.
/// With `ranges` off every request gets the whole body with status 200.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    ranges: bool,
    ranged_requests: Arc<AtomicUsize>,
}

impl RangeResponder {
    /// Responder serving `body` with range support
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            ranges: true,
            ranged_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Responder that ignores `Range` headers
    pub fn without_ranges(body: Vec<u8>) -> Self {
        Self {
            ranges: false,
            ..Self::new(body)
        }
    }

    /// Number of requests that carried a `Range` header
    pub fn ranged_requests(&self) -> usize {
        self.ranged_requests.load(Ordering::SeqCst)
    }
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = match end {
        "" => len.checked_sub(1)?,
        e => e.parse::<u64>().ok()?.min(len.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if request.method.as_str() == "HEAD" {
            return ResponseTemplate::new(405);
        }
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match range {
            Some(range) if self.ranges => {
                self.ranged_requests.fetch_add(1, Ordering::SeqCst);
                match parse_range(&range, len) {
                    Some((start, end)) => ResponseTemplate::new(206)
                        .insert_header("Content-Range", format!("bytes {start}-{end}/{len}"))
                        .insert_header("Accept-Ranges", "bytes")
                        .set_body_bytes(self.body[start as usize..=end as usize].to_vec()),
                    None => ResponseTemplate::new(416)
                        .insert_header("Content-Range", format!("bytes */{len}")),
                }
            }
            _ => {
                let mut response = ResponseTemplate::new(200).set_body_bytes(self.body.to_vec());
                if self.ranges {
                    response = response.insert_header("Accept-Ranges", "bytes");
                }
                response
            }
        }
    }
}
