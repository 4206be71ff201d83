//! HTTP transport seam used by the file provider.
//!
//! The provider only needs "GET this URL from byte N and stream the body", so the transport is
//! a small trait with a `ureq` adapter for real use and [`memory::MemoryTransport`] for
//! headless runs and tests.

pub mod memory;

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::TransportConfig;

/// A ranged GET.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// First byte wanted; `0` means the whole resource.
    pub range_start: u64,
}

/// The parts of a response the provider cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    /// Start offset from `Content-Range` on a 206 response.
    pub range_start: Option<u64>,
    /// Total resource length from `Content-Range` on a 206 response.
    pub total_length: Option<u64>,
    pub etag: Option<String>,
}

impl ResponseHead {
    /// Whether the body continues from the requested offset rather than from zero.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Full length of the resource when the response lets us know it.
    pub fn resource_length(&self) -> Option<u64> {
        if self.is_partial() {
            self.total_length.or_else(|| {
                self.content_length
                    .map(|len| len.saturating_add(self.range_start.unwrap_or(0)))
            })
        } else {
            self.content_length
        }
    }
}

/// An open response with a streaming body. Dropping the body aborts the transfer.
pub struct FetchResponse {
    pub head: ResponseHead,
    pub body: Box<dyn Read + Send>,
}

/// Blocking HTTP client used by download threads.
pub trait HttpTransport: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// [`HttpTransport`] backed by `ureq`.
#[derive(Clone, Debug)]
pub struct UreqTransport {
    timeout: Duration,
    user_agent: String,
}

impl UreqTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            user_agent: config.user_agent.clone(),
        }
    }
}

impl HttpTransport for UreqTransport {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let started = std::time::Instant::now();
        let mut req = ureq::get(&request.url)
            .config()
            .timeout_connect(Some(self.timeout))
            .timeout_recv_response(Some(self.timeout))
            .build()
            .header("User-Agent", &self.user_agent);
        if request.range_start > 0 {
            req = req.header("Range", &format!("bytes={}-", request.range_start));
        }
        let resp = req
            .call()
            .with_context(|| format!("GET {}", request.url))?;

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let content_range = header("Content-Range");
        let head = ResponseHead {
            status: resp.status().as_u16(),
            content_length: header("Content-Length").and_then(|s| s.parse::<u64>().ok()),
            range_start: content_range.as_deref().and_then(parse_content_range_start),
            total_length: content_range.as_deref().and_then(parse_content_range_total),
            etag: header("ETag"),
        };
        tracing::debug!(
            url = %request.url,
            status = head.status,
            range_start = request.range_start,
            took_ms = started.elapsed().as_millis() as u64,
            "http response head"
        );

        let (_, body) = resp.into_parts();
        Ok(FetchResponse {
            head,
            body: Box::new(body.into_reader()),
        })
    }
}

/// Extract the total length from a Content-Range header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    // Format: "bytes start-end/total"
    let (_, total) = header.split_once('/')?;
    total.trim().parse::<u64>().ok()
}

/// Extract the first byte offset from a Content-Range header.
fn parse_content_range_start(header: &str) -> Option<u64> {
    let rest = header.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = rest.split_once('-')?;
    start.trim().parse::<u64>().ok()
}
