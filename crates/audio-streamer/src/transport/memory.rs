//! In-process transport serving byte buffers.
//!
//! Assets are delivered in fixed-size chunks, optionally paced by a delay or by an explicit
//! [`ChunkGate`], and can be told to fail after a given byte count. Used for headless runs and
//! for deterministic pipeline tests.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender};

use super::{FetchRequest, FetchResponse, HttpTransport, ResponseHead};

/// One servable asset.
#[derive(Clone)]
pub struct MemoryAsset {
    data: Arc<Vec<u8>>,
    chunk_bytes: usize,
    chunk_delay: Duration,
    fail_after: Option<u64>,
    etag: Option<String>,
    honor_ranges: bool,
    announce_length: bool,
    gate: Option<Receiver<()>>,
}

/// Releases gated chunks one at a time. Dropping it releases everything that is left.
pub struct ChunkGate {
    tx: Sender<()>,
}

impl ChunkGate {
    pub fn release(&self, chunks: usize) {
        for _ in 0..chunks {
            let _ = self.tx.send(());
        }
    }
}

impl MemoryAsset {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            chunk_bytes: 64 * 1024,
            chunk_delay: Duration::ZERO,
            fail_after: None,
            etag: None,
            honor_ranges: true,
            announce_length: true,
            gate: None,
        }
    }

    pub fn chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes.max(1);
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Break the connection once this many bytes of the resource have been sent.
    pub fn fail_after(mut self, bytes: u64) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Answer ranged requests with the full body and a 200 status.
    pub fn ignore_ranges(mut self) -> Self {
        self.honor_ranges = false;
        self
    }

    /// Omit `Content-Length`.
    pub fn hide_length(mut self) -> Self {
        self.announce_length = false;
        self
    }

    /// Deliver each chunk only after [`ChunkGate::release`].
    pub fn gated(mut self) -> (Self, ChunkGate) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.gate = Some(rx);
        (self, ChunkGate { tx })
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// [`HttpTransport`] over a map of in-memory assets.
#[derive(Default)]
pub struct MemoryTransport {
    assets: Mutex<HashMap<String, MemoryAsset>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, asset: MemoryAsset) {
        if let Ok(mut assets) = self.assets.lock() {
            assets.insert(url.into(), asset);
        }
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl HttpTransport for MemoryTransport {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let asset = self
            .assets
            .lock()
            .map_err(|_| anyhow!("memory transport poisoned"))?
            .get(&request.url)
            .cloned()
            .ok_or_else(|| anyhow!("GET {}: 404 Not Found", request.url))?;

        let total = asset.len();
        let start = if asset.honor_ranges {
            request.range_start.min(total)
        } else {
            0
        };
        let partial = asset.honor_ranges && request.range_start > 0;
        let head = ResponseHead {
            status: if partial { 206 } else { 200 },
            content_length: asset.announce_length.then_some(total - start),
            range_start: partial.then_some(start),
            total_length: (partial && asset.announce_length).then_some(total),
            etag: asset.etag.clone(),
        };
        let end = asset.fail_after.map_or(total, |f| f.min(total));
        let body = MemoryBody {
            pos: start,
            end,
            fails: asset.fail_after.is_some_and(|f| f < total),
            chunk_left: 0,
            asset,
        };
        Ok(FetchResponse {
            head,
            body: Box::new(body),
        })
    }
}

struct MemoryBody {
    asset: MemoryAsset,
    pos: u64,
    end: u64,
    fails: bool,
    chunk_left: usize,
}

impl Read for MemoryBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.end {
            if self.fails {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
            return Ok(0);
        }
        if self.chunk_left == 0 {
            if let Some(gate) = &self.asset.gate {
                if gate.recv().is_err() {
                    self.asset.gate = None;
                }
            }
            if !self.asset.chunk_delay.is_zero() {
                std::thread::sleep(self.asset.chunk_delay);
            }
            self.chunk_left = self.asset.chunk_bytes;
        }
        let remaining = (self.end - self.pos) as usize;
        let n = buf.len().min(remaining).min(self.chunk_left);
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.asset.data[start..start + n]);
        self.pos += n as u64;
        self.chunk_left -= n;
        Ok(n)
    }
}
