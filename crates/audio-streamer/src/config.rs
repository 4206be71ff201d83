//! Streamer tuning parameters.
//!
//! Every field has a default, so a partial TOML/JSON document (or none at all) yields a working
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::output::OutputFormat;

/// Lower bound on [`StreamerConfig::read_ahead_bytes`]: one full `MediaSourceStream` block
/// (32 KiB) plus room for the largest packet a reader parses out of it. Below this a single
/// packet read can outrun the downloaded bytes and block the worker.
pub const MIN_READ_AHEAD_BYTES: u64 = 48 * 1024;

/// Pipeline tuning shared by the provider, decoder, renderer and event loop.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Ring buffer length in milliseconds of output audio.
    pub buffer_time_ms: u64,
    /// Frames per decoded chunk handed to the renderer.
    pub decode_chunk_frames: usize,
    /// Fraction of the ring that must be filled before Buffering turns into Playing.
    pub ready_threshold: f32,
    /// Fill fraction under which a `Waiting` decoder drops Playing back to Buffering.
    pub low_water_threshold: f32,
    /// Delay before retrying a decoder that reported `Waiting` or a full ring.
    pub retry_delay_ms: u64,
    /// Escalate continuous `Waiting` to a network error after this long. Disabled when unset.
    pub stall_timeout_ms: Option<u64>,
    /// Granularity of cancellable waits on the file provider.
    pub wait_slice_ms: u64,
    /// Bytes that must be materialized past the reader position before a decode step runs.
    /// Values under [`MIN_READ_AHEAD_BYTES`] are raised to it.
    pub read_ahead_bytes: u64,
    /// Prefix size waited for before the container header is probed.
    pub header_probe_bytes: u64,
    /// Window of the rolling download speed estimate.
    pub speed_window_ms: u64,
    /// Format requested from the output backend.
    pub preferred_output: OutputFormat,
    /// Persisted volume location (used with `keep_persistent_volume`).
    pub volume_file: Option<PathBuf>,
    pub options: StreamerOptions,
    pub cache: CacheConfig,
    pub transport: TransportConfig,
}

/// Behaviour switches carried over from the streamer's option set.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamerOptions {
    /// Persist the volume across runs.
    pub keep_persistent_volume: bool,
    /// Remove the cached file when the streamer is dropped (ignored in managed cache mode).
    pub remove_cache_on_drop: bool,
    /// Reject finished downloads whose SHA-256 does not match the source's digest.
    pub require_sha256: bool,
}

/// On-disk cache layout.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Managed mode: evict the oldest finished files beyond this count.
    pub max_files: Option<usize>,
    /// Ranked read-only directories consulted before the cache directory.
    pub search_paths: Vec<PathBuf>,
}

/// HTTP transport settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connect/response timeout for a single request.
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Bytes per body read.
    pub read_chunk_bytes: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            buffer_time_ms: 2000,
            decode_chunk_frames: 2048,
            ready_threshold: 0.5,
            low_water_threshold: 0.1,
            retry_delay_ms: 20,
            stall_timeout_ms: None,
            wait_slice_ms: 100,
            read_ahead_bytes: 64 * 1024,
            header_probe_bytes: 64 * 1024,
            speed_window_ms: 2000,
            preferred_output: OutputFormat::default(),
            volume_file: None,
            options: StreamerOptions::default(),
            cache: CacheConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            keep_persistent_volume: true,
            remove_cache_on_drop: true,
            require_sha256: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("audio-streamer"),
            max_files: None,
            search_paths: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: concat!("audio-streamer/", env!("CARGO_PKG_VERSION")).to_string(),
            read_chunk_bytes: 64 * 1024,
        }
    }
}

impl StreamerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.max(1))
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms.max(1))
    }

    /// Effective read-ahead, never below [`MIN_READ_AHEAD_BYTES`].
    pub fn read_ahead(&self) -> u64 {
        self.read_ahead_bytes.max(MIN_READ_AHEAD_BYTES)
    }

    /// Ready threshold clamped into `(0, 1]`.
    pub fn ready_fraction(&self) -> f32 {
        if self.ready_threshold.is_finite() && self.ready_threshold > 0.0 {
            self.ready_threshold.min(1.0)
        } else {
            0.5
        }
    }

    /// Where the volume is persisted, defaulting to a file inside the cache directory.
    pub fn volume_path(&self) -> PathBuf {
        self.volume_file
            .clone()
            .unwrap_or_else(|| self.cache.dir.join("volume.json"))
    }
}
