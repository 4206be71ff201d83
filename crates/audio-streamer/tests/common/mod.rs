#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use audio_streamer::output::ManualOutput;
use audio_streamer::transport::memory::{MemoryAsset, MemoryTransport};
use audio_streamer::{OutputFormat, StreamerConfig, StreamerContext};

pub const RATE: u32 = 8_000;
pub const DEADLINE: Duration = Duration::from_secs(15);

/// 16-bit PCM mono WAV at [`RATE`], `ms` long.
pub fn wav_ms(ms: u32) -> Vec<u8> {
    wav(RATE, 1, RATE / 1000 * ms)
}

pub fn wav(sample_rate: u32, channels: u16, frames: u32) -> Vec<u8> {
    let block_align = u32::from(channels) * 2;
    let data_len = frames * block_align;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * block_align).to_le_bytes());
    out.extend_from_slice(&(block_align as u16).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let v = ((i % 100) as i16 - 50) * 300;
        for _ in 0..channels {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// A streamer context over an in-memory transport and a pull-driven output.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub transport: Arc<MemoryTransport>,
    pub output: ManualOutput,
    pub ctx: StreamerContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tune: impl FnOnce(&mut StreamerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StreamerConfig::default();
        config.cache.dir = dir.path().join("cache");
        config.options.keep_persistent_volume = false;
        config.buffer_time_ms = 500;
        config.decode_chunk_frames = 256;
        config.retry_delay_ms = 2;
        config.wait_slice_ms = 10;
        config.read_ahead_bytes = 2_048;
        config.header_probe_bytes = 2_048;
        tune(&mut config);

        let transport = Arc::new(MemoryTransport::new());
        let output = ManualOutput::with_format(OutputFormat::new(RATE, 1));
        let ctx = StreamerContext::new(config, transport.clone(), Arc::new(output.clone())).unwrap();
        Self {
            dir,
            transport,
            output,
            ctx,
        }
    }

    /// Serve `asset` at a fresh URL and return it.
    pub fn serve(&self, name: &str, asset: MemoryAsset) -> String {
        let url = format!("http://test.invalid/{name}.wav");
        self.transport.insert(url.clone(), asset);
        url
    }

    /// Drain the output like a device clock (faster than real time) until `done` holds.
    pub fn pump_until(&self, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            self.output.pull(160);
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    /// Wait without draining the output.
    pub fn wait_until(&self, done: impl FnMut() -> bool) -> bool {
        wait_until(DEADLINE, done)
    }
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}
