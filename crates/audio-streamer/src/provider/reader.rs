use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use symphonia::core::io::MediaSource;

use super::FileProvider;

/// A seekable view of a cache file that is still being appended by the download thread.
///
/// Reads wait for missing bytes in short slices so a cancelled session unblocks promptly.
/// Reaching the end of a failed download is an I/O error, while the end of a finished one is
/// a normal EOF. Seeks only move the cursor; the next read does the waiting.
pub struct ProviderReader {
    file: File,
    provider: Weak<FileProvider>,
    pos: u64,
    /// Highest offset handed to the decoder, shared with the decoder's availability check.
    position: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
    wait_slice: Duration,
}

impl ProviderReader {
    pub fn open(
        provider: &Arc<FileProvider>,
        cancel: Arc<AtomicBool>,
        wait_slice: Duration,
    ) -> io::Result<Self> {
        let file = File::open(provider.cached_path())?;
        Ok(Self {
            file,
            provider: Arc::downgrade(provider),
            pos: 0,
            position: Arc::new(AtomicU64::new(0)),
            cancel,
            wait_slice,
        })
    }

    /// Shared handle to the current read offset.
    pub fn position_handle(&self) -> Arc<AtomicU64> {
        self.position.clone()
    }

    fn provider(&self) -> io::Result<Arc<FileProvider>> {
        self.provider
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "file provider released"))
    }

    fn set_pos(&mut self, pos: u64) {
        self.pos = pos;
        self.position.store(pos, Ordering::Relaxed);
    }
}

impl Read for ProviderReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(io::Error::other("playback cancelled"));
            }
            let provider = self.provider()?;
            let available = provider.received_length();
            if available > self.pos {
                let to_read = buf.len().min((available - self.pos) as usize);
                self.file.seek(SeekFrom::Start(self.pos))?;
                let n = self.file.read(&mut buf[..to_read])?;
                self.set_pos(self.pos + n as u64);
                return Ok(n);
            }
            if provider.is_finished() {
                return Ok(0);
            }
            if let Some(reason) = provider.failure() {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason));
            }
            if provider.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "download cancelled"));
            }
            provider.wait_for_bytes(self.pos + 1, self.wait_slice);
        }
    }
}

impl Seek for ProviderReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(x) => x,
            SeekFrom::Current(d) => self.pos.saturating_add_signed(d),
            SeekFrom::End(d) => {
                let len = self.provider()?.expected_length().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "resource length unknown")
                })?;
                len.saturating_add_signed(d)
            }
        };
        self.set_pos(target);
        Ok(self.pos)
    }
}

impl MediaSource for ProviderReader {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.provider.upgrade().and_then(|p| p.expected_length())
    }
}
