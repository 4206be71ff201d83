//! Progressive download into the cache.
//!
//! A [`FileProvider`] owns the growing byte range of one cached asset: a background thread
//! appends response bytes to the cache file while readers block (with a timeout) until the
//! offsets they need exist. Progress lives under a `Mutex` + `Condvar` pair so waits wake as
//! soon as new bytes land.

mod reader;
mod speed;

pub use reader::ProviderReader;
pub use speed::SpeedMeter;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender};
use sha2::{Digest, Sha256};

use crate::cache::CacheStore;
use crate::source::VerificationToken;
use crate::transport::{FetchRequest, HttpTransport};

/// Progress notifications fanned out to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderEvent {
    Data { received: u64, expected: Option<u64> },
    Finished,
    Failed(String),
}

#[derive(Debug)]
struct Progress {
    expected: Option<u64>,
    received: u64,
    finished: bool,
    failure: Option<String>,
    headers: bool,
    speed: SpeedMeter,
    token: VerificationToken,
}

/// The growing byte range of one asset.
pub struct FileProvider {
    identity: String,
    path: PathBuf,
    progress: Mutex<Progress>,
    cv: Condvar,
    cancel: AtomicBool,
    subscribers: Mutex<Vec<Sender<ProviderEvent>>>,
}

/// Parameters of a background download.
pub(crate) struct DownloadJob {
    pub(crate) url: String,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) store: Weak<CacheStore>,
    /// Bytes already present in the cache file from an earlier, interrupted download.
    pub(crate) resume_from: u64,
    /// Token recorded for the partial file, used to reject a resume onto changed content.
    pub(crate) resume_token: Option<VerificationToken>,
    /// Required digest of the finished file.
    pub(crate) sha256: Option<String>,
    pub(crate) read_chunk_bytes: usize,
}

impl FileProvider {
    fn with_progress(identity: String, path: PathBuf, progress: Progress) -> Self {
        Self {
            identity,
            path,
            progress: Mutex::new(progress),
            cv: Condvar::new(),
            cancel: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn empty_progress(window: Duration) -> Progress {
        Progress {
            expected: None,
            received: 0,
            finished: false,
            failure: None,
            headers: false,
            speed: SpeedMeter::new(window),
            token: VerificationToken::default(),
        }
    }

    /// A provider over a file that is already complete on disk.
    pub(crate) fn completed(
        identity: String,
        path: PathBuf,
        token: Option<VerificationToken>,
    ) -> io::Result<Arc<Self>> {
        let len = std::fs::metadata(&path)?.len();
        let mut progress = Self::empty_progress(Duration::from_secs(1));
        progress.expected = Some(len);
        progress.received = len;
        progress.finished = true;
        progress.headers = true;
        progress.token = token.unwrap_or_default();
        Ok(Arc::new(Self::with_progress(identity, path, progress)))
    }

    /// A provider that failed before any byte was fetched.
    pub(crate) fn failed(identity: String, path: PathBuf, reason: String) -> Arc<Self> {
        let mut progress = Self::empty_progress(Duration::from_secs(1));
        progress.failure = Some(reason);
        Arc::new(Self::with_progress(identity, path, progress))
    }

    /// A provider whose bytes are fed by the caller through the `on_*` hooks.
    #[cfg(test)]
    pub(crate) fn growing(identity: String, path: PathBuf, expected: u64) -> Arc<Self> {
        let provider = Arc::new(Self::with_progress(
            identity,
            path,
            Self::empty_progress(Duration::from_secs(1)),
        ));
        provider.on_headers(0, Some(expected), None);
        provider
    }

    /// Start downloading into `path` on a background thread.
    pub(crate) fn download(
        identity: String,
        path: PathBuf,
        speed_window: Duration,
        job: DownloadJob,
    ) -> Arc<Self> {
        let provider = Arc::new(Self::with_progress(
            identity,
            path,
            Self::empty_progress(speed_window),
        ));
        let weak = Arc::downgrade(&provider);
        thread::spawn(move || run_download(weak, job));
        provider
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Local path of the cache file being filled.
    pub fn cached_path(&self) -> &Path {
        &self.path
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.lock().expected
    }

    pub fn received_length(&self) -> u64 {
        self.lock().received
    }

    /// Contiguous bytes available from the start of the file, capped at `up_to`.
    pub fn bytes_available(&self, up_to: u64) -> u64 {
        self.lock().received.min(up_to)
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failure.is_some()
    }

    /// Response headers arrived (or the file was complete from the start).
    pub fn is_ready(&self) -> bool {
        let g = self.lock();
        g.headers || g.finished
    }

    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    /// Rolling download speed in bytes per second.
    pub fn download_speed(&self) -> u64 {
        self.lock().speed.rate()
    }

    pub fn token(&self) -> VerificationToken {
        self.lock().token.clone()
    }

    /// Block until `offset` bytes exist, the provider can no longer deliver them, or `timeout`
    /// elapses. Returns whether the bytes are available.
    pub fn wait_for_bytes(&self, offset: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.received >= offset {
                return true;
            }
            if g.finished || g.failure.is_some() || self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = match self.cv.wait_timeout(g, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Receive progress events from now on.
    pub fn subscribe(&self) -> Receiver<ProviderEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Stop the download; waiting readers return immediately.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _g = self.lock();
        self.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: ProviderEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn on_headers(&self, received: u64, expected: Option<u64>, etag: Option<String>) {
        let mut g = self.lock();
        g.received = received;
        g.expected = expected;
        g.headers = true;
        g.token.etag = etag;
        g.token.content_length = expected;
        g.speed.start(Instant::now());
        drop(g);
        self.cv.notify_all();
        self.publish(ProviderEvent::Data { received, expected });
    }

    pub(crate) fn on_data(&self, bytes: u64) {
        let mut g = self.lock();
        g.received += bytes;
        g.speed.record(Instant::now(), bytes);
        let (received, expected) = (g.received, g.expected);
        drop(g);
        self.cv.notify_all();
        self.publish(ProviderEvent::Data { received, expected });
    }

    pub(crate) fn on_finished(&self, sha256: Option<String>) {
        let mut g = self.lock();
        g.finished = true;
        g.expected = Some(g.received);
        g.token.content_length = Some(g.received);
        if sha256.is_some() {
            g.token.sha256 = sha256;
        }
        drop(g);
        self.cv.notify_all();
        self.publish(ProviderEvent::Finished);
    }

    pub(crate) fn on_failed(&self, reason: String) {
        let mut g = self.lock();
        g.failure = Some(reason.clone());
        drop(g);
        self.cv.notify_all();
        self.publish(ProviderEvent::Failed(reason));
    }
}

fn run_download(provider: Weak<FileProvider>, job: DownloadJob) {
    let result = download_body(&provider, &job);
    let Some(p) = provider.upgrade() else {
        return;
    };
    match result {
        Ok(true) => {
            let token = p.token();
            tracing::info!(
                url = %job.url,
                bytes = p.received_length(),
                "download finished"
            );
            if let Some(store) = job.store.upgrade() {
                store.record_finished(p.identity(), p.received_length(), token);
            }
        }
        Ok(false) => {
            tracing::debug!(url = %job.url, "download cancelled");
        }
        Err(e) => {
            if p.is_cancelled() {
                return;
            }
            tracing::warn!(url = %job.url, "download failed: {e:#}");
            p.on_failed(format!("{e:#}"));
            if let Some(store) = job.store.upgrade() {
                store.record_failed(p.identity(), p.received_length());
            }
        }
    }
}

/// Stream the response body into the cache file. Returns `Ok(false)` when cancelled.
fn download_body(provider: &Weak<FileProvider>, job: &DownloadJob) -> Result<bool> {
    let Some(path) = provider.upgrade().map(|p| p.cached_path().to_path_buf()) else {
        return Ok(false);
    };
    let mut resp = job.transport.fetch(&FetchRequest {
        url: job.url.clone(),
        range_start: job.resume_from,
    })?;
    let head = resp.head.clone();

    let etag_changed = match (
        job.resume_token.as_ref().and_then(|t| t.etag.as_ref()),
        head.etag.as_ref(),
    ) {
        (Some(old), Some(new)) => old != new,
        _ => false,
    };
    let resumed = job.resume_from > 0
        && head.is_partial()
        && head.range_start.unwrap_or(job.resume_from) == job.resume_from
        && !etag_changed;
    if job.resume_from > 0 && !resumed {
        tracing::info!(
            url = %job.url,
            status = head.status,
            etag_changed,
            "range resume rejected; restarting download"
        );
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("open cache file {:?}", path))?;
    let mut received = if resumed {
        file.set_len(job.resume_from)?;
        file.seek(SeekFrom::Start(job.resume_from))?;
        job.resume_from
    } else {
        file.set_len(0)?;
        0
    };
    let expected = head.resource_length();
    if let Some(exp) = expected {
        if received > exp {
            bail!("cached prefix of {received} bytes exceeds resource length {exp}");
        }
    }

    {
        let Some(p) = provider.upgrade() else {
            return Ok(false);
        };
        p.on_headers(received, expected, head.etag.clone());
        if let Some(store) = job.store.upgrade() {
            store.record_headers(p.identity(), received, p.token());
        }
    }

    let mut buf = vec![0u8; job.read_chunk_bytes.max(1024)];
    loop {
        match provider.upgrade() {
            Some(p) if !p.is_cancelled() => {}
            _ => return Ok(false),
        }
        let mut n = match resp.body.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("connection lost after {received} bytes")));
            }
        };
        if n == 0 {
            break;
        }
        if let Some(exp) = expected {
            n = n.min((exp - received) as usize);
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("write cache file {:?}", path))?;
        received += n as u64;
        if let Some(p) = provider.upgrade() {
            p.on_data(n as u64);
        }
        if expected == Some(received) {
            break;
        }
    }
    file.flush()?;

    if let Some(exp) = expected {
        if received < exp {
            bail!("connection closed after {received} of {exp} bytes");
        }
    }

    let digest = match &job.sha256 {
        Some(want) => {
            let got = file_sha256(&path)?;
            if !got.eq_ignore_ascii_case(want) {
                bail!("sha256 mismatch: expected {want}, got {got}");
            }
            Some(got)
        }
        None => None,
    };

    match provider.upgrade() {
        Some(p) => {
            p.on_finished(digest);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Lowercase hex SHA-256 of a file.
pub(crate) fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
