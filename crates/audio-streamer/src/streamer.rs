//! Public handle for one stream.
//!
//! An [`AudioStreamer`] opens (or joins) the download for its source, spawns the worker that
//! runs the event loop, and exposes the control surface. Controls are asynchronous: they queue
//! a command and return immediately; observe the outcome through [`AudioStreamer::status`] or
//! [`AudioStreamer::subscribe`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::cache::{CacheStore, ProviderLease};
use crate::config::StreamerConfig;
use crate::error::{Result, StreamerError};
use crate::event_loop::{self, Command, WorkerSetup};
use crate::output::{CpalOutput, OutputBackend};
use crate::provider::FileProvider;
use crate::settings::StreamerSettings;
use crate::source::AudioSource;
use crate::status::{SharedStatus, StatusSnapshot, StreamerEvent, StreamerStatus};
use crate::transport::{HttpTransport, UreqTransport};

/// Collaborators shared by every streamer of an application.
#[derive(Clone)]
pub struct StreamerContext {
    pub config: StreamerConfig,
    pub cache: Arc<CacheStore>,
    pub transport: Arc<dyn HttpTransport>,
    pub output: Arc<dyn OutputBackend>,
    pub settings: Arc<StreamerSettings>,
}

impl StreamerContext {
    /// Open the cache described by `config` and load persisted settings.
    pub fn new(
        config: StreamerConfig,
        transport: Arc<dyn HttpTransport>,
        output: Arc<dyn OutputBackend>,
    ) -> Result<Self> {
        let cache = CacheStore::open(&config.cache)?;
        let settings = Arc::new(StreamerSettings::load(&config));
        Ok(Self {
            config,
            cache,
            transport,
            output,
            settings,
        })
    }

    /// `ureq` transport and the default CPAL output device.
    pub fn with_defaults(config: StreamerConfig) -> Result<Self> {
        let transport = Arc::new(UreqTransport::new(&config.transport));
        Self::new(config, transport, Arc::new(CpalOutput::new(None)))
    }
}

pub struct AudioStreamer {
    source: AudioSource,
    lease: Option<ProviderLease>,
    cache: Arc<CacheStore>,
    settings: Arc<StreamerSettings>,
    status: Arc<SharedStatus>,
    cancel: Arc<AtomicBool>,
    cmd_tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    remove_cache_on_drop: bool,
}

impl AudioStreamer {
    /// Start (or join) the download and spawn the worker. Playback waits for [`Self::play`].
    pub fn new(source: AudioSource, ctx: &StreamerContext) -> Result<Self> {
        let lease = ctx
            .cache
            .open_provider(&source, ctx.transport.clone(), &ctx.config)?;
        let status = Arc::new(SharedStatus::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let (cmd_tx, worker) = event_loop::spawn(WorkerSetup {
            config: ctx.config.clone(),
            provider: lease.provider(),
            extension: source.extension(),
            backend: ctx.output.clone(),
            volume: ctx.settings.volume_handle(),
            analyzers: ctx.settings.analyzers().clone(),
            status: status.clone(),
            cancel: cancel.clone(),
        });
        tracing::info!(url = %source.url(), identity = lease.identity(), "streamer created");
        Ok(Self {
            source,
            lease: Some(lease),
            cache: ctx.cache.clone(),
            settings: ctx.settings.clone(),
            status,
            cancel,
            cmd_tx,
            worker: Some(worker),
            remove_cache_on_drop: ctx.config.options.remove_cache_on_drop,
        })
    }

    pub fn play(&self) {
        self.send(Command::Play);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Back to Idle at position 0. Unblocks a worker waiting on the network.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.send(Command::Stop);
    }

    /// Jump to `ms`. While Idle this sets where the next [`Self::play`] starts.
    pub fn seek(&self, ms: u64) {
        self.send(Command::Seek(ms));
    }

    /// Pause on behalf of the system (e.g. the device was claimed by someone else).
    pub fn begin_interruption(&self) {
        self.send(Command::BeginInterruption);
    }

    /// Resume playback paused by [`Self::begin_interruption`] without an explicit play.
    pub fn end_interruption(&self) {
        self.send(Command::EndInterruption);
    }

    pub fn status(&self) -> StreamerStatus {
        self.status.status()
    }

    pub fn error(&self) -> Option<StreamerError> {
        self.status.error()
    }

    /// Position heard by the listener: seek base plus audio drained by the output.
    pub fn current_time_ms(&self) -> u64 {
        self.status.current_time_ms()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.status.duration_ms()
    }

    pub fn volume(&self) -> f32 {
        self.settings.volume()
    }

    pub fn set_volume(&self, volume: f32) {
        self.settings.set_volume(volume);
    }

    pub fn url(&self) -> String {
        self.source.url()
    }

    pub fn source(&self) -> &AudioSource {
        &self.source
    }

    pub fn cached_path(&self) -> Option<PathBuf> {
        self.provider().map(|p| p.cached_path().to_path_buf())
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.provider().and_then(|p| p.expected_length())
    }

    pub fn received_length(&self) -> u64 {
        self.provider().map_or(0, |p| p.received_length())
    }

    /// Bytes per second over the configured speed window.
    pub fn download_speed(&self) -> u64 {
        self.provider().map_or(0, |p| p.download_speed())
    }

    pub fn buffering_ratio(&self) -> f32 {
        self.status.buffering_ratio()
    }

    pub fn is_paused_by_interruption(&self) -> bool {
        self.status.paused_by_interruption()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let provider = self.provider();
        let format = self.status.output_format();
        let counters = self.status.counters();
        StatusSnapshot {
            url: self.source.url(),
            status: self.status.status(),
            error: self.status.error(),
            current_time_ms: self.status.current_time_ms(),
            duration_ms: self.status.duration_ms(),
            buffering_ratio: self.status.buffering_ratio(),
            paused_by_interruption: self.status.paused_by_interruption(),
            volume: self.settings.volume(),
            expected_length: provider.as_ref().and_then(|p| p.expected_length()),
            received_length: provider.as_ref().map_or(0, |p| p.received_length()),
            download_speed: provider.as_ref().map_or(0, |p| p.download_speed()),
            sample_rate: format.map(|(rate, _)| rate),
            channels: format.map(|(_, channels)| channels),
            underrun_frames: counters.underrun_frames.load(Ordering::Relaxed),
            underrun_events: counters.underrun_events.load(Ordering::Relaxed),
        }
    }

    /// Receive state, duration, progress and error events from now on.
    pub fn subscribe(&self) -> Receiver<StreamerEvent> {
        self.status.subscribe()
    }

    fn provider(&self) -> Option<Arc<FileProvider>> {
        self.lease.as_ref().and_then(|l| l.upgrade())
    }

    fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::warn!(?cmd, "streamer worker is gone");
        }
    }
}

impl Drop for AudioStreamer {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let identity = self.lease.as_ref().map(|l| l.identity().to_string());
        self.lease = None;
        if let Some(identity) = identity {
            if self.remove_cache_on_drop && self.cache.max_files().is_none() {
                self.cache.remove(&identity);
            }
        }
    }
}
