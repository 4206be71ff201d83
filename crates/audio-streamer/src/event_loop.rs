//! Worker thread driving one streamer.
//!
//! The worker owns the decoder and the renderer (the output stream is created on this thread
//! and never leaves it). Each turn it waits for a command, a provider or output event, or a
//! short timeout, then advances the state machine by at most one decoded chunk:
//!
//! ```text
//! Idle --play--> Buffering --ratio>=1--> Playing --pause--> Paused --play--> Playing
//! Playing/Buffering --end of input + ring drained--> Finished
//! any --decoder or output failure--> Error (terminal)
//! Playing --download failure + ring drained--> Error
//! Playing --interruption--> Paused (flagged) --interruption ends--> Playing
//! Playing --Waiting below low water--> Buffering
//! seek --> Buffering (ring flushed, clock rebased)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::analyzer::AnalyzerHub;
use crate::config::StreamerConfig;
use crate::decoder::{Decoder, DecoderStatus};
use crate::error::{ErrorKind, Result, StreamerError};
use crate::output::{OutputBackend, OutputEvent};
use crate::provider::{FileProvider, ProviderEvent};
use crate::renderer::Renderer;
use crate::status::{SharedStatus, StreamerEvent, StreamerStatus};

/// Minimum spacing of repeated low-water and underrun log lines.
const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Download progress is capped below this until the decoder has produced audio.
const MAX_PREROLL_RATIO: f32 = 0.99;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Play,
    Pause,
    Stop,
    Seek(u64),
    BeginInterruption,
    EndInterruption,
    Shutdown,
}

/// Everything the worker needs, moved onto its thread.
pub(crate) struct WorkerSetup {
    pub(crate) config: StreamerConfig,
    pub(crate) provider: Weak<FileProvider>,
    pub(crate) extension: Option<String>,
    pub(crate) backend: Arc<dyn OutputBackend>,
    pub(crate) volume: Arc<AtomicU32>,
    pub(crate) analyzers: Arc<AnalyzerHub>,
    pub(crate) status: Arc<SharedStatus>,
    pub(crate) cancel: Arc<AtomicBool>,
}

pub(crate) fn spawn(setup: WorkerSetup) -> (Sender<Command>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    let provider_rx = match setup.provider.upgrade() {
        Some(provider) => provider.subscribe(),
        None => crossbeam_channel::never(),
    };
    let handle = thread::spawn(move || {
        let (output_tx, output_rx) = crossbeam_channel::unbounded();
        let worker = EventLoop::new(setup, output_tx);
        worker.run(cmd_rx, provider_rx, output_rx);
    });
    (cmd_tx, handle)
}

struct EventLoop {
    config: StreamerConfig,
    provider: Weak<FileProvider>,
    extension: Option<String>,
    backend: Arc<dyn OutputBackend>,
    volume: Arc<AtomicU32>,
    analyzers: Arc<AnalyzerHub>,
    status: Arc<SharedStatus>,
    cancel: Arc<AtomicBool>,
    output_tx: Sender<OutputEvent>,
    renderer: Option<Renderer>,
    decoder: Option<Decoder>,
    /// Tail of the last chunk the ring had no room for.
    pending: Vec<f32>,
    start_ms: u64,
    draining: bool,
    /// Download failure raised once the ring has played out.
    failure_after_drain: Option<StreamerError>,
    produced_audio: bool,
    backoff: bool,
    waiting_since: Option<Instant>,
    last_low_water_log: Option<Instant>,
    last_underrun_log: Option<Instant>,
    underruns_seen: u64,
}

impl EventLoop {
    fn new(setup: WorkerSetup, output_tx: Sender<OutputEvent>) -> Self {
        Self {
            config: setup.config,
            provider: setup.provider,
            extension: setup.extension,
            backend: setup.backend,
            volume: setup.volume,
            analyzers: setup.analyzers,
            status: setup.status,
            cancel: setup.cancel,
            output_tx,
            renderer: None,
            decoder: None,
            pending: Vec::new(),
            start_ms: 0,
            draining: false,
            failure_after_drain: None,
            produced_audio: false,
            backoff: false,
            waiting_since: None,
            last_low_water_log: None,
            last_underrun_log: None,
            underruns_seen: 0,
        }
    }

    fn run(
        mut self,
        commands: Receiver<Command>,
        provider_events: Receiver<ProviderEvent>,
        output_events: Receiver<OutputEvent>,
    ) {
        let closed = crossbeam_channel::never::<ProviderEvent>();
        let mut provider_open = true;
        loop {
            let timeout = self.next_wait();
            let provider_rx = if provider_open {
                &provider_events
            } else {
                &closed
            };
            crossbeam_channel::select! {
                recv(commands) -> cmd => match cmd {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(cmd) => self.handle_command(cmd),
                },
                recv(provider_rx) -> event => match event {
                    Ok(event) => self.on_provider_event(event),
                    Err(_) => provider_open = false,
                },
                recv(output_events) -> event => {
                    if let Ok(event) = event {
                        self.on_output_event(event);
                    }
                },
                default(timeout) => {}
            }
            self.step();
        }
        self.shut_down();
    }

    fn next_wait(&self) -> Duration {
        match self.status.status() {
            StreamerStatus::Buffering | StreamerStatus::Playing if !self.backoff => Duration::ZERO,
            StreamerStatus::Buffering | StreamerStatus::Playing => self.config.retry_delay(),
            _ => self.config.wait_slice(),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        tracing::debug!(?cmd, status = ?self.status.status(), "streamer command");
        match cmd {
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::Stop => self.stop(),
            Command::Seek(ms) => self.seek(ms),
            Command::BeginInterruption => self.begin_interruption(),
            Command::EndInterruption => self.end_interruption(),
            Command::Shutdown => {}
        }
    }

    fn on_provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::Data { received, expected } => {
                self.status
                    .emit(StreamerEvent::Progress { received, expected });
                self.refresh_duration();
                if !self.produced_audio {
                    self.update_ratio();
                }
            }
            ProviderEvent::Finished => {
                tracing::info!("download finished");
                self.refresh_duration();
            }
            ProviderEvent::Failed(reason) => {
                // surfaced by the decoder once it reaches the missing bytes
                tracing::warn!(%reason, "download failed");
            }
        }
    }

    fn on_output_event(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::Interrupted => self.begin_interruption(),
            OutputEvent::InterruptionEnded => self.end_interruption(),
            OutputEvent::Error(message) => self.fail(StreamerError::Output(message)),
        }
    }

    /// Negotiate the output and open the renderer and decoder on first use.
    fn ensure_pipeline(&mut self) -> Result<()> {
        if self.renderer.is_none() {
            let format = self
                .backend
                .negotiate(self.config.preferred_output)
                .map_err(StreamerError::output)?;
            let mut renderer = Renderer::new(
                self.backend.clone(),
                format,
                self.volume.clone(),
                self.status.counters().clone(),
                Some(self.analyzers.clone()),
                self.output_tx.clone(),
            );
            renderer.set_up(self.config.buffer_time_ms)?;
            self.status
                .set_output_format(format.sample_rate, format.channels);
            self.renderer = Some(renderer);
        }
        if self.decoder.is_none() {
            let format = match &self.renderer {
                Some(r) => r.format(),
                None => return Err(StreamerError::Output("renderer missing".into())),
            };
            self.decoder = Some(Decoder::new(
                self.provider.clone(),
                self.cancel.clone(),
                self.extension.clone(),
                format,
                &self.config,
            ));
        }
        Ok(())
    }

    fn play(&mut self) {
        let status = self.status.status();
        if matches!(
            status,
            StreamerStatus::Buffering | StreamerStatus::Playing | StreamerStatus::Error
        ) {
            return;
        }
        // an explicit play always takes the output back, whatever interrupted it meanwhile
        if self.status.paused_by_interruption() {
            tracing::info!("play requested during interruption; reclaiming output");
        }
        self.status.set_paused_by_interruption(false);
        if let Some(r) = self.renderer.as_mut() {
            r.reactivate();
        }
        match status {
            StreamerStatus::Idle => {
                if let Err(e) = self.ensure_pipeline() {
                    self.fail(e);
                    return;
                }
                if self.start_ms > 0 {
                    let start = self.start_ms;
                    self.reposition(start);
                }
                self.enter_buffering();
            }
            StreamerStatus::Paused => self.resume(),
            StreamerStatus::Finished => {
                self.reposition(0);
                self.enter_buffering();
            }
            StreamerStatus::Buffering | StreamerStatus::Playing | StreamerStatus::Error => {}
        }
    }

    fn pause(&mut self) {
        match self.status.status() {
            StreamerStatus::Playing | StreamerStatus::Buffering => {
                if let Some(r) = self.renderer.as_mut() {
                    r.pause();
                }
                self.waiting_since = None;
                self.status.set_status(StreamerStatus::Paused);
            }
            StreamerStatus::Paused => self.status.set_paused_by_interruption(false),
            _ => {}
        }
    }

    fn stop(&mut self) {
        if self.status.status() != StreamerStatus::Error {
            if let Some(mut decoder) = self.decoder.take() {
                decoder.tear_down();
            }
            // the next play negotiates and opens a fresh output
            if let Some(mut r) = self.renderer.take() {
                r.stop();
                r.tear_down();
            }
            self.pending.clear();
            self.draining = false;
            self.failure_after_drain = None;
            self.produced_audio = false;
            self.waiting_since = None;
            self.start_ms = 0;
            self.status.rebase_clock(0);
            self.status.set_buffering_ratio(0.0);
            self.status.set_paused_by_interruption(false);
            self.status.set_status(StreamerStatus::Idle);
        }
        self.cancel.store(false, Ordering::Relaxed);
    }

    fn seek(&mut self, ms: u64) {
        match self.status.status() {
            StreamerStatus::Error => {}
            StreamerStatus::Idle => {
                self.start_ms = ms;
                self.status.set_timing_offset_ms(ms);
            }
            StreamerStatus::Paused => self.reposition(ms),
            StreamerStatus::Playing | StreamerStatus::Buffering | StreamerStatus::Finished => {
                self.reposition(ms);
                self.enter_buffering();
            }
        }
    }

    /// Flush the ring, rebase the clock at `ms` and point the decoder there.
    fn reposition(&mut self, ms: u64) {
        if let Some(r) = self.renderer.as_mut() {
            r.pause();
            r.flush(false);
        }
        if let Some(d) = self.decoder.as_mut() {
            d.seek(ms);
        }
        self.pending.clear();
        self.draining = false;
        self.failure_after_drain = None;
        self.waiting_since = None;
        self.start_ms = 0;
        self.status.rebase_clock(ms);
        self.status.set_buffering_ratio(0.0);
        tracing::info!(ms, "seek requested");
    }

    fn begin_interruption(&mut self) {
        if let Some(r) = self.renderer.as_mut() {
            r.interrupt();
        }
        if matches!(
            self.status.status(),
            StreamerStatus::Playing | StreamerStatus::Buffering
        ) {
            self.waiting_since = None;
            self.status.set_paused_by_interruption(true);
            self.status.set_status(StreamerStatus::Paused);
        }
    }

    fn end_interruption(&mut self) {
        if let Some(r) = self.renderer.as_mut() {
            r.reactivate();
        }
        match self.status.status() {
            StreamerStatus::Paused if self.status.paused_by_interruption() => {
                self.status.set_paused_by_interruption(false);
                self.resume();
            }
            // restart a stream that was left stopped while the status already said Playing
            StreamerStatus::Playing => self.start_playing(),
            _ => {}
        }
    }

    /// Leave Paused: straight to Playing when audio is buffered, otherwise refill first.
    fn resume(&mut self) {
        let buffered = self.renderer.as_ref().map_or(0, |r| r.buffered_frames());
        if buffered > 0 || self.draining {
            self.start_playing();
        } else {
            self.enter_buffering();
        }
    }

    fn enter_buffering(&mut self) {
        if let Some(r) = self.renderer.as_mut() {
            r.pause();
        }
        self.status.set_status(StreamerStatus::Buffering);
        self.update_ratio();
    }

    fn start_playing(&mut self) {
        let started = match self.renderer.as_mut() {
            Some(r) => r.start(),
            None => Err(StreamerError::Output("renderer missing".into())),
        };
        match started {
            Ok(true) => {
                self.status.set_status(StreamerStatus::Playing);
            }
            Ok(false) => {
                tracing::info!("output interrupted; holding playback until it returns");
                self.waiting_since = None;
                self.status.set_paused_by_interruption(true);
                self.status.set_status(StreamerStatus::Paused);
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, err: StreamerError) {
        if let Some(r) = self.renderer.as_mut() {
            r.pause();
        }
        self.pending.clear();
        self.status.fail(err);
    }

    /// Advance by at most one decoded chunk.
    fn step(&mut self) {
        self.backoff = false;
        let state = self.status.status();
        if !matches!(state, StreamerStatus::Buffering | StreamerStatus::Playing) {
            return;
        }
        self.log_underruns();
        if self.cancel.load(Ordering::Relaxed) {
            // a stop or shutdown is queued behind this turn
            self.backoff = true;
            return;
        }

        if !self.pending.is_empty() {
            self.push_pending();
            self.update_ratio();
            self.maybe_start();
            if !self.pending.is_empty() {
                self.backoff = true;
                return;
            }
        }
        if self.draining {
            self.maybe_start();
            self.check_drained();
            self.backoff = true;
            return;
        }

        let (result, reached, chunk, failure) = {
            let Some(decoder) = self.decoder.as_mut() else {
                return;
            };
            let result = decoder.decode_once();
            (
                result,
                decoder.take_seek_result(),
                decoder.take_chunk(),
                decoder.failure().cloned(),
            )
        };
        if let Some(reached) = reached {
            self.status.set_timing_offset_ms(reached);
        }

        match result {
            DecoderStatus::Succeeded => {
                self.waiting_since = None;
                if let Some(chunk) = chunk {
                    self.pending = chunk.samples;
                    self.produced_audio = true;
                    self.push_pending();
                }
                self.refresh_duration();
                self.update_ratio();
                self.maybe_start();
                if !self.pending.is_empty() {
                    self.backoff = true;
                }
            }
            DecoderStatus::Waiting => self.on_waiting(state),
            DecoderStatus::EndEncountered => {
                tracing::info!("end of input; draining output");
                self.draining = true;
                self.waiting_since = None;
                self.update_ratio();
                self.maybe_start();
                self.check_drained();
            }
            DecoderStatus::Failed => {
                if self.cancel.load(Ordering::Relaxed) {
                    self.decoder = None;
                    return;
                }
                let err = failure.unwrap_or_else(|| StreamerError::decoding("decoder failed"));
                let buffered = self.renderer.as_ref().map_or(0, |r| r.buffered_frames());
                if err.kind() == ErrorKind::NetworkError && buffered > 0 {
                    tracing::info!(buffered, "download failed; playing out what arrived");
                    self.failure_after_drain = Some(err);
                    self.draining = true;
                    self.waiting_since = None;
                    self.update_ratio();
                    self.maybe_start();
                    self.check_drained();
                } else {
                    self.fail(err);
                }
            }
        }
    }

    fn on_waiting(&mut self, state: StreamerStatus) {
        self.backoff = true;
        let since = *self.waiting_since.get_or_insert_with(Instant::now);
        if let Some(limit) = self.config.stall_timeout() {
            if since.elapsed() >= limit {
                self.fail(StreamerError::network(format!(
                    "no data received for {} ms",
                    limit.as_millis()
                )));
                return;
            }
        }
        let fill = self.renderer.as_ref().map_or(0.0, |r| r.fill_ratio());
        if state == StreamerStatus::Playing && fill < self.config.low_water_threshold {
            let now = Instant::now();
            if self
                .last_low_water_log
                .is_none_or(|t| now.duration_since(t) > LOG_INTERVAL)
            {
                self.last_low_water_log = Some(now);
                tracing::info!(
                    fill,
                    low_water = self.config.low_water_threshold,
                    "ring below low water while waiting for data"
                );
            }
            self.enter_buffering();
        } else {
            self.update_ratio();
        }
    }

    fn push_pending(&mut self) {
        let Some(renderer) = self.renderer.as_mut() else {
            self.pending.clear();
            return;
        };
        let written = renderer.render(&self.pending);
        self.pending.drain(..written);
    }

    fn maybe_start(&mut self) {
        if self.status.status() == StreamerStatus::Buffering && self.status.buffering_ratio() >= 1.0
        {
            self.start_playing();
        }
    }

    fn check_drained(&mut self) {
        if !self.draining || !self.pending.is_empty() {
            return;
        }
        let buffered = self.renderer.as_ref().map_or(0, |r| r.buffered_frames());
        if buffered == 0 && self.status.status() == StreamerStatus::Playing {
            if let Some(r) = self.renderer.as_mut() {
                r.pause();
            }
            if let Some(err) = self.failure_after_drain.take() {
                self.fail(err);
                return;
            }
            tracing::info!(time_ms = self.status.current_time_ms(), "playback finished");
            self.status.set_status(StreamerStatus::Finished);
        }
    }

    fn update_ratio(&self) {
        let exhausted = self.decoder.as_ref().is_some_and(|d| d.input_exhausted());
        let ratio = if self.draining || exhausted {
            1.0
        } else if !self.produced_audio {
            match self.provider.upgrade() {
                Some(p) => match p.expected_length() {
                    Some(len) if len > 0 => {
                        (p.received_length() as f32 / len as f32).min(MAX_PREROLL_RATIO)
                    }
                    _ => 0.0,
                },
                None => 0.0,
            }
        } else {
            let fill = self.renderer.as_ref().map_or(0.0, |r| r.fill_ratio());
            (fill / self.config.ready_fraction()).min(1.0)
        };
        self.status.set_buffering_ratio(ratio);
    }

    fn refresh_duration(&self) {
        if let Some(ms) = self
            .decoder
            .as_ref()
            .and_then(|d| d.item().estimated_duration_ms())
        {
            self.status.set_duration_ms(ms);
        }
    }

    fn log_underruns(&mut self) {
        let events = self
            .status
            .counters()
            .underrun_events
            .load(Ordering::Relaxed);
        if events == self.underruns_seen {
            return;
        }
        let now = Instant::now();
        if self
            .last_underrun_log
            .is_none_or(|t| now.duration_since(t) > LOG_INTERVAL)
        {
            self.last_underrun_log = Some(now);
            tracing::warn!(
                underrun_events = events,
                underrun_frames = self
                    .status
                    .counters()
                    .underrun_frames
                    .load(Ordering::Relaxed),
                "output underrun"
            );
            self.underruns_seen = events;
        }
    }

    fn shut_down(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.tear_down();
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.tear_down();
        }
        tracing::debug!("streamer worker exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{ManualOutput, OutputFormat};
    use crate::test_support::{completed_provider, wav_bytes};

    struct Fixture {
        worker: EventLoop,
        output: ManualOutput,
        _events: Receiver<OutputEvent>,
    }

    fn fixture(provider: &Arc<FileProvider>) -> Fixture {
        let output = ManualOutput::with_format(OutputFormat::new(8_000, 1));
        let mut config = StreamerConfig::default();
        config.buffer_time_ms = 1_000;
        config.decode_chunk_frames = 256;
        config.ready_threshold = 0.5;
        let setup = WorkerSetup {
            config,
            provider: Arc::downgrade(provider),
            extension: Some("wav".into()),
            backend: Arc::new(output.clone()),
            volume: Arc::new(AtomicU32::new(1f32.to_bits())),
            analyzers: Arc::new(AnalyzerHub::new()),
            status: Arc::new(SharedStatus::default()),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        Fixture {
            worker: EventLoop::new(setup, tx),
            output,
            _events: rx,
        }
    }

    /// Step a freshly played worker until it leaves Buffering, recording status, ratio and
    /// ring fill after every turn. Nothing drains the output meanwhile.
    fn buffer_up(worker: &mut EventLoop) -> Vec<(StreamerStatus, f32, f32)> {
        worker.play();
        assert_eq!(worker.status.status(), StreamerStatus::Buffering);
        let mut trace = Vec::new();
        for _ in 0..500 {
            worker.step();
            let fill = worker.renderer.as_ref().map_or(0.0, |r| r.fill_ratio());
            let status = worker.status.status();
            trace.push((status, worker.status.buffering_ratio(), fill));
            if status != StreamerStatus::Buffering {
                break;
            }
        }
        trace
    }

    #[test]
    fn buffering_ratio_reaches_one_exactly_at_the_ready_threshold() {
        let (_dir, provider) = completed_provider(wav_bytes(8_000, 1, 16_000), "wav");
        let mut fx = fixture(&provider);
        let trace = buffer_up(&mut fx.worker);

        assert!(
            trace.iter().all(|(_, ratio, _)| (0.0..=1.0).contains(ratio)),
            "{trace:?}"
        );
        let (last, before) = trace.split_last().unwrap();
        assert_eq!(last.0, StreamerStatus::Playing);
        assert_eq!(last.1, 1.0);
        assert!(last.2 >= 0.5, "started at fill {}", last.2);
        for (status, ratio, fill) in before {
            assert_eq!(*status, StreamerStatus::Buffering);
            assert!(*ratio < 1.0 && *fill < 0.5, "ratio {ratio} at fill {fill}");
        }
    }

    #[test]
    fn short_input_counts_as_fully_buffered() {
        // 1 000 frames never reach half of an 8 000 frame ring
        let (_dir, provider) = completed_provider(wav_bytes(8_000, 1, 1_000), "wav");
        let mut fx = fixture(&provider);
        let trace = buffer_up(&mut fx.worker);

        let (status, ratio, fill) = *trace.last().unwrap();
        assert_eq!(status, StreamerStatus::Playing);
        assert_eq!(ratio, 1.0);
        assert!(fill < 0.5);
        assert!(trace.iter().all(|(_, ratio, _)| (0.0..=1.0).contains(ratio)));
    }

    #[test]
    fn stop_releases_the_output_and_play_reopens_it() {
        let (_dir, provider) = completed_provider(wav_bytes(8_000, 1, 16_000), "wav");
        let mut fx = fixture(&provider);
        buffer_up(&mut fx.worker);
        assert!(fx.output.is_open());

        fx.worker.stop();
        assert!(fx.worker.renderer.is_none());
        assert!(fx.worker.decoder.is_none());
        assert!(!fx.output.is_open());
        assert_eq!(fx.worker.status.status(), StreamerStatus::Idle);

        let trace = buffer_up(&mut fx.worker);
        assert_eq!(trace.last().map(|t| t.0), Some(StreamerStatus::Playing));
        assert!(fx.output.is_open());
    }
}
