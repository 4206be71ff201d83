//! Timed ring buffer feeding the output backend.
//!
//! The worker appends decoded PCM with [`Renderer::render`]; the backend's real-time thread
//! drains it through a [`RenderCallback`]. The drained frame counter is the listener clock.
//!
//! ## Real-time constraints
//! The callback never blocks and never allocates: the ring consumer is only `try_lock`ed,
//! volume and pause state are atomics, and the analyzer tap is a lock-free ring.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use rtrb::Producer;

use crate::analyzer::{AnalyzerHub, AnalyzerTap, feed_tap};
use crate::error::{Result, StreamerError};
use crate::output::{OutputBackend, OutputEvent, OutputFormat, OutputStream};
use crate::ring::{RingReader, RingWriter, ring};

/// State shared between the worker-side [`Renderer`] and the callback.
struct RenderShared {
    reader: RingReader,
    channels: usize,
    paused: AtomicBool,
    volume: Arc<AtomicU32>,
    played_frames: Arc<AtomicU64>,
    underrun_frames: Arc<AtomicU64>,
    underrun_events: Arc<AtomicU64>,
    tap: Mutex<Option<Producer<f32>>>,
}

/// Real-time consumer handed to the output backend.
pub struct RenderCallback {
    shared: Arc<RenderShared>,
}

impl RenderCallback {
    /// Fill `out` with interleaved samples; silence where nothing is buffered.
    pub fn render(&self, out: &mut [f32]) {
        let shared = &*self.shared;
        if shared.paused.load(Ordering::Relaxed) {
            out.fill(0.0);
            return;
        }
        let wanted = out.len() - out.len() % shared.channels;
        let got = shared.reader.read_into(&mut out[..wanted]);

        let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
        if volume != 1.0 {
            for s in &mut out[..got] {
                *s *= volume;
            }
        }
        out[got..].fill(0.0);

        if got > 0 {
            shared
                .played_frames
                .fetch_add((got / shared.channels) as u64, Ordering::Relaxed);
            if let Ok(mut tap) = shared.tap.try_lock() {
                if let Some(tap) = tap.as_mut() {
                    feed_tap(tap, &out[..got]);
                }
            }
        }
        if got < wanted {
            shared.underrun_events.fetch_add(1, Ordering::Relaxed);
            shared
                .underrun_frames
                .fetch_add(((wanted - got) / shared.channels) as u64, Ordering::Relaxed);
        }
    }
}

/// Counters the renderer updates and the status snapshot reads.
#[derive(Clone, Default)]
pub struct RenderCounters {
    /// Frames drained by the callback since the last timing reset.
    pub played_frames: Arc<AtomicU64>,
    pub underrun_frames: Arc<AtomicU64>,
    pub underrun_events: Arc<AtomicU64>,
}

/// Worker-side half of the output path. Lives on the worker thread: the stream it owns may
/// not be `Send`.
pub struct Renderer {
    backend: Arc<dyn OutputBackend>,
    format: OutputFormat,
    volume: Arc<AtomicU32>,
    counters: RenderCounters,
    analyzers: Option<Arc<AnalyzerHub>>,
    events: Sender<OutputEvent>,
    writer: Option<RingWriter>,
    shared: Option<Arc<RenderShared>>,
    stream: Option<Box<dyn OutputStream>>,
    tap: Option<AnalyzerTap>,
    running: bool,
    interrupted: bool,
}

impl Renderer {
    pub fn new(
        backend: Arc<dyn OutputBackend>,
        format: OutputFormat,
        volume: Arc<AtomicU32>,
        counters: RenderCounters,
        analyzers: Option<Arc<AnalyzerHub>>,
        events: Sender<OutputEvent>,
    ) -> Self {
        Self {
            backend,
            format,
            volume,
            counters,
            analyzers,
            events,
            writer: None,
            shared: None,
            stream: None,
            tap: None,
            running: false,
            interrupted: false,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_set_up(&self) -> bool {
        self.stream.is_some()
    }

    /// Allocate the ring for `buffer_time_ms` of audio and open a paused output stream.
    pub fn set_up(&mut self, buffer_time_ms: u64) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let channels = self.format.channels.max(1) as usize;
        let capacity_frames = self.format.ms_to_frames(buffer_time_ms).max(256) as usize;
        let (writer, reader) = ring(capacity_frames, channels);

        let (tap_producer, tap) = match &self.analyzers {
            Some(hub) => {
                let (producer, tap) = AnalyzerTap::start(hub.clone(), self.format);
                (Some(producer), Some(tap))
            }
            None => (None, None),
        };

        let shared = Arc::new(RenderShared {
            reader,
            channels,
            paused: AtomicBool::new(true),
            volume: self.volume.clone(),
            played_frames: self.counters.played_frames.clone(),
            underrun_frames: self.counters.underrun_frames.clone(),
            underrun_events: self.counters.underrun_events.clone(),
            tap: Mutex::new(tap_producer),
        });
        let callback = RenderCallback {
            shared: shared.clone(),
        };
        let mut stream = self
            .backend
            .open(self.format, callback, self.events.clone())
            .map_err(StreamerError::output)?;
        stream.pause().map_err(StreamerError::output)?;

        tracing::info!(
            sample_rate = self.format.sample_rate,
            channels,
            capacity_frames,
            "renderer ready"
        );
        self.writer = Some(writer);
        self.shared = Some(shared);
        self.stream = Some(stream);
        self.tap = tap;
        self.running = false;
        Ok(())
    }

    /// Append interleaved samples; returns how many were accepted (whole frames only).
    pub fn render(&mut self, samples: &[f32]) -> usize {
        match self.writer.as_mut() {
            Some(w) => w.write(samples),
            None => 0,
        }
    }

    pub fn buffered_frames(&self) -> usize {
        match &self.writer {
            Some(w) => w.buffered_samples() / self.format.channels.max(1) as usize,
            None => 0,
        }
    }

    pub fn capacity_frames(&self) -> usize {
        match &self.writer {
            Some(w) => w.capacity_samples() / self.format.channels.max(1) as usize,
            None => 0,
        }
    }

    /// Buffered fraction of the ring, in [0, 1].
    pub fn fill_ratio(&self) -> f32 {
        let capacity = self.capacity_frames();
        if capacity == 0 {
            return 0.0;
        }
        (self.buffered_frames() as f32 / capacity as f32).clamp(0.0, 1.0)
    }

    /// Audio drained to the device since the last timing reset.
    pub fn current_time_ms(&self) -> u64 {
        self.format
            .frames_to_ms(self.counters.played_frames.load(Ordering::Relaxed))
    }

    /// Discard buffered audio; `reset_timing` also zeroes the drained-frame clock.
    pub fn flush(&mut self, reset_timing: bool) {
        if let Some(shared) = &self.shared {
            let dropped = shared.reader.clear();
            tracing::debug!(dropped_samples = dropped, reset_timing, "renderer flushed");
        }
        if reset_timing {
            self.counters.played_frames.store(0, Ordering::Relaxed);
        }
    }

    /// Let the callback drain the ring. Returns `false` (and leaves the stream paused) while
    /// the output is interrupted.
    pub fn start(&mut self) -> Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(StreamerError::Output("renderer not set up".into()));
        };
        if self.interrupted {
            return Ok(false);
        }
        if let Some(shared) = &self.shared {
            shared.paused.store(false, Ordering::Relaxed);
        }
        if !self.running {
            stream.play().map_err(StreamerError::output)?;
            self.running = true;
        }
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Emit silence without draining.
    pub fn pause(&mut self) {
        if let Some(shared) = &self.shared {
            shared.paused.store(true, Ordering::Relaxed);
        }
        if self.running {
            if let Some(stream) = self.stream.as_mut() {
                if let Err(e) = stream.pause() {
                    tracing::warn!("output pause failed: {e:#}");
                }
            }
            self.running = false;
        }
    }

    /// Pause and drop buffered audio and timing. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.pause();
        self.flush(true);
    }

    /// The device was taken away: stop pulling until [`Renderer::reactivate`].
    pub fn interrupt(&mut self) {
        if self.interrupted {
            return;
        }
        self.pause();
        self.interrupted = true;
        tracing::info!("output interrupted");
    }

    /// Clear the interruption; output resumes with the next [`Renderer::start`].
    pub fn reactivate(&mut self) {
        if self.interrupted {
            self.interrupted = false;
            tracing::info!("output reactivated");
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Close the stream and release the ring. Safe to call repeatedly.
    pub fn tear_down(&mut self) {
        self.pause();
        self.stream = None;
        self.tap = None;
        self.shared = None;
        self.writer = None;
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.tear_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ManualOutput;

    fn renderer(output: &ManualOutput, format: OutputFormat, volume: f32) -> Renderer {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut r = Renderer::new(
            Arc::new(output.clone()),
            format,
            Arc::new(AtomicU32::new(volume.to_bits())),
            RenderCounters::default(),
            None,
            tx,
        );
        r.set_up(1000).unwrap();
        r
    }

    #[test]
    fn paused_callback_emits_silence_without_draining() {
        let output = ManualOutput::new();
        let format = OutputFormat::new(1000, 1);
        let mut r = renderer(&output, format, 1.0);
        assert_eq!(r.render(&[0.5; 100]), 100);
        assert!(output.pull(10).is_none());
        r.start().unwrap();
        r.pause();
        // paused stream is not pulled by the device; the callback itself also stays silent
        assert!(output.pull(10).is_none());
        assert_eq!(r.buffered_frames(), 100);
    }

    #[test]
    fn drains_applies_volume_and_counts_time() {
        let output = ManualOutput::new();
        let format = OutputFormat::new(1000, 2);
        let mut r = renderer(&output, format, 0.5);
        r.render(&[0.8; 200]);
        r.start().unwrap();
        let out = output.pull(50).unwrap();
        assert!(out.iter().all(|s| (*s - 0.4).abs() < 1e-6));
        assert_eq!(r.current_time_ms(), 50);
        assert_eq!(r.buffered_frames(), 50);
    }

    #[test]
    fn underrun_fills_silence_and_counts() {
        let output = ManualOutput::new();
        let format = OutputFormat::new(1000, 1);
        let mut r = renderer(&output, format, 1.0);
        r.render(&[1.0; 4]);
        r.start().unwrap();
        let out = output.pull(10).unwrap();
        assert_eq!(&out[..4], &[1.0; 4]);
        assert!(out[4..].iter().all(|s| *s == 0.0));
        assert_eq!(r.counters.underrun_events.load(Ordering::Relaxed), 1);
        assert_eq!(r.counters.underrun_frames.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn backpressure_and_flush() {
        let output = ManualOutput::new();
        let format = OutputFormat::new(1000, 1);
        let mut r = renderer(&output, format, 1.0);
        assert_eq!(r.capacity_frames(), 1000);
        assert_eq!(r.render(&[0.1; 1500]), 1000);
        assert_eq!(r.fill_ratio(), 1.0);
        r.start().unwrap();
        output.pull(100).unwrap();
        r.flush(true);
        assert_eq!(r.buffered_frames(), 0);
        assert_eq!(r.current_time_ms(), 0);
    }

    #[test]
    fn start_on_an_interrupted_output_keeps_the_callback_silent() {
        let output = ManualOutput::new();
        let mut r = renderer(&output, OutputFormat::new(1000, 1), 1.0);
        r.render(&[0.7; 50]);
        r.interrupt();
        assert!(!r.start().unwrap());
        assert!(output.pull(10).is_none());
        assert_eq!(r.buffered_frames(), 50);
        assert_eq!(r.current_time_ms(), 0);
    }

    #[test]
    fn tear_down_closes_the_stream() {
        let output = ManualOutput::new();
        let mut r = renderer(&output, OutputFormat::new(1000, 1), 1.0);
        assert!(output.is_open());
        r.tear_down();
        r.tear_down();
        assert!(!output.is_open());
        assert!(!r.is_set_up());
        assert_eq!(r.render(&[0.1; 8]), 0);
        assert!(r.start().is_err());
    }

    #[test]
    fn interruption_holds_output_until_reactivated() {
        let output = ManualOutput::new();
        let mut r = renderer(&output, OutputFormat::new(1000, 1), 1.0);
        r.render(&[0.2; 10]);
        assert!(r.start().unwrap());
        r.interrupt();
        assert!(!output.is_playing());
        assert!(!r.start().unwrap());
        assert!(!output.is_playing());
        assert!(!r.is_running());
        r.reactivate();
        assert!(r.start().unwrap());
        assert!(output.is_playing());
        r.stop();
        r.stop();
        assert_eq!(r.buffered_frames(), 0);
    }
}
