//! Pass-through hook for spectrum analyzers and other PCM observers.
//!
//! The render callback copies what it plays into a lock-free tap; a dispatch thread cuts the
//! tap into fixed windows and hands each to every registered [`Analyzer`]. An analyzer that
//! errors or panics is logged and skipped without affecting playback. With no analyzer
//! registered the dispatch thread sleeps until one is added.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtrb::{Consumer, Producer, RingBuffer};

use crate::output::OutputFormat;

/// Frames per analysis window.
pub const ANALYZER_WINDOW_FRAMES: usize = 1024;

/// Receives rendered audio in windows of [`ANALYZER_WINDOW_FRAMES`] frames.
pub trait Analyzer: Send {
    fn process(&mut self, samples: &[f32], format: OutputFormat) -> anyhow::Result<()>;
}

pub type AnalyzerId = u64;

/// Registry shared by every renderer of a streamer.
#[derive(Default)]
pub struct AnalyzerHub {
    analyzers: Mutex<Vec<(AnalyzerId, Box<dyn Analyzer>)>>,
    /// Signalled when an analyzer is added or a tap is stopping.
    changed: Condvar,
    next_id: AtomicU64,
}

impl AnalyzerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, analyzer: Box<dyn Analyzer>) -> AnalyzerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut list) = self.analyzers.lock() {
            list.push((id, analyzer));
        }
        self.changed.notify_all();
        id
    }

    pub fn remove(&self, id: AnalyzerId) -> bool {
        match self.analyzers.lock() {
            Ok(mut list) => {
                let before = list.len();
                list.retain(|(i, _)| *i != id);
                list.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.lock().map(|l| l.is_empty()).unwrap_or(true)
    }

    /// Block until an analyzer is registered or `stop` is set.
    fn wait_for_analyzers(&self, stop: &AtomicBool) {
        let Ok(mut list) = self.analyzers.lock() else {
            return;
        };
        while list.is_empty() && !stop.load(Ordering::Relaxed) {
            list = match self.changed.wait(list) {
                Ok(list) => list,
                Err(_) => return,
            };
        }
    }

    /// Wake dispatch threads parked in [`AnalyzerHub::wait_for_analyzers`].
    fn wake(&self) {
        let _list = self.analyzers.lock();
        self.changed.notify_all();
    }

    pub(crate) fn dispatch(&self, window: &[f32], format: OutputFormat) {
        let Ok(mut list) = self.analyzers.lock() else {
            return;
        };
        for (id, analyzer) in list.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| analyzer.process(window, format))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(analyzer = *id, "analyzer error: {e:#}"),
                Err(_) => tracing::error!(analyzer = *id, "analyzer panicked"),
            }
        }
    }
}

/// Dispatch thread fed by the render callback's tap.
pub(crate) struct AnalyzerTap {
    hub: Arc<AnalyzerHub>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AnalyzerTap {
    /// Returns the producer the callback writes into and the running tap.
    pub(crate) fn start(hub: Arc<AnalyzerHub>, format: OutputFormat) -> (Producer<f32>, Self) {
        let window = ANALYZER_WINDOW_FRAMES * format.channels.max(1) as usize;
        let (producer, consumer) = RingBuffer::<f32>::new(window * 8);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let thread_hub = hub.clone();
        let handle =
            thread::spawn(move || run_tap(thread_hub, consumer, window, format, stop_thread));
        (
            producer,
            Self {
                hub,
                stop,
                handle: Some(handle),
            },
        )
    }
}

impl Drop for AnalyzerTap {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.hub.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_tap(
    hub: Arc<AnalyzerHub>,
    mut consumer: Consumer<f32>,
    window: usize,
    format: OutputFormat,
    stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0.0f32; window];
    while !stop.load(Ordering::Relaxed) {
        if hub.is_empty() {
            hub.wait_for_analyzers(&stop);
            // audio tapped while nobody listened is stale
            let stale = consumer.slots();
            if let Ok(chunk) = consumer.read_chunk(stale) {
                chunk.commit_all();
            }
            continue;
        }
        let mut dispatched = false;
        while consumer.slots() >= window {
            let Ok(chunk) = consumer.read_chunk(window) else {
                break;
            };
            let (first, second) = chunk.as_slices();
            buf[..first.len()].copy_from_slice(first);
            buf[first.len()..].copy_from_slice(second);
            chunk.commit_all();
            hub.dispatch(&buf, format);
            dispatched = true;
        }
        if !dispatched {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Copy `samples` into the tap without blocking; drops what does not fit.
pub(crate) fn feed_tap(tap: &mut Producer<f32>, samples: &[f32]) {
    let n = tap.slots().min(samples.len());
    if n == 0 {
        return;
    }
    if let Ok(mut chunk) = tap.write_chunk(n) {
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&samples[..split]);
        second.copy_from_slice(&samples[split..n]);
        chunk.commit_all();
    }
}
