//! Output driven by the caller instead of a device clock.
//!
//! The owner pulls rendered audio with [`ManualOutput::pull`] and can inject device events.
//! Useful for headless runs and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use crossbeam_channel::Sender;

use super::{OutputBackend, OutputEvent, OutputFormat, OutputStream};
use crate::renderer::RenderCallback;

#[derive(Default)]
struct ManualInner {
    forced: Option<OutputFormat>,
    format: Mutex<Option<OutputFormat>>,
    callback: Mutex<Option<RenderCallback>>,
    events: Mutex<Option<Sender<OutputEvent>>>,
    playing: AtomicBool,
}

/// Cloneable handle; every clone drives the same stream.
#[derive(Clone, Default)]
pub struct ManualOutput {
    inner: Arc<ManualInner>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Negotiate `format` regardless of what the streamer asks for.
    pub fn with_format(format: OutputFormat) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                forced: Some(format),
                ..Default::default()
            }),
        }
    }

    /// Format of the open stream.
    pub fn format(&self) -> Option<OutputFormat> {
        self.inner.format.lock().ok().and_then(|f| *f)
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .callback
            .lock()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::Relaxed)
    }

    /// Render `frames` frames the way a device callback would. Returns `None` while the
    /// stream is closed or paused.
    pub fn pull(&self, frames: usize) -> Option<Vec<f32>> {
        if !self.is_playing() {
            return None;
        }
        let channels = self.format()?.channels as usize;
        let guard = self.inner.callback.lock().ok()?;
        let callback = guard.as_ref()?;
        let mut buf = vec![0.0f32; frames * channels];
        callback.render(&mut buf);
        Some(buf)
    }

    pub fn interrupt(&self) {
        self.send(OutputEvent::Interrupted);
    }

    pub fn end_interruption(&self) {
        self.send(OutputEvent::InterruptionEnded);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.send(OutputEvent::Error(message.into()));
    }

    fn send(&self, event: OutputEvent) {
        if let Ok(events) = self.inner.events.lock() {
            if let Some(tx) = events.as_ref() {
                let _ = tx.send(event);
            }
        }
    }
}

impl OutputBackend for ManualOutput {
    fn negotiate(&self, preferred: OutputFormat) -> Result<OutputFormat> {
        Ok(self.inner.forced.unwrap_or(preferred))
    }

    fn open(
        &self,
        format: OutputFormat,
        callback: RenderCallback,
        events: Sender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>> {
        let mut slot = self
            .inner
            .callback
            .lock()
            .map_err(|_| anyhow!("manual output poisoned"))?;
        *slot = Some(callback);
        if let Ok(mut f) = self.inner.format.lock() {
            *f = Some(format);
        }
        if let Ok(mut e) = self.inner.events.lock() {
            *e = Some(events);
        }
        self.inner.playing.store(false, Ordering::Relaxed);
        Ok(Box::new(ManualStream {
            inner: self.inner.clone(),
        }))
    }
}

struct ManualStream {
    inner: Arc<ManualInner>,
}

impl OutputStream for ManualStream {
    fn play(&mut self) -> Result<()> {
        self.inner.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.inner.playing.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        self.inner.playing.store(false, Ordering::Relaxed);
        if let Ok(mut slot) = self.inner.callback.lock() {
            *slot = None;
        }
    }
}
