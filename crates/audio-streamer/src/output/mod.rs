//! Audio output backends.
//!
//! A backend negotiates an [`OutputFormat`] and opens a stream that repeatedly invokes a
//! [`RenderCallback`] from its real-time thread. Device-level notifications (interruptions,
//! stream errors) are reported through an [`OutputEvent`] channel so the event loop can react.

pub mod cpal;
pub mod device;
pub mod manual;

pub use self::cpal::CpalOutput;
pub use self::manual::ManualOutput;

use anyhow::Result;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::renderer::RenderCallback;

/// Interleaved `f32` layout delivered to the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

impl OutputFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        frames.saturating_mul(1000) / u64::from(self.sample_rate)
    }

    pub fn ms_to_frames(&self, ms: u64) -> u64 {
        ms.saturating_mul(u64::from(self.sample_rate)) / 1000
    }
}

/// Notifications raised by an output stream outside the render callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    /// Another client or the system took the device away.
    Interrupted,
    InterruptionEnded,
    Error(String),
}

pub trait OutputBackend: Send + Sync {
    /// Closest format the device supports to `preferred`.
    fn negotiate(&self, preferred: OutputFormat) -> Result<OutputFormat>;

    /// Open a paused stream in `format` that pulls audio from `callback`.
    fn open(
        &self,
        format: OutputFormat,
        callback: RenderCallback,
        events: Sender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>>;
}

/// A live output stream. Dropping it closes the stream.
pub trait OutputStream {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_and_ms_conversions() {
        let f = OutputFormat::new(48_000, 2);
        assert_eq!(f.frames_to_ms(48_000), 1000);
        assert_eq!(f.ms_to_frames(250), 12_000);
        assert_eq!(OutputFormat::new(0, 2).frames_to_ms(10), 0);
    }
}
