//! CPAL output stream.
//!
//! The host and device are resolved inside [`OutputBackend::open`] so the stream is created on
//! the thread that owns it. The data callback converts the renderer's `f32` output to the
//! device sample format through a preallocated scratch buffer.

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::Sender;

use super::device::{closest_config, find_device, fixed_buffer_size};
use super::{OutputBackend, OutputEvent, OutputFormat, OutputStream};
use crate::renderer::RenderCallback;

/// Conversion scratch size when the host does not report a fixed callback size.
const SCRATCH_FRAMES: usize = 16_384;

/// System audio output through CPAL.
#[derive(Clone, Debug, Default)]
pub struct CpalOutput {
    device: Option<String>,
}

impl CpalOutput {
    /// `device` is a case-insensitive substring of the device name; `None` uses the default.
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    fn select(&self, format: OutputFormat) -> Result<(cpal::Device, cpal::SupportedStreamConfig)> {
        let host = cpal::default_host();
        let device = find_device(&host, self.device.as_deref())?;
        let config = closest_config(&device, format)?;
        Ok((device, config))
    }
}

impl OutputBackend for CpalOutput {
    fn negotiate(&self, preferred: OutputFormat) -> Result<OutputFormat> {
        let (device, config) = self.select(preferred)?;
        let negotiated = OutputFormat::new(config.sample_rate(), config.channels());
        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            sample_rate = negotiated.sample_rate,
            channels = negotiated.channels,
            sample_format = ?config.sample_format(),
            "output format negotiated"
        );
        Ok(negotiated)
    }

    fn open(
        &self,
        format: OutputFormat,
        callback: RenderCallback,
        events: Sender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>> {
        let (device, supported) = self.select(format)?;
        if supported.sample_rate() != format.sample_rate || supported.channels() != format.channels {
            return Err(anyhow!(
                "device no longer supports {} Hz x{}",
                format.sample_rate,
                format.channels
            ));
        }
        let mut config: cpal::StreamConfig = supported.config();
        if let Some(buffer_size) = fixed_buffer_size(&supported) {
            config.buffer_size = buffer_size;
        }

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_f32(&device, &config, callback, events)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, callback, events)?,
            cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, callback, events)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, callback, events)?,
            other => return Err(anyhow!("Unsupported sample format: {other:?}")),
        };
        stream.pause()?;
        Ok(Box::new(CpalStream { stream }))
    }
}

struct CpalStream {
    stream: cpal::Stream,
}

impl OutputStream for CpalStream {
    fn play(&mut self) -> Result<()> {
        self.stream.play()?;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.stream.pause()?;
        Ok(())
    }
}

fn error_handler(events: Sender<OutputEvent>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        tracing::warn!("stream error: {err}");
        let event = match err {
            cpal::StreamError::DeviceNotAvailable => OutputEvent::Interrupted,
            other => OutputEvent::Error(other.to_string()),
        };
        let _ = events.send(event);
    }
}

fn build_f32(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    callback: RenderCallback,
    events: Sender<OutputEvent>,
) -> Result<cpal::Stream> {
    let stream = device.build_output_stream(
        config,
        move |data: &mut [f32], _| callback.render(data),
        error_handler(events),
        None,
    )?;
    Ok(stream)
}

/// Type-specialized stream builder for integer device formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    callback: RenderCallback,
    events: Sender<OutputEvent>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let frames = match config.buffer_size {
        cpal::BufferSize::Fixed(n) => (n as usize).max(SCRATCH_FRAMES),
        cpal::BufferSize::Default => SCRATCH_FRAMES,
    };
    let mut scratch = vec![0.0f32; frames * config.channels.max(1) as usize];
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            render_converted(&mut scratch, data, |buf| callback.render(buf));
        },
        error_handler(events),
        None,
    )?;
    Ok(stream)
}

/// Fill `data` through `scratch`, one scratch-sized block at a time. `scratch` holds whole
/// frames and is never grown here: this runs on the device thread.
fn render_converted<T>(scratch: &mut [f32], data: &mut [T], mut render: impl FnMut(&mut [f32]))
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    if scratch.is_empty() {
        data.fill(T::EQUILIBRIUM);
        return;
    }
    for block in data.chunks_mut(scratch.len()) {
        let buf = &mut scratch[..block.len()];
        render(buf);
        for (dst, src) in block.iter_mut().zip(buf.iter()) {
            *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_callback_is_served_in_scratch_blocks() {
        let mut scratch = vec![0.0f32; 4];
        let mut data = [0i16; 10];
        let mut blocks = Vec::new();
        let mut next = 0.0f32;
        render_converted(&mut scratch, &mut data, |buf| {
            blocks.push(buf.len());
            for s in buf {
                next += 0.1;
                *s = next;
            }
        });
        assert_eq!(blocks, vec![4, 4, 2]);
        assert_eq!(scratch.len(), 4);
        assert!(data.windows(2).all(|w| w[0] < w[1]), "{data:?}");
    }

    #[test]
    fn converts_to_the_device_sample_format() {
        let mut scratch = vec![0.0f32; 8];
        let mut data = [0u16; 3];
        render_converted(&mut scratch, &mut data, |buf| buf.copy_from_slice(&[-1.0, 0.0, 1.0]));
        assert_eq!(data[1], 32_768);
        assert!(data[0] < 10 && data[2] > 65_500, "{data:?}");
    }
}
