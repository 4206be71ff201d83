//! CPAL device lookup and stream config selection.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use super::OutputFormat;

/// Callback buffer ceiling requested from devices that advertise a range.
const MAX_BUFFER_FRAMES: u32 = 4_096;

/// Resolve `name` against the host's output devices, or return the default device.
///
/// An exact (case-insensitive) name wins over a substring match.
pub fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    let Some(wanted) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"));
    };
    let wanted = wanted.to_lowercase();
    let mut partial = None;
    for device in host.output_devices().context("enumerate output devices")? {
        let Ok(label) = device_name(&device) else { continue };
        let label = label.to_lowercase();
        if label == wanted {
            return Ok(device);
        }
        if partial.is_none() && label.contains(&wanted) {
            partial = Some(device);
        }
    }
    partial.ok_or_else(|| anyhow!("no output device named {wanted:?}"))
}

/// The supported config closest to `preferred`.
pub fn closest_config(
    device: &cpal::Device,
    preferred: OutputFormat,
) -> Result<cpal::SupportedStreamConfig> {
    device
        .supported_output_configs()
        .context("query output configs")?
        .map(|range| {
            let rate = preferred
                .sample_rate
                .clamp(range.min_sample_rate(), range.max_sample_rate().max(range.min_sample_rate()));
            let score = ConfigScore::new(preferred, rate, range.channels(), range.sample_format());
            (score, range.with_sample_rate(rate))
        })
        .min_by_key(|(score, _)| *score)
        .map(|(_, config)| config)
        .ok_or_else(|| anyhow!("device has no output configs"))
}

/// A fixed callback size when the device advertises a range; `None` keeps the host default.
pub fn fixed_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(MAX_BUFFER_FRAMES.clamp(*min, (*max).max(*min))))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub default: bool,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
}

/// Output devices of the default host. Devices without any usable config are skipped.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| device_name(&d).ok());
    let mut out = Vec::new();
    for device in host.output_devices().context("enumerate output devices")? {
        let name = device_name(&device)?;
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map(|r| r.collect())
            .unwrap_or_default();
        let info = if ranges.is_empty() {
            match device.default_output_config() {
                Ok(cfg) => DeviceInfo {
                    default: false,
                    name,
                    min_rate: cfg.sample_rate(),
                    max_rate: cfg.sample_rate(),
                    max_channels: cfg.channels(),
                },
                Err(e) => {
                    tracing::warn!(device = %name, error = %e, "skipping device without usable config");
                    continue;
                }
            }
        } else {
            DeviceInfo {
                default: false,
                name,
                min_rate: ranges.iter().map(|r| r.min_sample_rate()).min().unwrap_or(0),
                max_rate: ranges.iter().map(|r| r.max_sample_rate()).max().unwrap_or(0),
                max_channels: ranges.iter().map(|r| r.channels()).max().unwrap_or(0),
            }
        };
        out.push(DeviceInfo {
            default: default_name.as_deref() == Some(info.name.as_str()),
            ..info
        });
    }
    Ok(out)
}

fn device_name(device: &cpal::Device) -> Result<String> {
    Ok(device.description()?.to_string())
}

/// Lower is better. Field order is the ranking: channel layout, exact rate, rates at or
/// above the preferred one, distance, sample format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ConfigScore {
    channel_mismatch: bool,
    inexact_rate: bool,
    below_preferred: bool,
    rate_distance: u32,
    format_rank: u8,
}

impl ConfigScore {
    fn new(preferred: OutputFormat, rate: u32, channels: u16, format: cpal::SampleFormat) -> Self {
        Self {
            channel_mismatch: channels != preferred.channels,
            inexact_rate: rate != preferred.sample_rate,
            below_preferred: rate < preferred.sample_rate,
            rate_distance: rate.abs_diff(preferred.sample_rate),
            format_rank: match format {
                cpal::SampleFormat::F32 => 0,
                cpal::SampleFormat::I32 => 1,
                cpal::SampleFormat::I16 => 2,
                cpal::SampleFormat::U16 => 3,
                _ => u8::MAX,
            },
        }
    }
}
