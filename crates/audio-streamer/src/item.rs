//! Container-level view of the asset being played.
//!
//! Probes the cached bytes through Symphonia, records the source format and the byte offset of
//! the audio payload, and maps between playback time and byte offsets for seeking and
//! duration estimates.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, CodecType};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Result, StreamerError};
use crate::header;
use crate::provider::{FileProvider, ProviderReader};

/// Bit rate assumed before anything better is known.
const FALLBACK_BIT_RATE: u64 = 128_000;

/// Source format resolved by [`PlaybackItem::open`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ItemInfo {
    pub sample_rate: u32,
    pub channels: usize,
    pub bits_per_sample: Option<u32>,
    pub codec: Option<String>,
    pub total_frames: Option<u64>,
    pub data_offset: u64,
    /// Bit rate is an estimate that may drift as packets are observed.
    pub vbr: bool,
}

/// Parsed container over a [`FileProvider`].
pub struct PlaybackItem {
    provider: Weak<FileProvider>,
    cancel: Arc<AtomicBool>,
    extension: Option<String>,
    header_probe_bytes: u64,
    wait_slice: Duration,
    format: Option<Box<dyn FormatReader>>,
    track_id: u32,
    codec_params: Option<CodecParameters>,
    position: Arc<AtomicU64>,
    info: Option<ItemInfo>,
    packet_bytes: u64,
    packet_frames: u64,
}

impl PlaybackItem {
    pub fn new(
        provider: Weak<FileProvider>,
        cancel: Arc<AtomicBool>,
        extension: Option<String>,
        header_probe_bytes: u64,
        wait_slice: Duration,
    ) -> Self {
        Self {
            provider,
            cancel,
            extension,
            header_probe_bytes: header_probe_bytes.max(1),
            wait_slice,
            format: None,
            track_id: 0,
            codec_params: None,
            position: Arc::new(AtomicU64::new(0)),
            info: None,
            packet_bytes: 0,
            packet_frames: 0,
        }
    }

    fn provider(&self) -> Result<Arc<FileProvider>> {
        self.provider
            .upgrade()
            .ok_or_else(|| StreamerError::network("file provider released"))
    }

    /// Wait for the header prefix, then probe the container.
    pub fn open(&mut self) -> Result<()> {
        if self.format.is_some() {
            return Ok(());
        }
        let provider = self.provider()?;
        let prefix_len = self.wait_for_prefix(&provider)?;

        let prefix = read_prefix(&provider, prefix_len)
            .map_err(|e| StreamerError::cache(format!("read header: {e}")))?;
        let data_offset = header::data_offset(&prefix);

        let reader = ProviderReader::open(&provider, self.cancel.clone(), self.wait_slice)
            .map_err(|e| StreamerError::cache(format!("open {:?}: {e}", provider.cached_path())))?;
        self.position = reader.position_handle();
        let mss = MediaSourceStream::new(Box::new(reader), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = &self.extension {
            hint.with_extension(ext);
        }
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| match provider.failure() {
                Some(reason) => StreamerError::network(reason),
                None => StreamerError::decoding(format!("probe: {e}")),
            })?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| StreamerError::decoding("no audio track"))?;
        let params = track.codec_params.clone();
        let sample_rate = params
            .sample_rate
            .filter(|r| *r > 0)
            .ok_or_else(|| StreamerError::decoding("unknown sample rate"))?;
        let channels = params
            .channels
            .map(|c| c.count())
            .filter(|c| *c > 0)
            .ok_or_else(|| StreamerError::decoding("unknown channel layout"))?;

        let info = ItemInfo {
            sample_rate,
            channels,
            bits_per_sample: params.bits_per_sample.or(params.bits_per_coded_sample),
            codec: codec_name_from_params(&params),
            total_frames: params.n_frames,
            data_offset,
            vbr: !is_pcm(params.codec),
        };
        tracing::info!(
            codec = info.codec.as_deref().unwrap_or("unknown"),
            sample_rate,
            channels,
            data_offset,
            total_frames = ?info.total_frames,
            "playback item opened"
        );

        self.track_id = track.id;
        self.codec_params = Some(params);
        self.info = Some(info);
        self.format = Some(format);
        Ok(())
    }

    /// Block until `header_probe_bytes` (or the whole asset, if shorter) are cached.
    fn wait_for_prefix(&self, provider: &FileProvider) -> Result<u64> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(StreamerError::network("playback cancelled"));
            }
            let target = provider
                .expected_length()
                .map_or(self.header_probe_bytes, |e| e.min(self.header_probe_bytes));
            let available = provider.bytes_available(target);
            if available >= target || provider.is_finished() {
                return Ok(available);
            }
            if let Some(reason) = provider.failure() {
                return Err(StreamerError::network(reason));
            }
            provider.wait_for_bytes(target, self.wait_slice);
        }
    }

    /// Non-blocking: whether [`PlaybackItem::open`] would find its header prefix cached.
    pub fn header_ready(&self) -> Result<bool> {
        let provider = self.provider()?;
        let target = provider
            .expected_length()
            .map_or(self.header_probe_bytes, |e| e.min(self.header_probe_bytes));
        if provider.bytes_available(target) >= target || provider.is_finished() {
            return Ok(true);
        }
        match provider.failure() {
            Some(reason) => Err(StreamerError::network(reason)),
            None => Ok(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.format.is_some()
    }

    pub fn info(&self) -> Option<&ItemInfo> {
        self.info.as_ref()
    }

    pub(crate) fn codec_params(&self) -> Option<&CodecParameters> {
        self.codec_params.as_ref()
    }

    pub(crate) fn track_id(&self) -> u32 {
        self.track_id
    }

    pub(crate) fn format_mut(&mut self) -> Option<&mut Box<dyn FormatReader>> {
        self.format.as_mut()
    }

    /// Byte offset the container reader has consumed up to.
    pub fn reader_position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    /// Feed the running bit-rate average.
    pub(crate) fn note_packet(&mut self, bytes: usize, frames: usize) {
        self.packet_bytes += bytes as u64;
        self.packet_frames += frames as u64;
    }

    /// Bits per second of the audio payload; `None` before [`PlaybackItem::open`].
    pub fn bit_rate(&self) -> Option<u64> {
        let info = self.info.as_ref()?;
        let rate = u64::from(info.sample_rate);
        if !info.vbr {
            if let Some(bits) = info.bits_per_sample {
                return Some(rate * info.channels as u64 * u64::from(bits));
            }
        }
        let expected = self.provider.upgrade().and_then(|p| p.expected_length());
        if let (Some(frames), Some(len)) = (info.total_frames.filter(|f| *f > 0), expected) {
            let payload = len.saturating_sub(info.data_offset);
            return Some((u128::from(payload) * 8 * u128::from(rate) / u128::from(frames)) as u64);
        }
        if self.packet_frames > 0 {
            return Some(self.packet_bytes * 8 * rate / self.packet_frames);
        }
        Some(FALLBACK_BIT_RATE)
    }

    /// Duration from the container's frame count, or from the current expected length and
    /// bit rate.
    pub fn estimated_duration_ms(&self) -> Option<u64> {
        let info = self.info.as_ref()?;
        if let Some(frames) = info.total_frames {
            return Some(frames.saturating_mul(1000) / u64::from(info.sample_rate));
        }
        let expected = self.provider.upgrade()?.expected_length()?;
        let bit_rate = self.bit_rate()?.max(1);
        let payload = expected.saturating_sub(info.data_offset);
        Some((u128::from(payload) * 8000 / u128::from(bit_rate)) as u64)
    }

    /// Approximate byte offset of playback time `ms`, clamped to the expected length.
    pub fn offset_for_time(&self, ms: u64) -> u64 {
        let Some(info) = self.info.as_ref() else {
            return 0;
        };
        let bit_rate = self.bit_rate().unwrap_or(FALLBACK_BIT_RATE);
        let offset = info.data_offset + (u128::from(ms) * u128::from(bit_rate) / 8000) as u64;
        match self.provider.upgrade().and_then(|p| p.expected_length()) {
            Some(len) => offset.min(len),
            None => offset,
        }
    }

    /// Drop the format reader. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.format.take().is_some() {
            tracing::debug!("playback item closed");
        }
    }
}

fn read_prefix(provider: &FileProvider, len: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len as usize);
    File::open(provider.cached_path())?
        .take(len)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

fn is_pcm(codec: CodecType) -> bool {
    use symphonia::core::codecs::*;
    matches!(
        codec,
        CODEC_TYPE_PCM_S8
            | CODEC_TYPE_PCM_U8
            | CODEC_TYPE_PCM_S16LE
            | CODEC_TYPE_PCM_S16BE
            | CODEC_TYPE_PCM_S24LE
            | CODEC_TYPE_PCM_S24BE
            | CODEC_TYPE_PCM_S32LE
            | CODEC_TYPE_PCM_S32BE
            | CODEC_TYPE_PCM_F32LE
            | CODEC_TYPE_PCM_F32BE
            | CODEC_TYPE_PCM_F64LE
            | CODEC_TYPE_PCM_F64BE
    )
}

/// Best-effort codec label used for status payloads.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{completed_provider, wav_bytes};

    fn open_item(bytes: Vec<u8>) -> (tempfile::TempDir, Arc<FileProvider>, PlaybackItem) {
        let (dir, provider) = completed_provider(bytes, "wav");
        let mut item = PlaybackItem::new(
            Arc::downgrade(&provider),
            Arc::new(AtomicBool::new(false)),
            Some("wav".into()),
            64 * 1024,
            Duration::from_millis(10),
        );
        item.open().unwrap();
        (dir, provider, item)
    }

    #[test]
    fn wav_item_reports_exact_pcm_figures() {
        let (_dir, _provider, item) = open_item(wav_bytes(44_100, 2, 44_100));
        let info = item.info().unwrap();
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.data_offset, 44);
        assert_eq!(info.codec.as_deref(), Some("PCM_S16"));
        assert!(!info.vbr);
        assert_eq!(item.bit_rate(), Some(44_100 * 2 * 16));
        assert_eq!(item.estimated_duration_ms(), Some(1000));
    }

    #[test]
    fn offset_for_time_is_linear_and_clamped() {
        let (_dir, _provider, item) = open_item(wav_bytes(8_000, 1, 8_000));
        assert_eq!(item.offset_for_time(0), 44);
        assert_eq!(item.offset_for_time(500), 44 + 8_000);
        assert_eq!(item.offset_for_time(60_000), 44 + 16_000);
    }

    #[test]
    fn garbage_is_a_decoding_error() {
        let (_dir, provider) = completed_provider(vec![0x5a; 4096], "bin");
        let mut item = PlaybackItem::new(
            Arc::downgrade(&provider),
            Arc::new(AtomicBool::new(false)),
            None,
            1024,
            Duration::from_millis(10),
        );
        let err = item.open().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DecodingError);
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, _provider, mut item) = open_item(wav_bytes(8_000, 1, 800));
        item.close();
        item.close();
        assert!(!item.is_open());
    }

    #[test]
    fn codec_name_maps_known_codecs() {
        use symphonia::core::codecs::*;
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("FLAC".to_string()));
        params.codec = CODEC_TYPE_NULL;
        assert!(codec_name_from_params(&params).is_none());
    }
}
