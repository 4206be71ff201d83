//! Incremental decode stage.
//!
//! The worker calls [`Decoder::decode_once`] in a loop. Each call either hands out one chunk
//! of output-format PCM, reports that the bytes it needs next are not downloaded yet, reports
//! the end of input, or fails. It never blocks on the network beyond the reader's short wait
//! slices, so the worker stays responsive to commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{SeekMode, SeekTo};
use symphonia::core::units::Time;

use crate::config::StreamerConfig;
use crate::error::{Result, StreamerError};
use crate::item::PlaybackItem;
use crate::output::OutputFormat;
use crate::pcm::{PcmQueue, remap_channels};
use crate::provider::FileProvider;
use crate::resample::StreamResampler;

/// Consecutive undecodable packets tolerated before giving up.
const MAX_CONSECUTIVE_DECODE_ERRORS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    Uninitialized,
    Ready,
    Waiting,
    EndOfStream,
    Failed,
}

/// Outcome of one [`Decoder::decode_once`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderStatus {
    Succeeded,
    Failed,
    EndEncountered,
    Waiting,
}

/// Interleaved `f32` PCM in the output format.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedChunk {
    pub samples: Vec<f32>,
    pub frames: usize,
}

enum Step {
    Decoded,
    End,
    Wait,
}

enum PacketOutcome {
    Decoded { frames: usize, channels: usize },
    Skipped(&'static str),
    Reset,
    Fatal(StreamerError),
}

pub struct Decoder {
    item: PlaybackItem,
    provider: Weak<FileProvider>,
    cancel: Arc<AtomicBool>,
    output: OutputFormat,
    chunk_frames: usize,
    read_ahead: u64,
    state: DecoderState,
    codec: Option<Box<dyn CodecDecoder>>,
    resampler: Option<StreamResampler>,
    pcm: PcmQueue,
    mapped: Vec<f32>,
    resampled: Vec<f32>,
    sample_buf: Option<SampleBuffer<f32>>,
    chunk: Option<DecodedChunk>,
    pending_seek: Option<u64>,
    seek_result: Option<u64>,
    input_done: bool,
    decode_errors: usize,
    failure: Option<StreamerError>,
    /// Raised after the decoded tail in front of it has been delivered.
    deferred_failure: Option<StreamerError>,
}

impl Decoder {
    pub fn new(
        provider: Weak<FileProvider>,
        cancel: Arc<AtomicBool>,
        extension: Option<String>,
        output: OutputFormat,
        config: &StreamerConfig,
    ) -> Self {
        let item = PlaybackItem::new(
            provider.clone(),
            cancel.clone(),
            extension,
            config.header_probe_bytes,
            config.wait_slice(),
        );
        Self {
            item,
            provider,
            cancel,
            output,
            chunk_frames: config.decode_chunk_frames.max(1),
            read_ahead: config.read_ahead(),
            state: DecoderState::Uninitialized,
            codec: None,
            resampler: None,
            pcm: PcmQueue::new(output.channels as usize),
            mapped: Vec::new(),
            resampled: Vec::new(),
            sample_buf: None,
            chunk: None,
            pending_seek: None,
            seek_result: None,
            input_done: false,
            decode_errors: 0,
            failure: None,
            deferred_failure: None,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn item(&self) -> &PlaybackItem {
        &self.item
    }

    pub fn failure(&self) -> Option<&StreamerError> {
        self.failure.as_ref()
    }

    /// All input has been decoded (undelivered chunks may remain).
    pub fn input_exhausted(&self) -> bool {
        self.input_done
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output
    }

    /// Open the item and build codec and resampler. Blocks (cancellably) until the header
    /// prefix is cached.
    pub fn set_up(&mut self) -> Result<()> {
        match self.state {
            DecoderState::Uninitialized => {}
            DecoderState::Failed => {
                return Err(self
                    .failure
                    .clone()
                    .unwrap_or_else(|| StreamerError::decoding("decoder failed")));
            }
            _ => return Ok(()),
        }
        if let Err(e) = self.build() {
            self.state = DecoderState::Failed;
            self.failure = Some(e.clone());
            return Err(e);
        }
        self.state = DecoderState::Ready;
        Ok(())
    }

    fn build(&mut self) -> Result<()> {
        self.item.open()?;
        let params = self
            .item
            .codec_params()
            .cloned()
            .ok_or_else(|| StreamerError::decoding("missing codec parameters"))?;
        self.codec = Some(self.make_codec()?);

        let src_rate = params.sample_rate.unwrap_or(self.output.sample_rate);
        if src_rate != self.output.sample_rate {
            let resampler = StreamResampler::new(
                src_rate,
                self.output.sample_rate,
                self.output.channels as usize,
                self.chunk_frames,
            )
            .map_err(|e| StreamerError::decoding(format!("{e:#}")))?;
            self.resampler = Some(resampler);
        }
        tracing::info!(
            src_rate,
            dst_rate = self.output.sample_rate,
            channels = self.output.channels,
            resampling = self.resampler.is_some(),
            "decoder ready"
        );
        Ok(())
    }

    fn make_codec(&self) -> Result<Box<dyn CodecDecoder>> {
        let params = self
            .item
            .codec_params()
            .ok_or_else(|| StreamerError::decoding("missing codec parameters"))?;
        symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| StreamerError::decoding(format!("codec: {e}")))
    }

    /// Produce at most one chunk.
    pub fn decode_once(&mut self) -> DecoderStatus {
        match self.state {
            DecoderState::Failed => return DecoderStatus::Failed,
            DecoderState::EndOfStream if self.pending_seek.is_none() => {
                return DecoderStatus::EndEncountered;
            }
            DecoderState::Uninitialized => match self.item.header_ready() {
                Ok(false) => return DecoderStatus::Waiting,
                Ok(true) => {
                    if self.set_up().is_err() {
                        return DecoderStatus::Failed;
                    }
                }
                Err(e) => return self.fail(e),
            },
            _ => {}
        }
        if let Some(err) = self.deferred_failure.take() {
            return self.fail(err);
        }

        if let Some(target_ms) = self.pending_seek {
            match self.apply_seek(target_ms) {
                Ok(true) => {}
                Ok(false) => return self.waiting(),
                Err(e) => return self.fail(e),
            }
        }

        loop {
            if let Some(samples) = self.pcm.take_chunk(self.chunk_frames) {
                return self.deliver(samples);
            }
            if self.input_done {
                if let Some(samples) = self.pcm.take_rest() {
                    return self.deliver(samples);
                }
                self.state = DecoderState::EndOfStream;
                return DecoderStatus::EndEncountered;
            }
            let Some(provider) = self.provider.upgrade() else {
                return self.fail(StreamerError::network("file provider released"));
            };
            if !provider.is_finished() && !provider.is_failed() {
                let mut need = self.item.reader_position() + self.read_ahead;
                if let Some(len) = provider.expected_length() {
                    need = need.min(len);
                }
                if provider.bytes_available(need) < need {
                    return self.waiting();
                }
            }
            match self.decode_packet(&provider) {
                Ok(Step::Decoded) => {}
                Ok(Step::End) => {
                    if let Some(r) = self.resampler.as_mut() {
                        self.resampled.clear();
                        if let Err(e) = r.flush(&mut self.resampled) {
                            return self.fail(StreamerError::decoding(format!("{e:#}")));
                        }
                        self.pcm.extend(&self.resampled);
                    }
                    tracing::debug!(frames = self.pcm.frames(), "decoder reached end of input");
                    self.input_done = true;
                }
                Ok(Step::Wait) => return self.waiting(),
                Err(e) => return self.fail_after_flush(e),
            }
        }
    }

    fn decode_packet(&mut self, provider: &FileProvider) -> Result<Step> {
        let track_id = self.item.track_id();
        let Some(format) = self.item.format_mut() else {
            return Err(StreamerError::decoding("playback item not open"));
        };
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) => {
                if self.cancel.load(Ordering::Relaxed) {
                    return Ok(Step::Wait);
                }
                if let Some(reason) = provider.failure() {
                    return Err(StreamerError::network(reason));
                }
                if e.kind() == std::io::ErrorKind::UnexpectedEof || provider.is_finished() {
                    return Ok(Step::End);
                }
                return Err(StreamerError::network(e));
            }
            Err(SymphoniaError::ResetRequired) => {
                self.codec = Some(self.make_codec()?);
                return Ok(Step::Decoded);
            }
            Err(e) => {
                if let Some(reason) = provider.failure() {
                    return Err(StreamerError::network(reason));
                }
                return Err(StreamerError::decoding(e));
            }
        };
        if packet.track_id() != track_id {
            return Ok(Step::Decoded);
        }

        let Some(codec) = self.codec.as_mut() else {
            return Err(StreamerError::decoding("codec not initialised"));
        };
        let mut sample_buf = self.sample_buf.take();
        let outcome = match codec.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let frames = decoded.frames();
                let needs_new = sample_buf
                    .as_ref()
                    .is_none_or(|b| b.capacity() < decoded.capacity());
                if needs_new {
                    sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                }
                PacketOutcome::Decoded {
                    frames,
                    channels: spec.channels.count(),
                }
            }
            Err(SymphoniaError::DecodeError(msg)) => PacketOutcome::Skipped(msg),
            Err(SymphoniaError::ResetRequired) => PacketOutcome::Reset,
            Err(e) => PacketOutcome::Fatal(StreamerError::decoding(e)),
        };

        let src_channels = match outcome {
            PacketOutcome::Decoded { frames, channels } => {
                self.decode_errors = 0;
                self.item.note_packet(packet.buf().len(), frames);
                channels
            }
            PacketOutcome::Skipped(msg) => {
                self.sample_buf = sample_buf;
                self.decode_errors += 1;
                tracing::warn!(errors = self.decode_errors, "skipping undecodable packet: {msg}");
                if self.decode_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                    return Err(StreamerError::decoding(format!("too many decode errors: {msg}")));
                }
                return Ok(Step::Decoded);
            }
            PacketOutcome::Reset => {
                self.sample_buf = sample_buf;
                self.codec = Some(self.make_codec()?);
                return Ok(Step::Decoded);
            }
            PacketOutcome::Fatal(e) => {
                self.sample_buf = sample_buf;
                return Err(e);
            }
        };

        if let Some(buf) = sample_buf.as_ref() {
            self.route(buf.samples(), src_channels)?;
        }
        self.sample_buf = sample_buf;
        Ok(Step::Decoded)
    }

    /// Channel-map and resample one decoded packet into the PCM queue.
    fn route(&mut self, samples: &[f32], src_channels: usize) -> Result<()> {
        remap_channels(samples, src_channels, self.output.channels as usize, &mut self.mapped);
        match self.resampler.as_mut() {
            Some(r) => {
                self.resampled.clear();
                r.process(&self.mapped, &mut self.resampled)
                    .map_err(|e| StreamerError::decoding(format!("{e:#}")))?;
                self.pcm.extend(&self.resampled);
            }
            None => self.pcm.extend(&self.mapped),
        }
        Ok(())
    }

    fn deliver(&mut self, samples: Vec<f32>) -> DecoderStatus {
        let frames = samples.len() / self.output.channels.max(1) as usize;
        self.chunk = Some(DecodedChunk { samples, frames });
        self.state = DecoderState::Ready;
        DecoderStatus::Succeeded
    }

    fn waiting(&mut self) -> DecoderStatus {
        if self.state != DecoderState::Uninitialized {
            self.state = DecoderState::Waiting;
        }
        DecoderStatus::Waiting
    }

    /// Hand out PCM shorter than a chunk before failing; the error follows on the next call.
    fn fail_after_flush(&mut self, err: StreamerError) -> DecoderStatus {
        match self.pcm.take_rest() {
            Some(samples) => {
                tracing::debug!(
                    frames = samples.len() / self.output.channels.max(1) as usize,
                    "delivering decoded tail before failing"
                );
                self.deferred_failure = Some(err);
                self.deliver(samples)
            }
            None => self.fail(err),
        }
    }

    fn fail(&mut self, err: StreamerError) -> DecoderStatus {
        tracing::warn!(kind = ?err.kind(), "decoder failed: {err}");
        self.state = DecoderState::Failed;
        self.failure = Some(err);
        DecoderStatus::Failed
    }

    /// Move the chunk produced by the last successful [`Decoder::decode_once`] out.
    pub fn take_chunk(&mut self) -> Option<DecodedChunk> {
        self.chunk.take()
    }

    /// Discard undelivered PCM and reposition on the next [`Decoder::decode_once`].
    pub fn seek(&mut self, ms: u64) {
        if self.state == DecoderState::Failed {
            return;
        }
        self.pcm.clear();
        self.chunk = None;
        self.pending_seek = Some(ms);
    }

    /// Position (ms) actually reached by the last completed seek.
    pub fn take_seek_result(&mut self) -> Option<u64> {
        self.seek_result.take()
    }

    /// Returns `Ok(false)` while the target bytes are not cached yet.
    fn apply_seek(&mut self, ms: u64) -> Result<bool> {
        let Some(provider) = self.provider.upgrade() else {
            return Err(StreamerError::network("file provider released"));
        };
        let target = self.item.offset_for_time(ms);
        if !provider.is_finished() && !provider.is_failed() {
            let mut need = target + self.read_ahead;
            if let Some(len) = provider.expected_length() {
                need = need.min(len);
            }
            if provider.bytes_available(need) < need {
                return Ok(false);
            }
        }

        let time_base = self.item.codec_params().and_then(|p| p.time_base);
        let sample_rate = self.item.info().map(|i| i.sample_rate).unwrap_or(1);
        let Some(format) = self.item.format_mut() else {
            return Err(StreamerError::decoding("playback item not open"));
        };
        let time = Time::new(ms / 1000, (ms % 1000) as f64 / 1000.0);
        let reached = match format.seek(SeekMode::Coarse, SeekTo::Time { time, track_id: None }) {
            Ok(seeked) => {
                let reached = match time_base {
                    Some(tb) => {
                        let t = tb.calc_time(seeked.actual_ts);
                        t.seconds * 1000 + (t.frac * 1000.0) as u64
                    }
                    None => seeked.actual_ts * 1000 / u64::from(sample_rate.max(1)),
                };
                self.input_done = false;
                reached
            }
            Err(SymphoniaError::SeekError(kind)) => {
                tracing::warn!(ms, "seek out of range ({kind:?}); treating as end of input");
                self.input_done = true;
                ms
            }
            Err(SymphoniaError::IoError(e)) if self.cancel.load(Ordering::Relaxed) => {
                tracing::debug!("seek interrupted: {e}");
                return Ok(false);
            }
            Err(e) => {
                if let Some(reason) = provider.failure() {
                    return Err(StreamerError::network(reason));
                }
                return Err(StreamerError::decoding(format!("seek: {e}")));
            }
        };

        if let Some(codec) = self.codec.as_mut() {
            codec.reset();
        }
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
        self.pcm.clear();
        self.chunk = None;
        self.decode_errors = 0;
        self.pending_seek = None;
        self.seek_result = Some(reached);
        self.state = DecoderState::Ready;
        tracing::info!(requested_ms = ms, reached_ms = reached, "decoder seeked");
        Ok(true)
    }

    /// Release codec, resampler and container reader. Safe to call repeatedly.
    pub fn tear_down(&mut self) {
        self.codec = None;
        self.resampler = None;
        self.sample_buf = None;
        self.chunk = None;
        self.pcm.clear();
        self.item.close();
        if self.state != DecoderState::Failed {
            self.state = DecoderState::Uninitialized;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::{completed_provider, growing_provider, wav_bytes};

    fn decoder_for(
        provider: &Arc<FileProvider>,
        output: OutputFormat,
        chunk_frames: usize,
    ) -> Decoder {
        let mut config = StreamerConfig::default();
        config.decode_chunk_frames = chunk_frames;
        config.header_probe_bytes = 1_024;
        Decoder::new(
            Arc::downgrade(provider),
            Arc::new(AtomicBool::new(false)),
            Some("wav".into()),
            output,
            &config,
        )
    }

    /// Run `f` on its own thread; a decoder stuck on missing bytes fails the test instead of
    /// hanging it.
    fn within_deadline<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        match rx.recv_timeout(Duration::from_secs(20)) {
            Ok(value) => value,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                panic!("decoder blocked on bytes that were never going to arrive")
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                std::panic::resume_unwind(handle.join().unwrap_err())
            }
        }
    }

    fn drain(decoder: &mut Decoder) -> (Vec<usize>, DecoderStatus) {
        let mut sizes = Vec::new();
        loop {
            match decoder.decode_once() {
                DecoderStatus::Succeeded => sizes.push(decoder.take_chunk().unwrap().frames),
                other => return (sizes, other),
            }
        }
    }

    #[test]
    fn chunks_are_fixed_size_except_the_last() {
        let (_dir, provider) = completed_provider(wav_bytes(8_000, 2, 5_000), "wav");
        let mut decoder = decoder_for(&provider, OutputFormat::new(8_000, 2), 1_024);
        let (sizes, status) = drain(&mut decoder);
        assert_eq!(status, DecoderStatus::EndEncountered);
        assert_eq!(sizes.iter().sum::<usize>(), 5_000);
        let (last, full) = sizes.split_last().unwrap();
        assert!(full.iter().all(|f| *f == 1_024));
        assert_eq!(*last, 5_000 - 4 * 1_024);
        assert_eq!(decoder.state(), DecoderState::EndOfStream);
        assert_eq!(decoder.decode_once(), DecoderStatus::EndEncountered);
    }

    #[test]
    fn mono_source_is_mapped_to_stereo_output() {
        let (_dir, provider) = completed_provider(wav_bytes(8_000, 1, 2_048), "wav");
        let mut decoder = decoder_for(&provider, OutputFormat::new(8_000, 2), 2_048);
        assert_eq!(decoder.decode_once(), DecoderStatus::Succeeded);
        let chunk = decoder.take_chunk().unwrap();
        assert_eq!(chunk.frames, 2_048);
        assert_eq!(chunk.samples.len(), 4_096);
        assert_eq!(chunk.samples[2], chunk.samples[3]);
    }

    #[test]
    fn resamples_to_the_output_rate() {
        let (_dir, provider) = completed_provider(wav_bytes(22_050, 2, 22_050), "wav");
        let mut decoder = decoder_for(&provider, OutputFormat::new(44_100, 2), 1_024);
        let (sizes, status) = drain(&mut decoder);
        assert_eq!(status, DecoderStatus::EndEncountered);
        let total: usize = sizes.iter().sum();
        assert!(total > 40_000 && total < 48_000, "total {total}");
    }

    #[test]
    fn seek_reports_reached_position() {
        let (_dir, provider) = completed_provider(wav_bytes(8_000, 1, 16_000), "wav");
        let mut decoder = decoder_for(&provider, OutputFormat::new(8_000, 1), 800);
        assert_eq!(decoder.decode_once(), DecoderStatus::Succeeded);
        decoder.take_chunk();
        decoder.seek(1_500);
        let (sizes, status) = drain(&mut decoder);
        assert_eq!(status, DecoderStatus::EndEncountered);
        let reached = decoder.take_seek_result().unwrap();
        assert!((1_000..=1_500).contains(&reached), "reached {reached}");
        let remaining: usize = sizes.iter().sum();
        let expected = 16_000 - reached as usize * 8;
        assert!(remaining.abs_diff(expected) <= 16, "remaining {remaining} expected {expected}");
    }

    #[test]
    fn waits_at_the_download_frontier_then_resumes() {
        // 10 s of 8 kHz mono, 70 kB of 160 kB downloaded
        let (_dir, provider) = growing_provider(wav_bytes(8_000, 1, 80_000), "wav", 70_000);
        let (before, after, status) = within_deadline(move || {
            let mut config = StreamerConfig::default();
            config.decode_chunk_frames = 1_024;
            config.read_ahead_bytes = 1_024;
            let mut decoder = Decoder::new(
                Arc::downgrade(&provider),
                Arc::new(AtomicBool::new(false)),
                Some("wav".into()),
                OutputFormat::new(8_000, 1),
                &config,
            );
            let (before, status) = drain(&mut decoder);
            assert_eq!(status, DecoderStatus::Waiting);
            assert_eq!(decoder.state(), DecoderState::Waiting);
            assert_eq!(decoder.decode_once(), DecoderStatus::Waiting);

            provider.on_data(160_044 - 70_000);
            provider.on_finished(None);
            let (after, status) = drain(&mut decoder);
            (before, after, status)
        });
        let before: usize = before.iter().sum();
        assert!(before > 0 && before < 35_000, "decoded {before} frames from 35 000 available");
        assert_eq!(status, DecoderStatus::EndEncountered);
        assert_eq!(before + after.iter().sum::<usize>(), 80_000);
    }

    #[test]
    fn seek_past_the_frontier_waits_then_lands_on_target() {
        let (_dir, provider) = growing_provider(wav_bytes(8_000, 1, 80_000), "wav", 70_000);
        let (reached, remaining, status) = within_deadline(move || {
            let mut decoder = decoder_for(&provider, OutputFormat::new(8_000, 1), 800);
            decoder.seek(8_000);
            assert_eq!(decoder.decode_once(), DecoderStatus::Waiting);
            assert_eq!(decoder.decode_once(), DecoderStatus::Waiting);
            assert_eq!(decoder.take_seek_result(), None);
            assert!(decoder.take_chunk().is_none());

            provider.on_data(160_044 - 70_000);
            provider.on_finished(None);
            let (sizes, status) = drain(&mut decoder);
            let reached = decoder.take_seek_result();
            (reached, sizes.iter().sum::<usize>(), status)
        });
        assert_eq!(status, DecoderStatus::EndEncountered);
        let reached = reached.expect("seek completed");
        assert!((7_000..=8_000).contains(&reached), "reached {reached}");
        let expected = 80_000 - reached as usize * 8;
        assert!(remaining.abs_diff(expected) <= 16, "remaining {remaining} expected {expected}");
    }

    #[test]
    fn failed_download_delivers_the_decoded_tail_before_failing() {
        // 12 345 of 20 000 frames arrive; one chunk would hold the whole file
        let received = 44 + 12_345 * 2;
        let (_dir, provider) = growing_provider(wav_bytes(8_000, 1, 20_000), "wav", received);
        let (tail, after_tail, kind) = within_deadline(move || {
            let mut decoder = decoder_for(&provider, OutputFormat::new(8_000, 1), 20_000);
            assert_eq!(decoder.decode_once(), DecoderStatus::Waiting);

            provider.on_failed("connection reset".into());
            assert_eq!(decoder.decode_once(), DecoderStatus::Succeeded);
            let tail = decoder.take_chunk().map(|c| c.frames);
            let after_tail = decoder.decode_once();
            (tail, after_tail, decoder.failure().map(|e| e.kind()))
        });
        let tail = tail.expect("tail chunk");
        assert!((10_000..=12_345).contains(&tail), "tail {tail}");
        assert_eq!(after_tail, DecoderStatus::Failed);
        assert_eq!(kind, Some(ErrorKind::NetworkError));
    }

    #[test]
    fn tear_down_is_idempotent() {
        let (_dir, provider) = completed_provider(wav_bytes(8_000, 1, 1_000), "wav");
        let mut decoder = decoder_for(&provider, OutputFormat::new(8_000, 1), 256);
        decoder.set_up().unwrap();
        decoder.tear_down();
        decoder.tear_down();
        assert_eq!(decoder.state(), DecoderState::Uninitialized);
    }

    #[test]
    fn undecodable_input_fails_with_decoding_error() {
        let (_dir, provider) = completed_provider(vec![0x33; 8_192], "wav");
        let mut decoder = decoder_for(&provider, OutputFormat::new(8_000, 1), 256);
        assert_eq!(decoder.decode_once(), DecoderStatus::Failed);
        assert_eq!(
            decoder.failure().map(|e| e.kind()),
            Some(crate::error::ErrorKind::DecodingError)
        );
    }
}
