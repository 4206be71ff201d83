//! Sample-rate conversion between the source and the negotiated output rate.
//!
//! Wraps Rubato's asynchronous sinc resampler with fixed-size input chunks. Input arrives in
//! arbitrary packet-sized pieces, so samples are staged until a full chunk is available; the
//! tail is pushed through as a partial chunk at end of stream.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

pub(crate) struct StreamResampler {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub(crate) fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(anyhow!("invalid resampler shape {src_rate} -> {dst_rate} x{channels}"));
        }
        let ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init: {e}"))?;

        let out_frames = (chunk_frames as f64 * ratio * 1.1).ceil() as usize + 16;
        tracing::debug!(src_rate, dst_rate, channels, chunk_frames, "resampler ready");
        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels * 2),
            out: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Stage `input` and append every completed chunk's output to `dst`.
    pub(crate) fn process(&mut self, input: &[f32], dst: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = self.pending[consumed..consumed + chunk_samples].to_vec();
            self.run(&chunk, self.chunk_frames, None, dst)?;
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Push the staged tail through as a partial chunk.
    pub(crate) fn flush(&mut self, dst: &mut Vec<f32>) -> Result<()> {
        let frames = self.pending.len() / self.channels;
        if frames == 0 {
            self.pending.clear();
            return Ok(());
        }
        let mut tail = std::mem::take(&mut self.pending);
        tail.resize(self.chunk_frames * self.channels, 0.0);
        self.run(&tail, self.chunk_frames, Some(frames), dst)
    }

    /// Forget staged input and filter history (after a seek).
    pub(crate) fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
    }

    fn run(
        &mut self,
        input: &[f32],
        frames: usize,
        partial_len: Option<usize>,
        dst: &mut Vec<f32>,
    ) -> Result<()> {
        let input_adapter = InterleavedSlice::new(input, self.channels, frames)
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
        let out_capacity_frames = self.out.len() / self.channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out, self.channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process: {e}"))?;
        dst.extend_from_slice(&self.out[..nbr_out * self.channels]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsampling_roughly_scales_frame_count() {
        let mut r = StreamResampler::new(22_050, 44_100, 2, 512).unwrap();
        let input = vec![0.25f32; 22_050 * 2];
        let mut out = Vec::new();
        r.process(&input, &mut out).unwrap();
        r.flush(&mut out).unwrap();
        let frames = out.len() / 2;
        assert!(frames > 40_000 && frames < 48_000, "frames {frames}");
    }

    #[test]
    fn reset_drops_staged_input() {
        let mut r = StreamResampler::new(48_000, 44_100, 1, 256).unwrap();
        let mut out = Vec::new();
        r.process(&[0.1; 100], &mut out).unwrap();
        assert!(out.is_empty());
        r.reset();
        r.flush(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn rejects_zero_rates() {
        assert!(StreamResampler::new(0, 44_100, 2, 256).is_err());
    }
}
