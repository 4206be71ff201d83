//! Interleaved `f32` helpers shared by the decode stage.

/// Map interleaved frames from `src_channels` to `dst_channels` into `out` (cleared first).
///
/// Mapping rules:
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - same layout: pass-through
/// - other layouts: clamp to the available channels
pub(crate) fn remap_channels(src: &[f32], src_channels: usize, dst_channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if src_channels == 0 || dst_channels == 0 {
        return;
    }
    if src_channels == dst_channels {
        out.extend_from_slice(src);
        return;
    }
    let frames = src.len() / src_channels;
    out.reserve(frames * dst_channels);
    for frame in src.chunks_exact(src_channels) {
        for ch in 0..dst_channels {
            let sample = match (src_channels, dst_channels) {
                (2, 1) => 0.5 * (frame[0] + frame[1]),
                (1, _) => frame[0],
                _ => frame[ch.min(src_channels - 1)],
            };
            out.push(sample);
        }
    }
}

/// FIFO of interleaved samples cut into fixed-size chunks.
#[derive(Debug)]
pub(crate) struct PcmQueue {
    channels: usize,
    samples: Vec<f32>,
}

impl PcmQueue {
    pub(crate) fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            samples: Vec::new(),
        }
    }

    pub(crate) fn extend(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    pub(crate) fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Exactly `frames` frames, or `None` while fewer are queued.
    pub(crate) fn take_chunk(&mut self, frames: usize) -> Option<Vec<f32>> {
        if frames == 0 || self.frames() < frames {
            return None;
        }
        Some(self.samples.drain(..frames * self.channels).collect())
    }

    /// Whatever whole frames remain.
    pub(crate) fn take_rest(&mut self) -> Option<Vec<f32>> {
        let whole = self.frames() * self.channels;
        self.samples.truncate(whole);
        if whole == 0 {
            return None;
        }
        Some(std::mem::take(&mut self.samples))
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
    }
}
