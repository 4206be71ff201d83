//! Playback state shared between the worker and the public handle.
//!
//! The worker is the only writer. Readers on any thread load atomics; the single public error
//! and the subscriber list sit behind mutexes that are never held across I/O.

use std::sync::atomic::{self, AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use crate::error::StreamerError;
use crate::renderer::RenderCounters;

const UNKNOWN_DURATION: u64 = u64::MAX;

/// Externally visible playback state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StreamerStatus {
    Idle = 0,
    Buffering = 1,
    Playing = 2,
    Paused = 3,
    Finished = 4,
    Error = 5,
}

impl StreamerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamerStatus::Buffering,
            2 => StreamerStatus::Playing,
            3 => StreamerStatus::Paused,
            4 => StreamerStatus::Finished,
            5 => StreamerStatus::Error,
            _ => StreamerStatus::Idle,
        }
    }
}

/// Notifications delivered to [`crate::AudioStreamer::subscribe`] receivers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamerEvent {
    StatusChanged { status: StreamerStatus },
    DurationChanged { duration_ms: u64 },
    Progress { received: u64, expected: Option<u64> },
    Error { error: StreamerError },
}

/// Point-in-time view of a streamer, suitable for logging or an API response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub url: String,
    pub status: StreamerStatus,
    pub error: Option<StreamerError>,
    pub current_time_ms: u64,
    pub duration_ms: Option<u64>,
    pub buffering_ratio: f32,
    pub paused_by_interruption: bool,
    pub volume: f32,
    pub expected_length: Option<u64>,
    pub received_length: u64,
    /// Bytes per second over the rolling window.
    pub download_speed: u64,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub underrun_frames: u64,
    pub underrun_events: u64,
}

pub(crate) struct SharedStatus {
    state: AtomicU8,
    ratio: AtomicU32,
    duration_ms: AtomicU64,
    timing_offset_ms: AtomicU64,
    /// Odd while the clock base is being rewritten.
    clock_seq: AtomicU64,
    output_rate: AtomicU32,
    output_channels: AtomicU32,
    paused_by_interruption: AtomicBool,
    counters: RenderCounters,
    error: Mutex<Option<StreamerError>>,
    subscribers: Mutex<Vec<Sender<StreamerEvent>>>,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(StreamerStatus::Idle as u8),
            ratio: AtomicU32::new(0f32.to_bits()),
            duration_ms: AtomicU64::new(UNKNOWN_DURATION),
            timing_offset_ms: AtomicU64::new(0),
            clock_seq: AtomicU64::new(0),
            output_rate: AtomicU32::new(0),
            output_channels: AtomicU32::new(0),
            paused_by_interruption: AtomicBool::new(false),
            counters: RenderCounters::default(),
            error: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl SharedStatus {
    pub(crate) fn status(&self) -> StreamerStatus {
        StreamerStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `false` (and changes nothing) once the state is `Error`.
    pub(crate) fn set_status(&self, status: StreamerStatus) -> bool {
        let prev = self.status();
        if prev == StreamerStatus::Error {
            return false;
        }
        if prev != status {
            self.state.store(status as u8, Ordering::Release);
            tracing::info!(from = ?prev, to = ?status, "streamer status changed");
            self.emit(StreamerEvent::StatusChanged { status });
        }
        true
    }

    /// Record the terminal failure. Only the first error is kept.
    pub(crate) fn fail(&self, err: StreamerError) {
        if self.status() == StreamerStatus::Error {
            return;
        }
        {
            let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(err.clone());
            }
        }
        tracing::error!(kind = ?err.kind(), "playback failed: {err}");
        self.emit(StreamerEvent::Error { error: err });
        self.set_status(StreamerStatus::Error);
    }

    pub(crate) fn error(&self) -> Option<StreamerError> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn buffering_ratio(&self) -> f32 {
        f32::from_bits(self.ratio.load(Ordering::Relaxed))
    }

    pub(crate) fn set_buffering_ratio(&self, ratio: f32) {
        let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        self.ratio.store(ratio.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn duration_ms(&self) -> Option<u64> {
        match self.duration_ms.load(Ordering::Relaxed) {
            UNKNOWN_DURATION => None,
            ms => Some(ms),
        }
    }

    pub(crate) fn set_duration_ms(&self, ms: u64) {
        let prev = self.duration_ms.swap(ms, Ordering::Relaxed);
        if prev != ms {
            tracing::debug!(duration_ms = ms, "duration revised");
            self.emit(StreamerEvent::DurationChanged { duration_ms: ms });
        }
    }

    /// Base added to the renderer's drained-frame clock (the position of the last seek).
    pub(crate) fn set_timing_offset_ms(&self, ms: u64) {
        self.write_clock(|| self.timing_offset_ms.store(ms, Ordering::Relaxed));
    }

    /// Move the clock to `ms` and zero the drained-frame counter. Readers see either the old
    /// clock or the new one, never the base of one with the frames of the other.
    pub(crate) fn rebase_clock(&self, ms: u64) {
        self.write_clock(|| {
            self.counters.played_frames.store(0, Ordering::Relaxed);
            self.timing_offset_ms.store(ms, Ordering::Relaxed);
        });
    }

    fn write_clock(&self, update: impl FnOnce()) {
        self.clock_seq.fetch_add(1, Ordering::Relaxed);
        atomic::fence(Ordering::Release);
        update();
        self.clock_seq.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn set_output_format(&self, sample_rate: u32, channels: u16) {
        self.output_rate.store(sample_rate, Ordering::Relaxed);
        self.output_channels
            .store(u32::from(channels), Ordering::Relaxed);
    }

    pub(crate) fn output_format(&self) -> Option<(u32, u16)> {
        match self.output_rate.load(Ordering::Relaxed) {
            0 => None,
            rate => Some((rate, self.output_channels.load(Ordering::Relaxed) as u16)),
        }
    }

    pub(crate) fn current_time_ms(&self) -> u64 {
        let (offset, frames) = loop {
            let seq = self.clock_seq.load(Ordering::Acquire);
            if seq % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let offset = self.timing_offset_ms.load(Ordering::Relaxed);
            let frames = self.counters.played_frames.load(Ordering::Relaxed);
            atomic::fence(Ordering::Acquire);
            if self.clock_seq.load(Ordering::Relaxed) == seq {
                break (offset, frames);
            }
        };
        let played = match self.output_rate.load(Ordering::Relaxed) {
            0 => 0,
            rate => frames.saturating_mul(1000) / u64::from(rate),
        };
        offset.saturating_add(played)
    }

    pub(crate) fn paused_by_interruption(&self) -> bool {
        self.paused_by_interruption.load(Ordering::Relaxed)
    }

    pub(crate) fn set_paused_by_interruption(&self, paused: bool) {
        self.paused_by_interruption.store(paused, Ordering::Relaxed);
    }

    pub(crate) fn counters(&self) -> &RenderCounters {
        &self.counters
    }

    pub(crate) fn subscribe(&self) -> Receiver<StreamerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: StreamerEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_terminal_and_first_error_wins() {
        let status = SharedStatus::default();
        let events = status.subscribe();
        assert!(status.set_status(StreamerStatus::Buffering));
        status.fail(StreamerError::Network("gone".into()));
        status.fail(StreamerError::Decoding("late".into()));
        assert!(!status.set_status(StreamerStatus::Playing));
        assert_eq!(status.status(), StreamerStatus::Error);
        assert_eq!(status.error(), Some(StreamerError::Network("gone".into())));

        let seen: Vec<StreamerEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                StreamerEvent::StatusChanged {
                    status: StreamerStatus::Buffering
                },
                StreamerEvent::Error {
                    error: StreamerError::Network("gone".into())
                },
                StreamerEvent::StatusChanged {
                    status: StreamerStatus::Error
                },
            ]
        );
    }

    #[test]
    fn current_time_adds_seek_base_to_drained_frames() {
        let status = SharedStatus::default();
        assert_eq!(status.current_time_ms(), 0);
        status.set_output_format(48_000, 2);
        status.set_timing_offset_ms(10_000);
        status
            .counters()
            .played_frames
            .store(96_000, Ordering::Relaxed);
        assert_eq!(status.current_time_ms(), 12_000);
    }

    #[test]
    fn rebasing_never_shows_a_torn_clock() {
        let status = std::sync::Arc::new(SharedStatus::default());
        status.set_output_format(8_000, 1);
        let done = std::sync::Arc::new(AtomicBool::new(false));

        let reader = {
            let status = status.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                while !done.load(Ordering::Relaxed) {
                    let now = status.current_time_ms();
                    assert!(now >= last, "clock went back from {last} to {now}");
                    last = now;
                }
            })
        };
        // each seek lands further ahead; the frames drained after it never reach the next one
        for k in 1..=5_000u64 {
            status.rebase_clock(k * 10_000);
            status
                .counters()
                .played_frames
                .store(k * 8, Ordering::Relaxed);
        }
        done.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        assert_eq!(status.current_time_ms(), 50_000_000 + 5);
    }

    #[test]
    fn ratio_is_clamped() {
        let status = SharedStatus::default();
        status.set_buffering_ratio(1.7);
        assert_eq!(status.buffering_ratio(), 1.0);
        status.set_buffering_ratio(-0.2);
        assert_eq!(status.buffering_ratio(), 0.0);
        status.set_buffering_ratio(f32::NAN);
        assert_eq!(status.buffering_ratio(), 0.0);
    }

    #[test]
    fn duration_changes_are_announced_once() {
        let status = SharedStatus::default();
        let events = status.subscribe();
        assert_eq!(status.duration_ms(), None);
        status.set_duration_ms(5_000);
        status.set_duration_ms(5_000);
        assert_eq!(status.duration_ms(), Some(5_000));
        assert_eq!(events.try_iter().count(), 1);
    }

    #[test]
    fn snapshot_serializes_with_snake_case_status() {
        let snap = StatusSnapshot {
            url: "http://host/a.mp3".into(),
            status: StreamerStatus::Buffering,
            error: None,
            current_time_ms: 0,
            duration_ms: None,
            buffering_ratio: 0.25,
            paused_by_interruption: false,
            volume: 1.0,
            expected_length: Some(10),
            received_length: 5,
            download_speed: 0,
            sample_rate: None,
            channels: None,
            underrun_frames: 0,
            underrun_events: 0,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "buffering");
        assert_eq!(json["received_length"], 5);
    }
}
