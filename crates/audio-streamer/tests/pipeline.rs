mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use audio_streamer::analyzer::Analyzer;
use audio_streamer::transport::memory::MemoryAsset;
use audio_streamer::{AudioStreamer, AudioSource, ErrorKind, OutputFormat, StreamerEvent, StreamerStatus};

use common::{Harness, wav_ms};

fn streamer(h: &Harness, url: &str) -> AudioStreamer {
    AudioStreamer::new(AudioSource::remote(url), &h.ctx).unwrap()
}

struct SampleCounter(Arc<AtomicU64>);

impl Analyzer for SampleCounter {
    fn process(&mut self, samples: &[f32], _format: OutputFormat) -> anyhow::Result<()> {
        self.0.fetch_add(samples.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn buffers_then_plays_to_the_end() {
    let h = Harness::new();
    let url = h.serve(
        "two-seconds",
        MemoryAsset::new(wav_ms(2_000))
            .chunk_bytes(4_096)
            .chunk_delay(Duration::from_millis(5)),
    );
    let analyzed = Arc::new(AtomicU64::new(0));
    h.ctx
        .settings
        .analyzers()
        .add(Box::new(SampleCounter(analyzed.clone())));

    let s = streamer(&h, &url);
    let events = s.subscribe();
    assert_eq!(s.status(), StreamerStatus::Idle);
    s.play();

    assert!(h.pump_until(|| s.status() == StreamerStatus::Finished));
    assert!(s.current_time_ms().abs_diff(2_000) <= 5, "{}", s.current_time_ms());
    assert_eq!(s.duration_ms(), Some(2_000));
    assert_eq!(s.buffering_ratio(), 1.0);
    assert_eq!(s.received_length(), s.expected_length().unwrap());
    assert!(s.error().is_none());

    let statuses: Vec<StreamerStatus> = events
        .try_iter()
        .filter_map(|e| match e {
            StreamerEvent::StatusChanged { status } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.first(), Some(&StreamerStatus::Buffering));
    assert!(statuses.contains(&StreamerStatus::Playing));
    assert_eq!(statuses.last(), Some(&StreamerStatus::Finished));

    assert!(common::wait_until(Duration::from_secs(5), || {
        analyzed.load(Ordering::Relaxed) >= 15 * 1_024
    }));

    // play after the end starts over
    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
    assert!(s.current_time_ms() < 1_000, "{}", s.current_time_ms());
}

#[test]
fn stays_buffering_while_bytes_are_missing() {
    let h = Harness::with_config(|c| c.buffer_time_ms = 2_000);
    let (asset, gate) = MemoryAsset::new(wav_ms(4_000)).chunk_bytes(4_096).gated();
    let url = h.serve("gated", asset);
    gate.release(1);

    let s = streamer(&h, &url);
    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Buffering));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(s.status(), StreamerStatus::Buffering);
    let ratio = s.buffering_ratio();
    assert!(ratio > 0.0 && ratio < 1.0, "ratio {ratio}");
    assert!(h.output.pull(64).is_none(), "output must stay paused while buffering");

    drop(gate);
    assert!(h.pump_until(|| s.status() == StreamerStatus::Playing));
    assert!(h.pump_until(|| s.status() == StreamerStatus::Finished));
}

#[test]
fn download_failure_surfaces_as_network_error_after_playing_what_arrived() {
    let h = Harness::new();
    let url = h.serve(
        "truncated",
        MemoryAsset::new(wav_ms(60_000))
            .chunk_bytes(16 * 1_024)
            .fail_after(300_000),
    );
    let s = streamer(&h, &url);
    let events = s.subscribe();
    s.play();

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while s.status() != StreamerStatus::Error && std::time::Instant::now() < deadline {
        h.output.pull(2_000);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(s.status(), StreamerStatus::Error);
    assert_eq!(s.error().map(|e| e.kind()), Some(ErrorKind::NetworkError));
    // 300 kB of 8 kHz mono 16-bit audio is about 18.7 s, all of it played before the error
    assert!(s.current_time_ms() > 18_000, "{}", s.current_time_ms());
    assert!(s.current_time_ms() <= 18_750, "{}", s.current_time_ms());
    assert!(
        events
            .try_iter()
            .any(|e| matches!(e, StreamerEvent::Error { .. }))
    );

    // terminal: controls are ignored
    s.play();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(s.status(), StreamerStatus::Error);
}

#[test]
fn interruption_pauses_and_resumes_without_play() {
    let h = Harness::new();
    let url = h.serve("interrupted", MemoryAsset::new(wav_ms(6_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Playing && s.current_time_ms() > 500));

    s.begin_interruption();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Paused));
    assert!(s.is_paused_by_interruption());
    let paused_at = s.current_time_ms();
    assert!(h.output.pull(160).is_none());
    thread::sleep(Duration::from_millis(30));
    assert_eq!(s.current_time_ms(), paused_at);

    s.end_interruption();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
    assert!(!s.is_paused_by_interruption());
    assert!(s.current_time_ms() >= paused_at);
    assert!(h.pump_until(|| s.current_time_ms() > paused_at + 200));
}

#[test]
fn device_interruption_events_drive_the_same_transitions() {
    let h = Harness::new();
    let url = h.serve("device", MemoryAsset::new(wav_ms(6_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Playing));

    h.output.interrupt();
    assert!(h.wait_until(|| s.is_paused_by_interruption()));
    assert_eq!(s.status(), StreamerStatus::Paused);
    h.output.end_interruption();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
}

#[test]
fn user_pause_during_interruption_is_not_auto_resumed() {
    let h = Harness::new();
    let url = h.serve("paused", MemoryAsset::new(wav_ms(6_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Playing));

    s.begin_interruption();
    assert!(h.wait_until(|| s.is_paused_by_interruption()));
    s.pause();
    assert!(h.wait_until(|| !s.is_paused_by_interruption()));
    s.end_interruption();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(s.status(), StreamerStatus::Paused);

    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
}

#[test]
fn seek_rebases_the_clock_near_the_target() {
    let h = Harness::new();
    let url = h.serve("seekable", MemoryAsset::new(wav_ms(10_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Playing && s.current_time_ms() > 300));

    s.seek(6_000);
    assert!(h.wait_until(|| {
        s.status() == StreamerStatus::Playing && (5_700..=6_000).contains(&s.current_time_ms())
    }));
    let reached = s.current_time_ms();
    assert!(h.pump_until(|| s.current_time_ms() >= reached + 100));
    assert!(s.current_time_ms() < 8_000);
}

#[test]
fn seek_while_idle_sets_the_start_position() {
    let h = Harness::new();
    let url = h.serve("start-late", MemoryAsset::new(wav_ms(5_000)));
    let s = streamer(&h, &url);
    s.seek(3_000);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(s.status(), StreamerStatus::Idle);
    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
    assert!((2_700..=3_000).contains(&s.current_time_ms()), "{}", s.current_time_ms());
    assert!(h.pump_until(|| s.status() == StreamerStatus::Finished));
    assert!(s.current_time_ms().abs_diff(5_000) <= 5);
}

#[test]
fn stop_returns_to_idle_and_restarts_from_zero() {
    let h = Harness::new();
    let url = h.serve("stoppable", MemoryAsset::new(wav_ms(6_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.current_time_ms() > 400));

    s.stop();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Idle));
    assert_eq!(s.current_time_ms(), 0);
    assert_eq!(s.buffering_ratio(), 0.0);
    assert!(!h.output.is_open(), "stop keeps the output stream open");
    s.stop();

    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
    assert!(h.output.is_open());
    assert!(s.current_time_ms() < 400);
    assert!(h.pump_until(|| s.current_time_ms() > 400));
}

fn status_changes(events: &crossbeam_channel::Receiver<StreamerEvent>) -> Vec<StreamerStatus> {
    events
        .try_iter()
        .filter_map(|e| match e {
            StreamerEvent::StatusChanged { status } => Some(status),
            _ => None,
        })
        .collect()
}

#[test]
fn interruption_after_finishing_does_not_silence_the_replay() {
    let h = Harness::new();
    let url = h.serve("replayed", MemoryAsset::new(wav_ms(1_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Finished));

    let events = s.subscribe();
    h.output.interrupt();
    s.play();
    h.output.end_interruption();

    let mut seen = Vec::new();
    let replayed = h.pump_until(|| {
        seen.extend(status_changes(&events));
        seen.contains(&StreamerStatus::Buffering) && seen.last() == Some(&StreamerStatus::Finished)
    });
    assert!(replayed, "replay stalled after {seen:?} at {} ms", s.current_time_ms());
    assert!(s.current_time_ms().abs_diff(1_000) <= 5);
    assert!(!s.is_paused_by_interruption());
}

#[test]
fn interruption_left_over_from_pause_is_cleared_by_play() {
    let h = Harness::new();
    let url = h.serve("paused-then-cut", MemoryAsset::new(wav_ms(2_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Playing && s.current_time_ms() > 200));
    s.pause();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Paused));

    // arrives while the user pause holds, so nothing is flagged
    h.output.interrupt();
    thread::sleep(Duration::from_millis(30));
    assert!(!s.is_paused_by_interruption());

    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
    assert!(h.output.is_playing());
    assert!(h.pump_until(|| s.status() == StreamerStatus::Finished));
}

#[test]
fn seek_into_an_interrupted_output_waits_for_the_device() {
    let h = Harness::new();
    let url = h.serve("seek-cut", MemoryAsset::new(wav_ms(1_000)));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Finished));

    h.output.interrupt();
    s.seek(0);
    assert!(h.wait_until(|| s.status() == StreamerStatus::Paused && s.is_paused_by_interruption()));
    assert!(!h.output.is_playing());

    h.output.end_interruption();
    assert!(h.pump_until(|| s.status() == StreamerStatus::Finished));
    assert!(s.current_time_ms().abs_diff(1_000) <= 5);
}

#[test]
fn volume_scales_rendered_samples() {
    let h = Harness::new();
    let url = h.serve("quiet", MemoryAsset::new(wav_ms(3_000)));
    let s = streamer(&h, &url);
    s.set_volume(0.5);
    assert_eq!(s.volume(), 0.5);
    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Playing));
    let samples = h.output.pull(400).unwrap();
    let peak = samples.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    // full-scale peak of the fixture is 15000 / 32768
    assert!(peak > 0.2 && peak < 0.25, "peak {peak}");
}

#[test]
fn missing_asset_is_a_network_error() {
    let h = Harness::new();
    let s = streamer(&h, "http://test.invalid/nowhere.mp3");
    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Error));
    assert_eq!(s.error().map(|e| e.kind()), Some(ErrorKind::NetworkError));
}

#[test]
fn undecodable_asset_is_a_decoding_error() {
    let h = Harness::new();
    let url = h.serve("noise", MemoryAsset::new(vec![0x42; 20_000]));
    let s = streamer(&h, &url);
    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Error));
    assert_eq!(s.error().map(|e| e.kind()), Some(ErrorKind::DecodingError));
}

#[test]
fn stall_timeout_escalates_to_network_error() {
    let h = Harness::with_config(|c| c.stall_timeout_ms = Some(150));
    let (asset, gate) = MemoryAsset::new(wav_ms(4_000)).chunk_bytes(4_096).gated();
    let url = h.serve("stalled", asset);
    gate.release(1);
    let s = streamer(&h, &url);
    s.play();
    assert!(h.wait_until(|| s.status() == StreamerStatus::Error));
    assert_eq!(s.error().map(|e| e.kind()), Some(ErrorKind::NetworkError));
    drop(gate);
}

#[test]
fn dropping_the_streamer_removes_its_download() {
    let h = Harness::new();
    let url = h.serve("ephemeral", MemoryAsset::new(wav_ms(1_000)));
    let s = streamer(&h, &url);
    assert!(h.wait_until(|| s.expected_length() == Some(s.received_length())));
    let path = s.cached_path().unwrap();
    assert!(path.exists());
    drop(s);
    assert!(!path.exists());
    assert!(h.ctx.cache.entry(&url).is_none());
}

#[test]
fn managed_cache_keeps_downloads_after_drop() {
    let h = Harness::with_config(|c| c.cache.max_files = Some(4));
    let url = h.serve("kept", MemoryAsset::new(wav_ms(1_000)));
    let s = streamer(&h, &url);
    assert!(h.wait_until(|| s.expected_length() == Some(s.received_length())));
    let path = s.cached_path().unwrap();
    drop(s);
    assert!(path.exists());
    assert!(h.ctx.cache.entry(&url).is_some_and(|e| e.finished));

    // a second streamer plays the cached copy without another request
    let before = h.transport.requests().len();
    let again = streamer(&h, &url);
    again.play();
    assert!(h.pump_until(|| again.status() == StreamerStatus::Finished));
    assert_eq!(h.transport.requests().len(), before);
}
