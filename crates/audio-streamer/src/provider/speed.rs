use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling download rate over a fixed time window.
///
/// The rate is the byte count inside the window divided by the window length, or by the time
/// since the first sample while the transfer is younger than the window.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    started: Option<Instant>,
    samples: VecDeque<(Instant, u64)>,
    rate: u64,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            started: None,
            samples: VecDeque::new(),
            rate: 0,
        }
    }

    /// Mark the start of the transfer (response headers received).
    pub fn start(&mut self, now: Instant) {
        self.started = Some(now);
        self.samples.clear();
        self.rate = 0;
    }

    /// Record `bytes` arriving at `now`; returns the updated rate in bytes per second.
    pub fn record(&mut self, now: Instant, bytes: u64) -> u64 {
        let started = *self.started.get_or_insert(now);
        self.samples.push_back((now, bytes));
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let total: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        let span = now.saturating_duration_since(started).min(self.window);
        let micros = span.as_micros();
        self.rate = if micros == 0 {
            0
        } else {
            (u128::from(total) * 1_000_000 / micros) as u64
        };
        self.rate
    }

    /// Last computed rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }
}
