//! Fixed-capacity SPSC sample ring between the worker and the real-time callback.
//!
//! The producer half stays with the worker. The consumer half sits behind a mutex that the
//! callback only ever `try_lock`s, so the worker can flush without racing a concurrent drain.

use std::sync::{Mutex, TryLockError};

use rtrb::{Consumer, Producer, RingBuffer};

/// Producer half, owned by the worker.
pub(crate) struct RingWriter {
    producer: Producer<f32>,
    channels: usize,
    capacity: usize,
}

/// Consumer half shared with the render callback.
pub(crate) struct RingReader {
    consumer: Mutex<Consumer<f32>>,
    channels: usize,
}

pub(crate) fn ring(capacity_frames: usize, channels: usize) -> (RingWriter, RingReader) {
    let channels = channels.max(1);
    let capacity = capacity_frames.max(1) * channels;
    let (producer, consumer) = RingBuffer::<f32>::new(capacity);
    (
        RingWriter {
            producer,
            channels,
            capacity,
        },
        RingReader {
            consumer: Mutex::new(consumer),
            channels,
        },
    )
}

impl RingWriter {
    /// Append whole frames from `samples`; returns how many samples were taken.
    pub(crate) fn write(&mut self, samples: &[f32]) -> usize {
        let free = self.producer.slots().min(samples.len());
        let n = free - free % self.channels;
        if n == 0 {
            return 0;
        }
        match self.producer.write_chunk(n) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&samples[..split]);
                second.copy_from_slice(&samples[split..n]);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    pub(crate) fn buffered_samples(&self) -> usize {
        self.capacity - self.producer.slots()
    }

    pub(crate) fn capacity_samples(&self) -> usize {
        self.capacity
    }
}

impl RingReader {
    /// Drain up to `out.len()` samples (whole frames) into `out`. Never blocks: contention or
    /// a poisoned lock reads as empty. Returns the number of samples written.
    pub(crate) fn read_into(&self, out: &mut [f32]) -> usize {
        let mut consumer = match self.consumer.try_lock() {
            Ok(c) => c,
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => return 0,
        };
        let available = consumer.slots().min(out.len());
        let n = available - available % self.channels;
        if n == 0 {
            return 0;
        }
        match consumer.read_chunk(n) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..n].copy_from_slice(second);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    /// Discard everything buffered. Blocks until the callback is out of its drain.
    pub(crate) fn clear(&self) -> usize {
        let mut consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let n = consumer.slots();
        if let Ok(chunk) = consumer.read_chunk(n) {
            chunk.commit_all();
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_fifo_order_across_wraparound() {
        let (mut w, r) = ring(4, 2);
        let mut produced = 0f32;
        let mut consumed = Vec::new();
        for _ in 0..10 {
            let batch: Vec<f32> = (0..6).map(|i| produced + i as f32).collect();
            let n = w.write(&batch);
            produced += n as f32;
            let mut out = [0.0f32; 4];
            let got = r.read_into(&mut out);
            consumed.extend_from_slice(&out[..got]);
        }
        let mut rest = [0.0f32; 8];
        let got = r.read_into(&mut rest);
        consumed.extend_from_slice(&rest[..got]);
        let expected: Vec<f32> = (0..produced as usize).map(|i| i as f32).collect();
        assert_eq!(consumed, expected);
    }

    #[test]
    fn short_count_when_full_and_never_exceeds_capacity() {
        let (mut w, _r) = ring(3, 2);
        assert_eq!(w.write(&[1.0; 4]), 4);
        assert_eq!(w.write(&[1.0; 4]), 2);
        assert_eq!(w.write(&[1.0; 4]), 0);
        assert_eq!(w.buffered_samples(), w.capacity_samples());
    }

    #[test]
    fn only_whole_frames_are_moved() {
        let (mut w, r) = ring(8, 2);
        assert_eq!(w.write(&[0.5; 5]), 4);
        let mut out = [9.0f32; 3];
        assert_eq!(r.read_into(&mut out), 2);
    }

    #[test]
    fn clear_discards_and_read_never_sees_unwritten_data() {
        let (mut w, r) = ring(8, 1);
        w.write(&[1.0, 2.0, 3.0]);
        assert_eq!(r.clear(), 3);
        let mut out = [0.0f32; 4];
        assert_eq!(r.read_into(&mut out), 0);
        assert_eq!(w.buffered_samples(), 0);
    }
}
