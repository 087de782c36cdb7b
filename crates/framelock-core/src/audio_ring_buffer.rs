//! Lock-free SPSC sample ring between the audio reader and a device callback.
//!
//! Only the producer moves `write_pos`, only the consumer moves `read_pos`.
//! Flush and skip are requests: the producer raises them, the consumer applies
//! them on its next read, so neither side ever touches the other's cursor.
//!
//! The consumer counts every sample slot it hands to the device, including
//! silence on underrun. That count is the clock of a device-backed sink.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sizing of an [`audio_ring_buffer`].
#[derive(Debug, Clone)]
pub struct RingBufferConfig {
    /// Total capacity in interleaved samples (rounded up to a power of two)
    pub capacity_samples: usize,
    /// Samples that must be queued before the consumer starts, and again
    /// after each flush
    pub prefill_samples: usize,
}

impl RingBufferConfig {
    /// Capacity for `ahead` worth of audio, with a 50ms prefill.
    pub fn for_format(sample_rate: u32, channels: u16, ahead: std::time::Duration) -> Self {
        let per_second = sample_rate as usize * channels as usize;
        Self {
            capacity_samples: (per_second as f64 * ahead.as_secs_f64()) as usize,
            prefill_samples: per_second / 20,
        }
    }
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self::for_format(48000, 2, std::time::Duration::from_secs(2))
    }
}

struct RingBufferShared {
    /// f32 samples stored as bits
    buffer: Box<[AtomicU32]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    mask: usize,
    capacity: usize,
    prefilled: AtomicBool,
    prefill_threshold: usize,
    /// Samples the consumer still has to drop without playing
    discard: AtomicUsize,
    flush_generation: AtomicU64,
    /// Slots handed to the device while running, silence included
    played: AtomicU64,
    overflow_count: AtomicU64,
    underrun_count: AtomicU64,
    alive: AtomicBool,
}

/// What the consumer produced for one output slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadSample {
    Sample(f32),
    /// A flush was applied; the queue is now empty
    Flushed,
    /// Prefilling or underrun; output silence
    Empty,
}

/// Producer half, owned by the sink.
pub struct RingBufferProducer {
    shared: Arc<RingBufferShared>,
}

/// Consumer half, owned by the device callback.
pub struct RingBufferConsumer {
    shared: Arc<RingBufferShared>,
    consumer_generation: u64,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingBufferMetrics {
    pub fill_samples: usize,
    pub capacity_samples: usize,
    pub played_samples: u64,
    pub overflow_count: u64,
    pub underrun_count: u64,
    pub producer_alive: bool,
}

/// Creates a ring split into its producer and consumer halves.
pub fn audio_ring_buffer(config: RingBufferConfig) -> (RingBufferProducer, RingBufferConsumer) {
    let capacity = config.capacity_samples.max(1024).next_power_of_two();
    let shared = Arc::new(RingBufferShared {
        buffer: (0..capacity)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
        mask: capacity - 1,
        capacity,
        prefilled: AtomicBool::new(false),
        prefill_threshold: config.prefill_samples.min(capacity / 2),
        discard: AtomicUsize::new(0),
        flush_generation: AtomicU64::new(0),
        played: AtomicU64::new(0),
        overflow_count: AtomicU64::new(0),
        underrun_count: AtomicU64::new(0),
        alive: AtomicBool::new(true),
    });
    (
        RingBufferProducer {
            shared: Arc::clone(&shared),
        },
        RingBufferConsumer {
            shared,
            consumer_generation: 0,
        },
    )
}

impl RingBufferShared {
    fn fill(&self) -> usize {
        let wp = self.write_pos.load(Ordering::Acquire);
        let rp = self.read_pos.load(Ordering::Acquire);
        wp.wrapping_sub(rp).min(self.capacity)
    }

    fn metrics(&self) -> RingBufferMetrics {
        RingBufferMetrics {
            fill_samples: self.fill(),
            capacity_samples: self.capacity,
            played_samples: self.played.load(Ordering::Acquire),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            producer_alive: self.alive.load(Ordering::Relaxed),
        }
    }
}

impl RingBufferProducer {
    /// Appends samples. Never blocks: on overflow the oldest samples are
    /// overwritten and the consumer catches up.
    pub fn write(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let s = &self.shared;
        let wp = s.write_pos.load(Ordering::Relaxed);
        let rp = s.read_pos.load(Ordering::Acquire);
        if wp.wrapping_add(samples.len()).wrapping_sub(rp) > s.capacity {
            s.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut idx = wp & s.mask;
        for &sample in samples {
            s.buffer[idx].store(sample.to_bits(), Ordering::Relaxed);
            idx = (idx + 1) & s.mask;
        }
        s.write_pos
            .store(wp.wrapping_add(samples.len()), Ordering::Release);

        if !s.prefilled.load(Ordering::Relaxed) && s.fill() >= s.prefill_threshold {
            s.prefilled.store(true, Ordering::Release);
            tracing::trace!("Audio ring prefilled with {} samples", s.fill());
        }
    }

    /// Drops everything queued and cancels pending skips. Playback waits for
    /// a new prefill.
    pub fn request_flush(&self) {
        let s = &self.shared;
        s.discard.store(0, Ordering::Relaxed);
        s.prefilled.store(false, Ordering::Relaxed);
        s.flush_generation.fetch_add(1, Ordering::Release);
    }

    /// Has the consumer drop the next `samples` samples unplayed, including
    /// ones not written yet.
    pub fn request_discard(&self, samples: usize) {
        self.shared.discard.fetch_add(samples, Ordering::AcqRel);
    }

    /// Queued samples.
    pub fn fill(&self) -> usize {
        self.shared.fill()
    }

    /// Output slots consumed so far, silence included.
    pub fn played(&self) -> u64 {
        self.shared.played.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> RingBufferMetrics {
        self.shared.metrics()
    }
}

impl Drop for RingBufferProducer {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
    }
}

impl RingBufferConsumer {
    /// Produces the next output sample and advances the played count.
    pub fn read_sample(&mut self) -> ReadSample {
        let s = &self.shared;
        s.played.fetch_add(1, Ordering::AcqRel);

        let generation = s.flush_generation.load(Ordering::Acquire);
        if generation != self.consumer_generation {
            self.consumer_generation = generation;
            let wp = s.write_pos.load(Ordering::Acquire);
            s.read_pos.store(wp, Ordering::Release);
            return ReadSample::Flushed;
        }

        let mut rp = s.read_pos.load(Ordering::Relaxed);
        let wp = s.write_pos.load(Ordering::Acquire);
        if wp.wrapping_sub(rp) > s.capacity {
            rp = wp.wrapping_sub(s.capacity / 2);
        }

        let discard = s.discard.load(Ordering::Acquire);
        if discard > 0 {
            let dropped = discard.min(wp.wrapping_sub(rp));
            if dropped > 0 {
                rp = rp.wrapping_add(dropped);
                s.discard.fetch_sub(dropped, Ordering::AcqRel);
            }
        }
        s.read_pos.store(rp, Ordering::Release);

        if !s.prefilled.load(Ordering::Acquire) {
            return ReadSample::Empty;
        }
        if rp == wp {
            s.underrun_count.fetch_add(1, Ordering::Relaxed);
            return ReadSample::Empty;
        }

        let sample = f32::from_bits(s.buffer[rp & s.mask].load(Ordering::Relaxed));
        s.read_pos.store(rp.wrapping_add(1), Ordering::Release);
        ReadSample::Sample(sample)
    }

    pub fn is_producer_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> RingBufferMetrics {
        self.shared.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(prefill: usize) -> (RingBufferProducer, RingBufferConsumer) {
        audio_ring_buffer(RingBufferConfig {
            capacity_samples: 1024,
            prefill_samples: prefill,
        })
    }

    #[test]
    fn test_basic_write_read() {
        let (producer, mut consumer) = ring(4);
        producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        for expected in [1.0, 2.0, 3.0, 4.0, 5.0] {
            assert_eq!(consumer.read_sample(), ReadSample::Sample(expected));
        }
        assert_eq!(consumer.read_sample(), ReadSample::Empty);

        // no re-prefill after an underrun
        producer.write(&[6.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Sample(6.0));
    }

    #[test]
    fn test_prefill_gates_start() {
        let (producer, mut consumer) = ring(10);
        producer.write(&[1.0, 2.0, 3.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Empty);
        producer.write(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Sample(1.0));
    }

    #[test]
    fn test_played_counts_silence() {
        let (producer, mut consumer) = ring(2);
        for _ in 0..5 {
            assert_eq!(consumer.read_sample(), ReadSample::Empty);
        }
        producer.write(&[1.0, 2.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Sample(1.0));
        assert_eq!(producer.played(), 6);
    }

    #[test]
    fn test_flush_discards_queue_and_resets_prefill() {
        let (producer, mut consumer) = ring(4);
        producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Sample(1.0));

        producer.request_flush();
        producer.request_flush();
        assert_eq!(consumer.read_sample(), ReadSample::Flushed);
        assert_eq!(consumer.read_sample(), ReadSample::Empty);

        producer.write(&[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Sample(10.0));
    }

    #[test]
    fn test_discard_spans_queued_and_future_samples() {
        let (producer, mut consumer) = ring(1);
        producer.write(&[1.0, 2.0, 3.0]);
        producer.request_discard(5);
        assert_eq!(consumer.read_sample(), ReadSample::Empty);
        assert_eq!(producer.fill(), 0);

        producer.write(&[4.0, 5.0, 6.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Sample(6.0));
    }

    #[test]
    fn test_flush_cancels_discard() {
        let (producer, mut consumer) = ring(1);
        producer.request_discard(100);
        producer.request_flush();
        assert_eq!(consumer.read_sample(), ReadSample::Flushed);
        producer.write(&[7.0]);
        assert_eq!(consumer.read_sample(), ReadSample::Sample(7.0));
    }

    #[test]
    fn test_consumer_catches_up_after_lap() {
        let (producer, mut consumer) = ring(4);
        producer.write(&(0..10).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(consumer.read_sample(), ReadSample::Sample(0.0));

        producer.write(&(0..2048).map(|i| (100 + i) as f32).collect::<Vec<_>>());
        assert!(producer.metrics().overflow_count > 0);
        let ReadSample::Sample(sample) = consumer.read_sample() else {
            panic!("expected a sample after the lap");
        };
        assert!(sample >= 100.0);
    }

    #[test]
    fn test_concurrent_write_read_is_monotonic() {
        let (producer, mut consumer) = audio_ring_buffer(RingBufferConfig {
            capacity_samples: 4096,
            prefill_samples: 100,
        });
        let writer = std::thread::spawn(move || {
            for i in 0..10_000 {
                producer.write(&[i as f32]);
                if i % 100 == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut last = -1.0f32;
        let mut read = 0;
        loop {
            match consumer.read_sample() {
                ReadSample::Sample(v) => {
                    assert!(v >= last, "went backwards: {v} after {last}");
                    last = v;
                    read += 1;
                }
                ReadSample::Empty | ReadSample::Flushed => {
                    if !consumer.is_producer_alive() && consumer.metrics().fill_samples == 0 {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        let Ok(()) = writer.join() else {
            panic!("writer panicked");
        };
        assert!(read > 0);
    }
}
