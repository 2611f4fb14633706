//! Frame ring buffer between the capture callback and the writer thread
//!
//! Single producer (the real-time callback), single consumer (the writer
//! thread), built on `rtrb` so both sides only touch atomic indices.
//!
//! Overflow policy: the producer never blocks. When the writer falls behind,
//! `write` stores as many whole frames as fit and drops the rest of the
//! buffer. Dropped frames are counted so the consumer side can report them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consumer-side sleep while the ring is empty
const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Create a ring holding `capacity_samples` (rounded down to whole frames) of
/// interleaved audio with `channels` samples per frame
pub fn frame_ring(capacity_samples: usize, channels: u16) -> (FrameProducer, FrameConsumer) {
    let channels = channels.max(1) as usize;
    let capacity = (capacity_samples / channels).max(1) * channels;
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    let dropped = Arc::new(AtomicU64::new(0));

    (
        FrameProducer {
            inner: producer,
            channels,
            dropped: dropped.clone(),
        },
        FrameConsumer {
            inner: consumer,
            channels,
            dropped,
        },
    )
}

/// Real-time side of the ring
pub struct FrameProducer {
    inner: rtrb::Producer<f32>,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

impl FrameProducer {
    /// Push interleaved samples. Returns the number of frames stored.
    ///
    /// Never allocates, locks or blocks. A trailing partial frame is ignored.
    #[inline]
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let offered = samples.len() / self.channels;
        let room = self.inner.slots() / self.channels;
        let frames = offered.min(room);

        if frames > 0 {
            let count = frames * self.channels;
            match self.inner.write_chunk_uninit(count) {
                Ok(chunk) => {
                    chunk.fill_from_iter(samples[..count].iter().copied());
                }
                Err(_) => {
                    self.dropped.fetch_add(offered as u64, Ordering::Relaxed);
                    return 0;
                }
            }
        }

        if frames < offered {
            self.dropped
                .fetch_add((offered - frames) as u64, Ordering::Relaxed);
        }
        frames
    }

    /// Free space in whole frames
    pub fn free_frames(&self) -> usize {
        self.inner.slots() / self.channels
    }
}

/// Writer-thread side of the ring
pub struct FrameConsumer {
    inner: rtrb::Consumer<f32>,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

impl FrameConsumer {
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Whole frames waiting to be read
    pub fn available_frames(&self) -> usize {
        self.inner.slots() / self.channels
    }

    /// Frames the producer had to drop because the ring was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the producer (and with it the capture callback) is gone
    pub fn is_abandoned(&self) -> bool {
        self.inner.is_abandoned()
    }

    /// Copy up to `dst.len()` samples (whole frames only) without waiting.
    /// Returns the number of samples copied.
    pub fn read(&mut self, dst: &mut [f32]) -> usize {
        let frames = self.available_frames().min(dst.len() / self.channels);
        if frames == 0 {
            return 0;
        }

        let count = frames * self.channels;
        match self.inner.read_chunk(count) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                dst[..first.len()].copy_from_slice(first);
                dst[first.len()..first.len() + second.len()].copy_from_slice(second);
                chunk.commit_all();
                count
            }
            Err(_) => 0,
        }
    }

    /// Like [`read`](Self::read) but sleeps while the ring is empty, up to
    /// `timeout`. Returns 0 on timeout or once the producer is gone and the
    /// ring is drained.
    pub fn read_blocking(&mut self, dst: &mut [f32], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let read = self.read(dst);
            if read > 0 || self.is_abandoned() || Instant::now() >= deadline {
                return read;
            }
            std::thread::sleep(EMPTY_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_preserves_order() {
        let (mut tx, mut rx) = frame_ring(16, 1);
        assert_eq!(tx.write(&[0.1, 0.2, 0.3]), 3);

        let mut out = [0.0f32; 8];
        assert_eq!(rx.read(&mut out), 3);
        assert_eq!(&out[..3], &[0.1, 0.2, 0.3]);
        assert_eq!(rx.read(&mut out), 0);
    }

    #[test]
    fn test_overflow_truncates_and_counts_drops() {
        let (mut tx, mut rx) = frame_ring(8, 2);
        let buffer: Vec<f32> = (0..12).map(|i| i as f32).collect();

        // 6 frames offered, room for 4
        assert_eq!(tx.write(&buffer), 4);
        assert_eq!(rx.dropped_frames(), 2);
        assert_eq!(tx.free_frames(), 0);

        // Full ring drops everything without blocking
        assert_eq!(tx.write(&buffer[..4]), 0);
        assert_eq!(rx.dropped_frames(), 4);

        let mut out = [0.0f32; 16];
        assert_eq!(rx.read(&mut out), 8);
        assert_eq!(&out[..8], &buffer[..8]);
    }

    #[test]
    fn test_reads_whole_frames_only() {
        let (mut tx, mut rx) = frame_ring(16, 2);
        tx.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        // Trailing partial frame is never stored
        assert_eq!(rx.available_frames(), 2);
        let mut out = [0.0f32; 3];
        assert_eq!(rx.read(&mut out), 2);
        assert_eq!(&out[..2], &[1.0, 2.0]);
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = frame_ring(4, 1);
        let mut out = [0.0f32; 4];
        for round in 0..5 {
            let base = round as f32 * 10.0;
            assert_eq!(tx.write(&[base, base + 1.0, base + 2.0]), 3);
            assert_eq!(rx.read(&mut out), 3);
            assert_eq!(&out[..3], &[base, base + 1.0, base + 2.0]);
        }
    }

    #[test]
    fn test_read_blocking_times_out_when_empty() {
        let (_tx, mut rx) = frame_ring(4, 1);
        let mut out = [0.0f32; 4];
        let started = Instant::now();
        assert_eq!(rx.read_blocking(&mut out, Duration::from_millis(20)), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_read_blocking_wakes_on_data() {
        let (mut tx, mut rx) = frame_ring(64, 1);
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            tx.write(&[0.5; 8]);
        });

        let mut out = [0.0f32; 64];
        let read = rx.read_blocking(&mut out, Duration::from_secs(2));
        producer.join().unwrap();
        assert_eq!(read, 8);
    }
}
