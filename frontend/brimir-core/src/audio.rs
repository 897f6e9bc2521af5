//! Lock-free single-producer single-consumer audio ring
//!
//! Stereo pairs are packed into one atomic word each so a pair can never tear. The producer
//! (the SCSP sample callback) writes unchecked and advances its index with release
//! ordering; overflowing simply overwrites the oldest samples, which is preferable to
//! stalling emulation. The consumer drains with acquire ordering and never blocks.
//!
//! Today both ends run on the frame thread, but the ordering discipline keeps the design
//! sound if the producer ever moves off it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Capacity in stereo pairs; must be a power of two. 2048 pairs is nearly three NTSC frames
/// of 44.1 kHz output and about 2.3 PAL frames.
pub const RING_CAPACITY_PAIRS: usize = 2048;

struct RingShared {
    buffer: Box<[std::sync::atomic::AtomicU32]>,
    write_pos: AtomicUsize,
}

impl RingShared {
    fn new() -> Self {
        let buffer =
            (0..RING_CAPACITY_PAIRS).map(|_| std::sync::atomic::AtomicU32::new(0)).collect();
        Self { buffer, write_pos: AtomicUsize::new(0) }
    }
}

/// Producer handle handed to the SCSP sample callback.
#[derive(Clone)]
pub struct AudioProducer {
    shared: Arc<RingShared>,
}

impl AudioProducer {
    /// Push one stereo pair. Never blocks, never checks capacity.
    #[inline]
    pub fn push(&self, left: i16, right: i16) {
        let pos = self.shared.write_pos.load(Ordering::Relaxed);
        let packed = (u32::from(left as u16)) | (u32::from(right as u16) << 16);
        self.shared.buffer[pos & (RING_CAPACITY_PAIRS - 1)].store(packed, Ordering::Relaxed);
        self.shared.write_pos.store(pos.wrapping_add(1), Ordering::Release);
    }
}

pub struct AudioRingBuffer {
    shared: Arc<RingShared>,
    read_pos: usize,
}

impl Default for AudioRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRingBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self { shared: Arc::new(RingShared::new()), read_pos: 0 }
    }

    #[must_use]
    pub fn producer(&self) -> AudioProducer {
        AudioProducer { shared: Arc::clone(&self.shared) }
    }

    #[must_use]
    pub fn available_pairs(&self) -> usize {
        let write_pos = self.shared.write_pos.load(Ordering::Acquire);
        write_pos.wrapping_sub(self.read_pos) & (RING_CAPACITY_PAIRS - 1)
    }

    /// Copy up to `max_pairs` stereo pairs into `dst` as interleaved L, R samples,
    /// returning the number of pairs written. Returns 0 immediately when empty.
    pub fn drain(&mut self, dst: &mut [i16], max_pairs: usize) -> usize {
        let available = self.available_pairs();
        let count = available.min(max_pairs).min(dst.len() / 2);

        for i in 0..count {
            let packed = self.shared.buffer[(self.read_pos + i) & (RING_CAPACITY_PAIRS - 1)]
                .load(Ordering::Relaxed);
            dst[2 * i] = packed as u16 as i16;
            dst[2 * i + 1] = (packed >> 16) as u16 as i16;
        }

        self.read_pos = self.read_pos.wrapping_add(count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_exactly_the_available_samples() {
        let mut ring = AudioRingBuffer::new();
        let producer = ring.producer();

        for i in 0..100 {
            producer.push(i, -i);
        }

        let mut dst = vec![0_i16; 256];
        assert_eq!(ring.drain(&mut dst, 50), 50);
        assert_eq!(ring.drain(&mut dst, 100), 50);
        assert_eq!(ring.drain(&mut dst, 100), 0);
    }

    #[test]
    fn preserves_sample_order_and_interleaving() {
        let mut ring = AudioRingBuffer::new();
        let producer = ring.producer();

        for i in 0..10 {
            producer.push(i * 2, i * 2 + 1);
        }

        let mut dst = vec![0_i16; 20];
        assert_eq!(ring.drain(&mut dst, 10), 10);
        let expected: Vec<i16> = (0..20).collect();
        assert_eq!(dst, expected);
    }

    #[test]
    fn interleaved_push_and_drain_across_wraparound() {
        let mut ring = AudioRingBuffer::new();
        let producer = ring.producer();
        let mut next_value: i16 = 0;
        let mut expected: i16 = 0;

        // Push/drain in unequal chunks for several capacities' worth of data
        let mut dst = vec![0_i16; RING_CAPACITY_PAIRS * 2];
        for round in 0..64 {
            let pushed = 37 + round % 11;
            for _ in 0..pushed {
                producer.push(next_value, next_value);
                next_value = next_value.wrapping_add(1);
            }

            let drained = ring.drain(&mut dst, pushed);
            assert_eq!(drained, pushed);
            for pair in dst[..drained * 2].chunks_exact(2) {
                assert_eq!(pair[0], expected);
                assert_eq!(pair[1], expected);
                expected = expected.wrapping_add(1);
            }
        }
    }

    #[test]
    fn overflow_overwrites_the_oldest_samples() {
        let mut ring = AudioRingBuffer::new();
        let producer = ring.producer();

        for i in 0..(RING_CAPACITY_PAIRS + 10) {
            producer.push(i as i16, 0);
        }

        // The indices have lapped; availability wraps rather than reporting a full ring
        assert_eq!(ring.available_pairs(), 10);
    }
}
