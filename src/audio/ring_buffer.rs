//! Lock-free SPSC ring buffer for PCM16 samples.
//!
//! Uses the `ringbuf` crate to pass samples from the cpal callback thread
//! to the session's send loop without locks. Capacity is bounded (ten
//! seconds of audio by default); when the send loop falls behind it skips
//! the oldest samples so the newest audio is never the part that is lost.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Producer half — lives in the cpal audio callback thread.
pub struct AudioProducer {
    inner: ringbuf::HeapProd<i16>,
}

/// Consumer half — lives in the session's send loop.
pub struct AudioConsumer {
    inner: ringbuf::HeapCons<i16>,
    capacity: usize,
}

/// Create a matched producer/consumer pair. `capacity` is in samples;
/// size it as `sample_rate * seconds` for a wall-clock bound.
pub fn audio_ring_buffer(capacity: usize) -> (AudioProducer, AudioConsumer) {
    let rb = HeapRb::<i16>::new(capacity);
    let (prod, cons) = rb.split();
    (
        AudioProducer { inner: prod },
        AudioConsumer {
            inner: cons,
            capacity,
        },
    )
}

impl AudioProducer {
    /// Push a slice of samples. Returns the number actually written; a
    /// short write means the consumer has stalled for the full buffer
    /// duration.
    pub fn push_slice(&mut self, samples: &[i16]) -> usize {
        self.inner.push_slice(samples)
    }
}

// Safety: the ringbuf producer is designed to be used from a single
// thread. cpal callbacks run on one dedicated audio thread.
unsafe impl Send for AudioProducer {}

impl AudioConsumer {
    /// Pop up to `buf.len()` samples. Returns the number actually read.
    pub fn pop_slice(&mut self, buf: &mut [i16]) -> usize {
        self.inner.pop_slice(buf)
    }

    /// Number of samples currently buffered.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Drop the oldest samples until at most `keep` remain. Called by the
    /// send loop when the connection stalls, so overflow discards the
    /// oldest audio first. Returns the number discarded.
    pub fn trim_oldest(&mut self, keep: usize) -> usize {
        let occupied = self.inner.occupied_len();
        if occupied <= keep {
            return 0;
        }
        self.inner.skip(occupied - keep)
    }

    /// Total capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drain all available samples into a Vec.
    pub fn drain_all(&mut self) -> Vec<i16> {
        let n = self.available();
        if n == 0 {
            return Vec::new();
        }
        let mut buf = vec![0i16; n];
        let read = self.pop_slice(&mut buf);
        buf.truncate(read);
        buf
    }
}

unsafe impl Send for AudioConsumer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order() {
        let (mut prod, mut cons) = audio_ring_buffer(8);
        assert_eq!(prod.push_slice(&[1, 2, 3, 4]), 4);
        let mut out = [0i16; 4];
        assert_eq!(cons.pop_slice(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn capacity_bounds_writes() {
        let (mut prod, cons) = audio_ring_buffer(4);
        assert_eq!(prod.push_slice(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(cons.available(), 4);
    }

    #[test]
    fn trim_oldest_discards_from_the_front() {
        let (mut prod, mut cons) = audio_ring_buffer(8);
        prod.push_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(cons.trim_oldest(2), 4);
        assert_eq!(cons.drain_all(), vec![5, 6]);
    }

    #[test]
    fn drain_all_empties_the_buffer() {
        let (mut prod, mut cons) = audio_ring_buffer(8);
        prod.push_slice(&[7, 8, 9]);
        assert_eq!(cons.drain_all(), vec![7, 8, 9]);
        assert_eq!(cons.available(), 0);
        assert!(cons.drain_all().is_empty());
    }
}
