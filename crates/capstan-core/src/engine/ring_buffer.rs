//! Lock-free single-producer/single-consumer sample ring buffer
//!
//! One ring per track carries samples between the buffering thread and the
//! hardware callback: for playback the buffering thread puts and the
//! callback gets, for capture the callback puts and the buffering thread
//! gets. There is no internal locking. Correctness relies on the
//! single-producer/single-consumer discipline plus release/acquire ordering
//! on the cursors: the producer publishes its cursor only after the data
//! stores are visible, the consumer reads the cursor before touching data.
//!
//! Cursors are monotonic sample counts (not wrapped indices), so
//! `avail_for_get() + avail_for_put() == capacity` holds at every instant
//! and the full capacity is usable. Sample slots are `AtomicU32` holding
//! `f32` bit patterns, which keeps both roles on safe `&self` methods; the
//! relaxed per-slot accesses cost nothing on the targets we care about.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::types::{Sample, SampleFormat};

/// Fixed-capacity SPSC sample ring
///
/// Created per track at stream start, dropped at stream stop. Put and
/// Get/Discard must each stay on a single thread for the lifetime of a
/// stream; which thread holds which role differs between the playback and
/// capture directions.
pub struct RingBuffer {
    storage: Box<[AtomicU32]>,
    written: AtomicU64,
    read: AtomicU64,
    format: SampleFormat,
}

impl RingBuffer {
    pub fn new(format: SampleFormat, capacity: usize) -> Self {
        assert!(capacity > 0);
        let storage = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            storage,
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            format,
        }
    }

    /// Fallible variant of [`new`](Self::new) for speculative large
    /// allocations; callers retry with smaller capacities on failure
    pub fn try_new(format: SampleFormat, capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let mut storage: Vec<AtomicU32> = Vec::new();
        storage.try_reserve_exact(capacity).ok()?;
        storage.extend((0..capacity).map(|_| AtomicU32::new(0)));
        Some(Self {
            storage: storage.into_boxed_slice(),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            format,
        })
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Destination storage format of the track this ring feeds
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Free space, from the producer's point of view. O(1).
    pub fn avail_for_put(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Samples ready to read, from the consumer's point of view. O(1).
    pub fn avail_for_get(&self) -> usize {
        self.len()
    }

    fn len(&self) -> usize {
        let written = self.written.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        written.wrapping_sub(read) as usize
    }

    /// Copy up to `data.len()` samples in; returns the count actually
    /// copied. Never blocks; silently truncates when full, so callers that
    /// care must check the return value.
    pub fn put(&self, data: &[Sample]) -> usize {
        let written = self.written.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let free = self.capacity() - written.wrapping_sub(read) as usize;
        let count = data.len().min(free);

        let capacity = self.capacity() as u64;
        for (i, &sample) in data[..count].iter().enumerate() {
            let slot = (written.wrapping_add(i as u64) % capacity) as usize;
            self.storage[slot].store(sample.to_bits(), Ordering::Relaxed);
        }

        self.written
            .store(written.wrapping_add(count as u64), Ordering::Release);
        count
    }

    /// Append `count` zero samples; returns the count actually written
    pub fn put_silence(&self, count: usize) -> usize {
        let written = self.written.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let free = self.capacity() - written.wrapping_sub(read) as usize;
        let count = count.min(free);

        let capacity = self.capacity() as u64;
        for i in 0..count {
            let slot = (written.wrapping_add(i as u64) % capacity) as usize;
            self.storage[slot].store(0, Ordering::Relaxed);
        }

        self.written
            .store(written.wrapping_add(count as u64), Ordering::Release);
        count
    }

    /// Copy up to `out.len()` available samples out; returns the count
    /// actually copied. Does not zero-fill the remainder; callers pad.
    pub fn get(&self, out: &mut [Sample]) -> usize {
        let read = self.read.load(Ordering::Relaxed);
        let written = self.written.load(Ordering::Acquire);
        let avail = written.wrapping_sub(read) as usize;
        let count = out.len().min(avail);

        let capacity = self.capacity() as u64;
        for (i, sample) in out[..count].iter_mut().enumerate() {
            let slot = (read.wrapping_add(i as u64) % capacity) as usize;
            *sample = Sample::from_bits(self.storage[slot].load(Ordering::Relaxed));
        }

        self.read
            .store(read.wrapping_add(count as u64), Ordering::Release);
        count
    }

    /// Advance the read cursor without copying; returns the count actually
    /// discarded
    pub fn discard(&self, count: usize) -> usize {
        let read = self.read.load(Ordering::Relaxed);
        let written = self.written.load(Ordering::Acquire);
        let avail = written.wrapping_sub(read) as usize;
        let count = count.min(avail);

        self.read
            .store(read.wrapping_add(count as u64), Ordering::Release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avail_sums_to_capacity() {
        let ring = RingBuffer::new(SampleFormat::Float, 64);
        let mut out = [0.0f32; 64];
        assert_eq!(ring.avail_for_put() + ring.avail_for_get(), 64);

        ring.put(&[1.0; 10]);
        assert_eq!(ring.avail_for_put() + ring.avail_for_get(), 64);
        ring.get(&mut out[..3]);
        assert_eq!(ring.avail_for_put() + ring.avail_for_get(), 64);
        ring.discard(4);
        assert_eq!(ring.avail_for_put() + ring.avail_for_get(), 64);
        ring.put(&[2.0; 60]);
        assert_eq!(ring.avail_for_put() + ring.avail_for_get(), 64);
    }

    #[test]
    fn test_get_never_exceeds_put() {
        let ring = RingBuffer::new(SampleFormat::Float, 16);
        let mut out = [0.0f32; 32];

        assert_eq!(ring.put(&[0.5; 10]), 10);
        assert_eq!(ring.get(&mut out), 10);
        assert_eq!(ring.get(&mut out), 0);
    }

    #[test]
    fn test_put_truncates_when_full() {
        let ring = RingBuffer::new(SampleFormat::Int16, 8);
        assert_eq!(ring.put(&[1.0; 12]), 8);
        assert_eq!(ring.avail_for_put(), 0);
        assert_eq!(ring.put(&[2.0; 4]), 0);

        let mut out = [0.0f32; 8];
        assert_eq!(ring.get(&mut out), 8);
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let ring = RingBuffer::new(SampleFormat::Float, 4);
        let mut out = [0.0f32; 4];

        ring.put(&[1.0, 2.0, 3.0]);
        assert_eq!(ring.get(&mut out[..2]), 2);
        // Write cursor wraps past the end of storage here
        ring.put(&[4.0, 5.0, 6.0]);
        assert_eq!(ring.get(&mut out), 4);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_discard_bounded_by_available() {
        let ring = RingBuffer::new(SampleFormat::Float, 16);
        ring.put(&[0.0; 5]);
        assert_eq!(ring.discard(100), 5);
        assert_eq!(ring.avail_for_get(), 0);
    }

    #[test]
    fn test_put_silence() {
        let ring = RingBuffer::new(SampleFormat::Float, 8);
        ring.put(&[9.0; 2]);
        assert_eq!(ring.put_silence(3), 3);
        let mut out = [1.0f32; 5];
        assert_eq!(ring.get(&mut out), 5);
        assert_eq!(out, [9.0, 9.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_concurrent_roles() {
        use std::sync::Arc;

        let ring = Arc::new(RingBuffer::new(SampleFormat::Float, 256));
        let producer_ring = Arc::clone(&ring);

        let producer = std::thread::spawn(move || {
            let mut sent = 0u32;
            while sent < 10_000 {
                let chunk: Vec<f32> = (sent..sent + 64).map(|v| v as f32).collect();
                let put = producer_ring.put(&chunk);
                sent += put as u32;
                if put == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0u32;
        let mut buf = [0.0f32; 64];
        while received < 10_000 {
            let got = ring.get(&mut buf);
            for &s in &buf[..got] {
                assert_eq!(s, received as f32);
                received += 1;
            }
            if got == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
