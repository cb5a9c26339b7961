use std::sync::atomic::{AtomicU64, Ordering};

/// Values that pack into a single 64-bit word so slots can be atomics.
pub trait PackedSample: Copy {
    fn pack(self) -> u64;
    fn unpack(bits: u64) -> Self;
}

impl PackedSample for f32 {
    fn pack(self) -> u64 {
        self.to_bits() as u64
    }

    fn unpack(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl PackedSample for f64 {
    fn pack(self) -> u64 {
        self.to_bits()
    }

    fn unpack(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

impl PackedSample for u64 {
    fn pack(self) -> u64 {
        self
    }

    fn unpack(bits: u64) -> Self {
        bits
    }
}

/// Fixed-capacity sample buffer with one writer and any number of readers.
///
/// Old samples are overwritten once the write cursor wraps. Readers may see
/// a sample from the previous lap while the writer is racing them, but never
/// a torn value.
pub struct RingBuffer<T: PackedSample> {
    slots: Box<[AtomicU64]>,
    written: AtomicU64,
    _marker: std::marker::PhantomData<T>,
}

impl<T: PackedSample> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            written: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn record(&self, sample: T) {
        let index = self.written.load(Ordering::Relaxed);
        let slot = (index % self.slots.len() as u64) as usize;
        self.slots[slot].store(sample.pack(), Ordering::Relaxed);
        self.written.store(index + 1, Ordering::Release);
    }

    pub fn count(&self) -> usize {
        (self.written.load(Ordering::Acquire) as usize).min(self.slots.len())
    }

    /// `index` 0 is the oldest retained sample, `count() - 1` the newest.
    pub fn sample(&self, index: usize) -> Option<T> {
        let written = self.written.load(Ordering::Acquire);
        let count = (written as usize).min(self.slots.len());
        if index >= count {
            return None;
        }
        let first = written - count as u64;
        let slot = ((first + index as u64) % self.slots.len() as u64) as usize;
        Some(T::unpack(self.slots[slot].load(Ordering::Relaxed)))
    }

    pub fn latest(&self) -> Option<T> {
        let count = self.count();
        if count == 0 {
            None
        } else {
            self.sample(count - 1)
        }
    }

    /// Retained samples, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        let written = self.written.load(Ordering::Acquire);
        let count = (written as usize).min(self.slots.len());
        let first = written - count as u64;
        (0..count as u64)
            .map(|i| {
                let slot = ((first + i) % self.slots.len() as u64) as usize;
                T::unpack(self.slots[slot].load(Ordering::Relaxed))
            })
            .collect()
    }

    pub fn reset(&self) {
        self.written.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tracks_writes_below_capacity() {
        let ring = RingBuffer::<u64>::new(8);
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.latest(), None);
        for i in 0..5 {
            ring.record(i);
        }
        assert_eq!(ring.count(), 5);
        assert_eq!(ring.sample(0), Some(0));
        assert_eq!(ring.sample(4), Some(4));
        assert_eq!(ring.sample(5), None);
    }

    #[test]
    fn wrap_keeps_most_recent_samples() {
        let capacity = 16;
        let ring = RingBuffer::<u64>::new(capacity);
        let extra = 7;
        for i in 0..(capacity + extra) as u64 {
            ring.record(i);
        }
        assert_eq!(ring.count(), capacity);
        for i in 0..capacity {
            assert_eq!(ring.sample(i), Some((i + extra) as u64));
        }
        assert_eq!(ring.latest(), Some((capacity + extra - 1) as u64));
        assert_eq!(ring.snapshot().first().copied(), Some(extra as u64));
    }

    #[test]
    fn reset_rezeroes_cursor() {
        let ring = RingBuffer::<f32>::new(4);
        ring.record(0.5);
        ring.record(0.25);
        ring.reset();
        assert_eq!(ring.count(), 0);
        ring.record(1.0);
        assert_eq!(ring.snapshot(), vec![1.0]);
    }
}
