//! Bounded sample storage that keeps the most recent entries.

use anyhow::Result;
use anyhow::anyhow;

/// A fixed-capacity ring that overwrites its oldest entry when full.
///
/// Storage is reserved up front so that pushing never allocates while the
/// probe is measuring.
pub struct SampleRing<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Index the next push writes to once the ring is full.
    next: usize,
    wrapped: bool,
}

impl<T: Copy> SampleRing<T> {
    /// Create an empty ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("sample ring needs a non-zero capacity"));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| anyhow!("cannot allocate {capacity} samples: {e}"))?;
        Ok(Self {
            slots,
            capacity,
            next: 0,
            wrapped: false,
        })
    }

    /// Append an entry, overwriting the oldest one if the ring is full.
    pub fn push(&mut self, item: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(item);
        } else {
            self.slots[self.next] = item;
        }
        self.next += 1;
        if self.next == self.capacity {
            self.next = 0;
            self.wrapped = true;
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether any entry has been overwritten (or is about to be).
    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Live entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newest, oldest) = self.slots.split_at(if self.wrapped { self.next } else { 0 });
        oldest.iter().chain(newest.iter())
    }

    /// Copy out the live entries, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity() {
        assert!(SampleRing::<u32>::new(0).is_err());
    }

    #[test]
    fn test_partial_fill() -> Result<()> {
        let mut ring = SampleRing::new(5)?;
        for i in 0..3u32 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert!(!ring.is_wrapped());
        assert_eq!(ring.to_vec(), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_exact_fill() -> Result<()> {
        let mut ring = SampleRing::new(4)?;
        for i in 0..4u32 {
            ring.push(i);
        }
        assert!(ring.is_wrapped());
        assert_eq!(ring.to_vec(), vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_keeps_most_recent_in_order() -> Result<()> {
        let capacity = 1000;
        let extra = 337;
        let mut ring = SampleRing::new(capacity)?;
        for i in 0..(capacity + extra) as u64 {
            ring.push(i);
        }
        assert_eq!(ring.len(), capacity);
        let expected: Vec<u64> = (extra as u64..(capacity + extra) as u64).collect();
        assert_eq!(ring.to_vec(), expected);
        Ok(())
    }
}
