//! Cache-line aligned working sets touched by the probe.

use anyhow::Result;
use anyhow::anyhow;

use crate::params::CACHE_ALIGNMENT;

const WORDS_PER_LINE: usize = CACHE_ALIGNMENT / std::mem::size_of::<u32>();

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct CacheLine([u32; WORDS_PER_LINE]);

const _: () = assert!(std::mem::size_of::<CacheLine>() == CACHE_ALIGNMENT);

/// A fixed number of equally sized, disjoint memory regions.
///
/// The probe measures one region per job and rotates through them so that a
/// new job starts on memory that is not in cache.
pub struct WorkingSets {
    lines: Vec<CacheLine>,
    lines_per_set: usize,
    count: usize,
}

impl WorkingSets {
    /// Allocate `count` zeroed working sets of `wss_kb` KiB each.
    ///
    /// Zeroing also faults every page in, so no page fault lands inside a
    /// measurement.
    pub fn new(wss_kb: usize, count: usize) -> Result<Self> {
        let bytes = wss_kb
            .checked_mul(1024)
            .ok_or_else(|| anyhow!("working set of {wss_kb} KiB is too large"))?;
        if bytes == 0 || count == 0 {
            return Err(anyhow!(
                "need at least one non-empty working set (wss {wss_kb} KiB, count {count})"
            ));
        }
        let lines_per_set = bytes / CACHE_ALIGNMENT;
        let total = lines_per_set
            .checked_mul(count)
            .ok_or_else(|| anyhow!("{count} working sets of {wss_kb} KiB is too large"))?;

        let mut lines = Vec::new();
        lines
            .try_reserve_exact(total)
            .map_err(|e| anyhow!("cannot allocate {count} working sets of {wss_kb} KiB: {e}"))?;
        lines.resize(total, CacheLine([0; WORDS_PER_LINE]));

        Ok(Self {
            lines,
            lines_per_set,
            count,
        })
    }

    /// Number of working sets.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of 32-bit words in one working set.
    pub fn words_per_set(&self) -> usize {
        self.lines_per_set * WORDS_PER_LINE
    }

    fn set(&mut self, slot: usize) -> &mut [CacheLine] {
        let start = (slot % self.count) * self.lines_per_set;
        &mut self.lines[start..start + self.lines_per_set]
    }

    /// Read and write back every word of a working set.
    pub fn touch(&mut self, slot: usize) {
        for line in self.set(slot) {
            for word in line.0.iter_mut() {
                let p = word as *mut u32;
                unsafe {
                    let v = std::ptr::read_volatile(p);
                    std::ptr::write_volatile(p, v.wrapping_add(1));
                }
            }
        }
    }

    /// Read one word of a working set. `offset` is in words and wraps.
    pub fn read_word(&mut self, slot: usize, offset: usize) -> u32 {
        let p = self.word(slot, offset);
        unsafe { std::ptr::read_volatile(p) }
    }

    /// Write one word of a working set. `offset` is in words and wraps.
    pub fn write_word(&mut self, slot: usize, offset: usize, value: u32) {
        let p = self.word(slot, offset);
        unsafe { std::ptr::write_volatile(p, value) };
    }

    fn word(&mut self, slot: usize, offset: usize) -> *mut u32 {
        let offset = offset % self.words_per_set();
        let line = &mut self.set(slot)[offset / WORDS_PER_LINE];
        &mut line.0[offset % WORDS_PER_LINE] as *mut u32
    }
}
