//! Experiment parameters.
//!
//! These are the defaults for a measurement run. Working-set and cache sizes
//! can be overridden on the command line; the rest are fixed properties of the
//! experiment and of the trace format.

/// Default working set size, in KiB.
pub const WSS_KB: usize = 3072;

/// Default size of the largest cache level, in KiB.
pub const CACHESIZE_KB: usize = 12 * 1024;

/// Number of samples retained by the probe.
pub const DATAPOINTS: usize = 100_000;

/// Cache line size used for aligning the working sets.
pub const CACHE_ALIGNMENT: usize = 64;

/// Percentage of keep-warm accesses that are reads.
pub const READRATIO: u32 = 75;

/// Seed for the keep-warm access generator.
pub const SEEDVAL: u64 = 12345;

/// Measurement budget, in milliseconds of task time.
pub const SIMRUNTIME_MS: u64 = 60_000;

/// Hot accesses per job, and hot records per baseline window.
pub const REFTOTAL: usize = 2;

/// Records per write block when persisting a trace.
pub const WRITE_BLOCK: usize = 1024;

/// Records per read block when loading a trace.
pub const READ_BLOCK: usize = 500;

/// Clock frequency assumed when none is configured or detected, in MHz.
pub const DEFAULT_CPU_MHZ: f64 = 2128.207;

/// Default device exposing the scheduler status page.
pub const DEFAULT_STATUS_DEVICE: &str = "/dev/litmus/ctrl";

/// Number of working sets to rotate through so that a job never finds its
/// slot warm from a previous job.
///
/// Returns `None` if the count does not fit in a `usize`.
///
/// # Arguments
///
/// * `cache_kb` - Size of the largest cache level, in KiB
/// * `wss_kb` - Working set size, in KiB
pub fn num_working_sets(cache_kb: usize, wss_kb: usize) -> Option<usize> {
    if wss_kb == 0 {
        return Some(2);
    }
    cache_kb.checked_mul(2)?.checked_div(wss_kb)?.checked_add(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_working_sets() {
        assert_eq!(num_working_sets(CACHESIZE_KB, WSS_KB), Some(10));
    }

    #[test]
    fn test_large_working_set() {
        assert_eq!(num_working_sets(1024, 4096), Some(2));
    }

    #[test]
    fn test_huge_cache_size() {
        assert_eq!(num_working_sets(usize::MAX, 1024), None);
        assert_eq!(num_working_sets(usize::MAX / 2, usize::MAX / 2), Some(4));
    }
}
