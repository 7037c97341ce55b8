//! Cycle counting and interrupt masking.

#[cfg(target_arch = "x86_64")]
use std::arch::asm;
#[cfg(not(target_arch = "x86_64"))]
use std::time::Instant;

use log::debug;
use log::warn;
#[cfg(not(target_arch = "x86_64"))]
use once_cell::sync::Lazy;

/// Sysfs file exposing the invariant TSC frequency.
const TSC_FREQ_PATH: &str = "/sys/devices/system/cpu/cpu0/tsc_freq_khz";

/// Fallback source for the nominal clock frequency.
const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// A source of monotonically increasing cycle counts.
///
/// The probe is generic over this so that the state machine can be driven
/// with a deterministic counter.
pub trait CycleCounter {
    /// Read the current cycle count.
    fn now(&self) -> u64;
}

/// The processor's time stamp counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tsc;

impl CycleCounter for Tsc {
    #[inline(always)]
    fn now(&self) -> u64 {
        rdtsc()
    }
}

/// Read the current cycle count using rdtsc.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        asm!(
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
    ((high as u64) << 32) | (low as u64)
}

#[cfg(not(target_arch = "x86_64"))]
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds since first use; stands in for the cycle counter where there
/// is no rdtsc.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Read the invariant TSC frequency from sysfs, in MHz.
pub fn read_tsc_mhz() -> Option<f64> {
    let khz = std::fs::read_to_string(TSC_FREQ_PATH).ok()?;
    let khz = khz.trim().parse::<u64>().ok()?;
    if khz == 0 {
        return None;
    }
    Some(khz as f64 / 1000.0)
}

/// Extract the first "cpu MHz" entry from the contents of /proc/cpuinfo.
pub fn parse_cpuinfo_mhz(content: &str) -> Option<f64> {
    content
        .lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .filter_map(|line| line.split(':').nth(1))
        .filter_map(|mhz| mhz.trim().parse::<f64>().ok())
        .find(|mhz| *mhz > 0.0)
}

/// Detect the clock frequency used to convert cycles into microseconds.
///
/// The TSC frequency is preferred; the nominal frequency reported by
/// /proc/cpuinfo is used when sysfs does not expose it.
///
/// # Returns
///
/// The frequency in MHz, or `None` if neither source is available.
pub fn detect_cpu_mhz() -> Option<f64> {
    if let Some(mhz) = read_tsc_mhz() {
        debug!("tsc frequency from sysfs: {mhz:.3} MHz");
        return Some(mhz);
    }
    let content = std::fs::read_to_string(CPUINFO_PATH).ok()?;
    let mhz = parse_cpuinfo_mhz(&content)?;
    debug!("cpu frequency from cpuinfo: {mhz:.3} MHz");
    Some(mhz)
}

/// Masks interrupt delivery on the local CPU around a measurement window.
///
/// Masking needs I/O privilege. When privilege is not requested or cannot
/// be obtained, the mask is inactive and holding it does nothing.
#[derive(Debug)]
pub struct InterruptMask {
    active: bool,
}

impl InterruptMask {
    /// An inactive mask.
    pub fn disabled() -> Self {
        Self { active: false }
    }

    /// Try to obtain the privilege needed to mask interrupts.
    ///
    /// Failure is not an error: the returned mask is simply inactive and a
    /// warning is logged.
    pub fn acquire() -> Self {
        match raise_io_privilege() {
            Ok(()) => {
                debug!("interrupt masking enabled");
                Self { active: true }
            }
            Err(e) => {
                warn!("interrupt masking unavailable, measuring with interrupts on: {e}");
                Self::disabled()
            }
        }
    }

    /// Whether holding the mask actually disables interrupts.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Disable interrupts until the returned guard is dropped.
    pub fn hold(&self) -> MaskGuard<'_> {
        if self.active {
            disable_interrupts();
        }
        MaskGuard { mask: self }
    }
}

/// Re-enables interrupts when dropped.
pub struct MaskGuard<'a> {
    mask: &'a InterruptMask,
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        if self.mask.active {
            enable_interrupts();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn raise_io_privilege() -> std::io::Result<()> {
    let rc = unsafe { libc::syscall(libc::SYS_iopl, 3) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
fn raise_io_privilege() -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "interrupt masking is only supported on x86_64 linux",
    ))
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn disable_interrupts() {
    unsafe { asm!("cli", options(nomem, nostack)) };
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn enable_interrupts() {
    unsafe { asm!("sti", options(nomem, nostack)) };
}

#[cfg(not(target_arch = "x86_64"))]
fn disable_interrupts() {}

#[cfg(not(target_arch = "x86_64"))]
fn enable_interrupts() {}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;

    use super::*;

    #[test]
    fn test_counter_monotonic() {
        let tsc = Tsc;
        let t1 = tsc.now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = tsc.now();
        assert_ge!(t2, t1);
    }

    #[test]
    fn test_parse_cpuinfo() {
        let content = "processor\t: 0\nmodel name\t: Xeon\ncpu MHz\t\t: 2128.207\n\
                       processor\t: 1\ncpu MHz\t\t: 1600.000\n";
        assert_eq!(parse_cpuinfo_mhz(content), Some(2128.207));
    }

    #[test]
    fn test_parse_cpuinfo_missing() {
        assert_eq!(parse_cpuinfo_mhz("processor\t: 0\n"), None);
        assert_eq!(parse_cpuinfo_mhz("cpu MHz\t\t: garbage\n"), None);
    }

    #[test]
    fn test_disabled_mask() {
        let mask = InterruptMask::disabled();
        assert!(!mask.is_active());
        let guard = mask.hold();
        drop(guard);
    }
}
