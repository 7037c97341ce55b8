use std::fs;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use nix::sched::CpuSet;
use nix::sched::sched_setaffinity;
use nix::sys::mman::MlockAllFlags;
use nix::sys::mman::mlockall;
use nix::unistd::Pid;
use procfs::process::Process;
use procfs::ticks_per_second;

/// Kernel scheduling statistics for a thread, as seen in /proc.
#[derive(Debug, Default, Clone)]
pub struct SchedStats {
    pub system_time: Duration,
    pub user_time: Duration,

    pub nr_migrations: u64,
    pub nr_switches: u64,
    pub nr_voluntary_switches: u64,
    pub nr_involuntary_switches: u64,
    pub nr_preemptions: u64,
}

impl SchedStats {
    /// Parse the contents of /proc/<tid>/sched.
    ///
    /// Unknown keys and unparsable values are skipped; kernels differ in
    /// which counters they expose.
    pub fn parse(content: &str) -> Self {
        let mut stats = SchedStats::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let Ok(value) = value.trim().parse::<u64>() else {
                continue;
            };
            match key.trim() {
                "se.nr_migrations" | "nr_migrations" => stats.nr_migrations = value,
                "nr_switches" => stats.nr_switches = value,
                "nr_voluntary_switches" => stats.nr_voluntary_switches = value,
                "nr_involuntary_switches" => stats.nr_involuntary_switches = value,
                "nr_preemptions" => stats.nr_preemptions = value,
                _ => {}
            }
        }
        stats
    }
}

/// `struct sched_attr`, first published version.
#[repr(C)]
#[derive(Debug, Default)]
struct SchedAttr {
    size: u32,
    sched_policy: u32,
    sched_flags: u64,
    sched_nice: i32,
    sched_priority: u32,
    sched_runtime: u64,
    sched_deadline: u64,
    sched_period: u64,
}

const NS_PER_MS: u64 = 1_000_000;

/// Scheduler utilities for preparing the measuring task.
pub struct Sched;

impl Sched {
    /// Get scheduler statistics for the calling thread.
    pub fn get_current_thread_stats() -> Result<SchedStats> {
        let path = "/proc/thread-self/sched";
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scheduler stats file: {path}"))?;
        let mut stats = SchedStats::parse(&content);

        let proc = Process::myself().with_context(|| "Failed to get process information")?;
        let stat = proc
            .stat()
            .with_context(|| "Failed to read process stat information")?;
        let ticks_per_sec = ticks_per_second();
        stats.system_time = Duration::from_secs_f64(stat.stime as f64 / ticks_per_sec as f64);
        stats.user_time = Duration::from_secs_f64(stat.utime as f64 / ticks_per_sec as f64);
        Ok(stats)
    }

    /// Set the scheduler policy and priority for the calling thread.
    ///
    /// # Arguments
    ///
    /// * `policy` - The scheduler policy to set (e.g. `libc::SCHED_FIFO`)
    /// * `priority` - The static priority within that policy
    pub fn set_scheduler(policy: i32, priority: i32) -> Result<()> {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = unsafe { libc::sched_setscheduler(0, policy, &param) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(anyhow!("failed to set scheduler policy: {}", err));
        }
        Ok(())
    }

    /// Lock all current and future pages of the process into memory.
    pub fn lock_memory() -> Result<()> {
        mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
            .with_context(|| "failed to lock memory")
    }

    /// Restrict the calling thread to a single CPU.
    pub fn pin_to_cpu(cpu: usize) -> Result<()> {
        let mut set = CpuSet::new();
        set.set(cpu)
            .with_context(|| format!("cpu {cpu} is out of range"))?;
        sched_setaffinity(Pid::from_raw(0), &set)
            .with_context(|| format!("failed to pin to cpu {cpu}"))
    }

    /// Period of the calling thread's reservation, in milliseconds.
    ///
    /// Read from the kernel's scheduling attributes. A thread that has no
    /// period (not running under a periodic reservation) is an error, since
    /// the measurement budget is expressed in periods.
    pub fn task_period_ms() -> Result<u64> {
        let mut attr = SchedAttr {
            size: std::mem::size_of::<SchedAttr>() as u32,
            ..Default::default()
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_sched_getattr,
                0,
                &mut attr as *mut SchedAttr,
                std::mem::size_of::<SchedAttr>() as u32,
                0,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(anyhow!("cannot get task parameters: {}", err));
        }
        let period_ms = attr.sched_period / NS_PER_MS;
        if period_ms == 0 {
            return Err(anyhow!(
                "task has no period (policy {}, period {} ns)",
                attr.sched_policy,
                attr.sched_period
            ));
        }
        Ok(period_ms)
    }
}
