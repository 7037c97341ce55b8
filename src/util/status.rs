//! Read-only view of the real-time scheduler's per-task status page.
//!
//! The scheduler publishes job and scheduling counters for the calling task
//! in a small shared page. The page is updated concurrently with no lock, so
//! every read produces a [`ScheduleSnapshot`] value and consumers compare
//! snapshots taken before and after a measurement to detect interference.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::Path;
use std::ptr;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;

use crate::util::memfd::page_align;

/// In-memory layout of the status page as published by the scheduler.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlPage {
    pub job_count: u64,
    pub sched_count: u64,
    pub cpu: u32,
    pub _pad: u32,
    pub last_rt_task: u64,
    pub preempt_start: u64,
    pub preempt_end: u64,
}

/// One observation of the status page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    /// Jobs released for this task so far.
    pub job_count: u64,
    /// Times this task has been scheduled.
    pub sched_count: u64,
    /// CPU the task is running on.
    pub cpu: u32,
    /// Last real-time task that ran before this one.
    pub last_rt_task: u64,
    /// Cycle count when the task was last switched out.
    pub preempt_start: u64,
    /// Cycle count when the task was last switched back in.
    pub preempt_end: u64,
}

impl ScheduleSnapshot {
    /// Whether `other` belongs to the same uninterrupted scheduling window.
    ///
    /// Only the job, schedule and cpu counters take part; the remaining
    /// fields describe the past and may legitimately be rewritten.
    pub fn same_window(&self, other: &ScheduleSnapshot) -> bool {
        self.job_count == other.job_count
            && self.sched_count == other.sched_count
            && self.cpu == other.cpu
    }

    /// Cycles spent away from the CPU in the last preemption.
    pub fn preemption_length(&self) -> u64 {
        self.preempt_end.wrapping_sub(self.preempt_start)
    }
}

impl From<ControlPage> for ScheduleSnapshot {
    fn from(page: ControlPage) -> Self {
        Self {
            job_count: page.job_count,
            sched_count: page.sched_count,
            cpu: page.cpu,
            last_rt_task: page.last_rt_task,
            preempt_start: page.preempt_start,
            preempt_end: page.preempt_end,
        }
    }
}

impl From<ScheduleSnapshot> for ControlPage {
    fn from(snapshot: ScheduleSnapshot) -> Self {
        Self {
            job_count: snapshot.job_count,
            sched_count: snapshot.sched_count,
            cpu: snapshot.cpu,
            _pad: 0,
            last_rt_task: snapshot.last_rt_task,
            preempt_start: snapshot.preempt_start,
            preempt_end: snapshot.preempt_end,
        }
    }
}

/// Something that can be polled for the task's scheduling state.
pub trait StatusSource {
    /// Read the current state. Never blocks and never fails; a torn read
    /// shows up as a snapshot that fails [`ScheduleSnapshot::same_window`].
    fn snapshot(&self) -> ScheduleSnapshot;
}

impl<T: StatusSource + ?Sized> StatusSource for &T {
    fn snapshot(&self) -> ScheduleSnapshot {
        (**self).snapshot()
    }
}

/// The status page mapped read-only into this process.
pub struct StatusPage {
    page: *const ControlPage,
    len: usize,
}

impl StatusPage {
    /// Map the status page exposed by the device at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("unable to open status device {}", path.display()))?;
        Self::map(&file).with_context(|| format!("unable to map status device {}", path.display()))
    }

    /// Map the status page from an already open descriptor.
    ///
    /// The mapping stays valid after the descriptor is closed.
    pub fn map<F: AsFd>(fd: F) -> Result<Self> {
        let len = page_align(std::mem::size_of::<ControlPage>())?;
        let length = NonZeroUsize::new(len).ok_or_else(|| anyhow!("empty status page"))?;
        let addr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                Some(fd),
                0,
            )
        }
        .with_context(|| "mmap of status page failed")?;
        Ok(Self {
            page: addr as *const ControlPage,
            len,
        })
    }
}

impl StatusSource for StatusPage {
    fn snapshot(&self) -> ScheduleSnapshot {
        let page = self.page;
        // Field by field: the scheduler may update the page between any two
        // of these reads.
        unsafe {
            ScheduleSnapshot {
                job_count: ptr::read_volatile(ptr::addr_of!((*page).job_count)),
                sched_count: ptr::read_volatile(ptr::addr_of!((*page).sched_count)),
                cpu: ptr::read_volatile(ptr::addr_of!((*page).cpu)),
                last_rt_task: ptr::read_volatile(ptr::addr_of!((*page).last_rt_task)),
                preempt_start: ptr::read_volatile(ptr::addr_of!((*page).preempt_start)),
                preempt_end: ptr::read_volatile(ptr::addr_of!((*page).preempt_end)),
            }
        }
    }
}

impl Drop for StatusPage {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.page as *mut libc::c_void, self.len);
        }
    }
}
