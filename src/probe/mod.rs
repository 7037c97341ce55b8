//! The measuring task.
//!
//! The probe runs as a periodic real-time task and polls the scheduler's
//! status page in a tight loop. Every poll compares the page with what it
//! saw at the last observed event and takes one of four actions:
//!
//! * no job yet: wait;
//! * new job: time a cold pass over a fresh working set, then
//!   [`REFTOTAL`](crate::params::REFTOTAL) hot passes over the same set;
//! * same job, but rescheduled or moved to another CPU: time one pass over the
//!   working set to capture the cost of the preemption or migration;
//! * otherwise: one random access to keep the working set warm.
//!
//! Each timed pass is tagged suspect if the job, schedule or cpu counters
//! changed while it ran.

pub mod ring;
pub mod workset;

use std::path::Path;

use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use log::info;
use log::warn;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::params;
use crate::probe::ring::SampleRing;
use crate::probe::workset::WorkingSets;
use crate::trace::AccessKind;
use crate::trace::Sample;
use crate::trace::TraceWriter;
use crate::util::clock::CycleCounter;
use crate::util::clock::InterruptMask;
use crate::util::sched::Sched;
use crate::util::status::ScheduleSnapshot;
use crate::util::status::StatusSource;

/// Parameters of a measurement run.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Working set size, in KiB.
    pub wss_kb: usize,
    /// Size of the largest cache level, in KiB.
    pub cache_kb: usize,
    /// Number of samples retained.
    pub capacity: usize,
    /// Percentage of keep-warm accesses that are reads.
    pub read_ratio: u32,
    /// Seed for the keep-warm access generator.
    pub seed: u64,
    /// Hot passes per job.
    pub hot_reads: usize,
    /// Measurement budget, in milliseconds of task time.
    pub runtime_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            wss_kb: params::WSS_KB,
            cache_kb: params::CACHESIZE_KB,
            capacity: params::DATAPOINTS,
            read_ratio: params::READRATIO,
            seed: params::SEEDVAL,
            hot_reads: params::REFTOTAL,
            runtime_ms: params::SIMRUNTIME_MS,
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No job has been released yet.
    WaitingForJob,
    /// A new job started; cold and hot passes were recorded on `slot`.
    NewJob { slot: usize },
    /// The task was preempted or migrated; one pass was recorded.
    Event { kind: AccessKind },
    /// Nothing changed; the working set was kept warm.
    KeepWarm,
}

/// Running totals for the end-of-run summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCounts {
    pub jobs: u64,
    pub events: u64,
    pub suspect: u64,
    pub keep_warm: u64,
}

/// The measurement state machine.
pub struct Probe<S, C> {
    source: S,
    counter: C,
    mask: InterruptMask,
    sets: WorkingSets,
    ring: SampleRing<Sample>,
    rng: StdRng,
    config: ProbeConfig,
    /// Status page as of the last new job or event.
    current: ScheduleSnapshot,
    /// Working set of the current job, once there is one.
    slot: Option<usize>,
    counts: ProbeCounts,
}

impl<S: StatusSource, C: CycleCounter> Probe<S, C> {
    /// Allocate the working sets and sample storage for a run.
    ///
    /// # Arguments
    ///
    /// * `source` - Status page of the task
    /// * `counter` - Cycle counter used for timing
    /// * `mask` - Interrupt mask held around each timed pass
    /// * `config` - Run parameters
    pub fn new(source: S, counter: C, mask: InterruptMask, config: ProbeConfig) -> Result<Self> {
        if config.read_ratio > 100 {
            return Err(anyhow!("read ratio {}% is above 100%", config.read_ratio));
        }
        let count = params::num_working_sets(config.cache_kb, config.wss_kb).ok_or_else(|| {
            anyhow!(
                "cache size {} KiB is too large for {} KiB working sets",
                config.cache_kb,
                config.wss_kb
            )
        })?;
        let sets = WorkingSets::new(config.wss_kb, count)?;
        let ring = SampleRing::new(config.capacity)?;
        debug!(
            "probe: {count} working sets of {} KiB, {} samples, interrupts masked: {}",
            config.wss_kb,
            config.capacity,
            mask.is_active()
        );
        Ok(Self {
            source,
            counter,
            mask,
            sets,
            ring,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            current: ScheduleSnapshot::default(),
            slot: None,
            counts: ProbeCounts::default(),
        })
    }

    /// Poll the status page once and act on it.
    pub fn step(&mut self) -> Step {
        let now = self.source.snapshot();
        if now.job_count != self.current.job_count {
            self.current = now;
            let slot = (now.job_count % self.sets.count() as u64) as usize;
            self.slot = Some(slot);
            self.counts.jobs += 1;
            self.record(slot, AccessKind::cold, 0);
            for _ in 0..self.config.hot_reads {
                self.record(slot, AccessKind::hot, 0);
            }
            return Step::NewJob { slot };
        }

        let Some(slot) = self.slot else {
            return Step::WaitingForJob;
        };
        if now.sched_count != self.current.sched_count || now.cpu != self.current.cpu {
            self.current = now;
            self.counts.events += 1;
            let kind = self.record(slot, AccessKind::event, now.preemption_length());
            Step::Event { kind }
        } else {
            self.keep_warm(slot);
            Step::KeepWarm
        }
    }

    /// Poll until the task has used up its measurement budget.
    ///
    /// # Arguments
    ///
    /// * `period_ms` - Period of the task; the budget is counted in jobs
    pub fn run(&mut self, period_ms: u64) -> Result<()> {
        if period_ms == 0 {
            return Err(anyhow!("task period must be at least 1 ms"));
        }
        info!(
            "measuring for {} ms of task time (period {period_ms} ms)",
            self.config.runtime_ms
        );
        while self.current.job_count.saturating_mul(period_ms) < self.config.runtime_ms {
            self.step();
        }
        Ok(())
    }

    /// Time one pass over `slot` and record it.
    fn record(
        &mut self,
        slot: usize,
        kind: fn(bool) -> AccessKind,
        preemption_length: u64,
    ) -> AccessKind {
        let (timestamp, elapsed_cycles) = self.measure(slot);
        let after = self.source.snapshot();
        let kind = kind(self.current.same_window(&after));
        if !kind.is_valid() {
            self.counts.suspect += 1;
        }
        self.ring.push(Sample {
            timestamp,
            kind,
            elapsed_cycles,
            cpu: self.current.cpu,
            job_count: self.current.job_count,
            sched_count: self.current.sched_count,
            last_rt_task: self.current.last_rt_task,
            preemption_length,
        });
        kind
    }

    fn measure(&mut self, slot: usize) -> (u64, u64) {
        let _masked = self.mask.hold();
        let start = self.counter.now();
        self.sets.touch(slot);
        let end = self.counter.now();
        (end, end.wrapping_sub(start))
    }

    fn keep_warm(&mut self, slot: usize) {
        self.counts.keep_warm += 1;
        let read = self.rng.gen_range(0..100) < self.config.read_ratio;
        let offset = self.rng.gen_range(0..self.sets.words_per_set());
        if read {
            std::hint::black_box(self.sets.read_word(slot, offset));
        } else {
            self.sets.write_word(slot, offset, offset as u32);
        }
    }

    /// Status page as of the last new job or event.
    pub fn current(&self) -> ScheduleSnapshot {
        self.current
    }

    pub fn counts(&self) -> ProbeCounts {
        self.counts
    }

    /// Whether older samples have been overwritten.
    pub fn is_wrapped(&self) -> bool {
        self.ring.is_wrapped()
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> Vec<Sample> {
        self.ring.to_vec()
    }

    /// Append the retained samples to the trace opened by `writer`.
    ///
    /// # Returns
    ///
    /// The number of samples written.
    pub fn finish(&self, mut writer: TraceWriter) -> Result<usize> {
        if self.ring.is_empty() {
            warn!("no samples recorded");
        } else if self.ring.is_wrapped() {
            warn!(
                "sample storage wrapped; keeping the last {} samples",
                self.ring.capacity()
            );
        }
        writer.append_samples(&self.samples())?;
        let counts = self.counts;
        info!(
            "{} jobs, {} events, {} suspect passes, {} keep-warm accesses, {} samples written to {}",
            counts.jobs,
            counts.events,
            counts.suspect,
            counts.keep_warm,
            self.ring.len(),
            writer.path().display()
        );
        Ok(self.ring.len())
    }
}

/// Measure for `config.runtime_ms` of task time and append the samples to
/// `output`.
///
/// The output is opened before anything is allocated or measured, so an
/// unusable path fails the run up front.
///
/// # Arguments
///
/// * `output` - Trace file to append to
/// * `source` - Status page of the task
/// * `counter` - Cycle counter used for timing
/// * `mask` - Interrupt mask held around each timed pass
/// * `config` - Run parameters
/// * `period_ms` - Period of the task
///
/// # Returns
///
/// The number of samples written.
pub fn measure<S: StatusSource, C: CycleCounter>(
    output: &Path,
    source: S,
    counter: C,
    mask: InterruptMask,
    config: ProbeConfig,
    period_ms: u64,
) -> Result<usize> {
    let writer = TraceWriter::create(output)?;
    let mut probe = Probe::new(source, counter, mask, config)?;
    probe.run(period_ms)?;
    probe.finish(writer)
}

/// Process-level preparation for a measurement run.
#[derive(Debug, Default, Clone)]
pub struct Setup {
    /// CPU to pin the task to.
    pub cpu: Option<usize>,
    /// SCHED_FIFO priority to run at.
    pub fifo_priority: Option<i32>,
}

impl Setup {
    /// Lock memory and apply the requested placement and policy.
    ///
    /// Every step is required; the first failure aborts the run.
    pub fn apply(&self) -> Result<()> {
        Sched::lock_memory()?;
        if let Some(cpu) = self.cpu {
            Sched::pin_to_cpu(cpu)?;
            debug!("pinned to cpu {cpu}");
        }
        if let Some(priority) = self.fifo_priority {
            Sched::set_scheduler(libc::SCHED_FIFO, priority)?;
            debug!("running SCHED_FIFO at priority {priority}");
        }
        Ok(())
    }
}

/// Log the kernel's view of the run, to cross-check against the trace.
pub fn log_kernel_view() {
    match Sched::get_current_thread_stats() {
        Ok(stats) => info!(
            "kernel view: {} migrations, {} switches ({} voluntary, {} involuntary, {} preemptions), cpu time {:?}",
            stats.nr_migrations,
            stats.nr_switches,
            stats.nr_voluntary_switches,
            stats.nr_involuntary_switches,
            stats.nr_preemptions,
            stats.user_time + stats.system_time
        ),
        Err(e) => debug!("kernel scheduling statistics unavailable: {e:#}"),
    }
}
