use std::path::PathBuf;

use anyhow::Result;
use anyhow::anyhow;
use clap::ArgAction;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use cpmd::analysis::BatchOptions;
use cpmd::analysis::analyze_batch;
use cpmd::analysis::report::AnalysisConfig;
use cpmd::analysis::report::BucketLimits;
use cpmd::analysis::topology::CacheTopology;
use cpmd::analysis::topology::InterleavedTopology;
use cpmd::analysis::topology::LinearTopology;
use cpmd::analysis::topology::SysfsTopology;
use cpmd::params;
use cpmd::probe::ProbeConfig;
use cpmd::probe::Setup;
use cpmd::probe::log_kernel_view;
use cpmd::probe::measure;
use cpmd::trace;
use cpmd::util::clock::InterruptMask;
use cpmd::util::clock::Tsc;
use cpmd::util::clock::detect_cpu_mhz;
use cpmd::util::sched::Sched;
use cpmd::util::status::StatusPage;
use log::info;
use log::warn;
use nix::unistd::Uid;

/// Command line arguments for the cpmd binary.
#[derive(Parser, Debug)]
#[command(
    name = "cpmd",
    about = "Cache-related preemption and migration delay measurement",
    long_about = "This program measures how much a real-time task pays for losing its cache \
                 when it is preempted or migrated. The probe subcommand runs as the measured \
                 task under a real-time scheduler that exposes a per-task status page, and \
                 appends timed samples to a trace. The analyze subcommand derives overheads \
                 from a trace and classifies them by the cache level shared between the CPUs \
                 involved."
)]
struct Cli {
    /// Log at debug level.
    #[arg(long, short, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure as a real-time task and append samples to a trace.
    Probe(ProbeArgs),
    /// Extract and summarise overheads from traces.
    Analyze(AnalyzeArgs),
    /// Print every record of a trace.
    Dump(DumpArgs),
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Trace file to append samples to.
    output: PathBuf,

    /// Device exposing the scheduler's status page.
    #[arg(long, default_value = params::DEFAULT_STATUS_DEVICE)]
    status_device: PathBuf,

    /// Working set size in KiB.
    #[arg(long, default_value_t = params::WSS_KB)]
    wss: usize,

    /// Size of the largest cache in KiB.
    #[arg(long, default_value_t = params::CACHESIZE_KB)]
    cache_size: usize,

    /// Task period in milliseconds. Read from the kernel when omitted.
    #[arg(long)]
    period_ms: Option<u64>,

    /// Measurement budget in milliseconds of task time.
    #[arg(long, default_value_t = params::SIMRUNTIME_MS)]
    runtime_ms: u64,

    /// Pin the task to this CPU.
    #[arg(long)]
    cpu: Option<usize>,

    /// Run under SCHED_FIFO at this priority.
    #[arg(long)]
    fifo_priority: Option<i32>,

    /// Disable interrupts around each timed pass (needs I/O privilege).
    #[arg(long, action = ArgAction::SetTrue)]
    mask_interrupts: bool,

    /// Skip root check.
    #[arg(long, action = ArgAction::SetTrue)]
    skip_root_check: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TopologyKind {
    /// CPU ids interleaved across chips.
    Interleaved,
    /// CPU ids consecutive within a chip.
    Linear,
    /// Cache sharing read from sysfs.
    Sysfs,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Trace files to analyse.
    #[arg(required = true)]
    traces: Vec<PathBuf>,

    /// How CPU ids map onto caches.
    #[arg(long, value_enum, default_value_t = TopologyKind::Interleaved)]
    topology: TopologyKind,

    /// Cores sharing an L2 cache; 0 if there is no separate L3 level.
    #[arg(long, short = 'l', env = "CPMD_CORES_PER_L2", default_value_t = 2)]
    cores_per_l2: u32,

    /// Number of physical packages (interleaved topology).
    #[arg(long, short = 'p', env = "CPMD_NUM_CHIPS", default_value_t = 4)]
    num_chips: u32,

    /// Cores per physical package (linear topology).
    #[arg(long, env = "CPMD_CORES_PER_CHIP", default_value_t = 6)]
    cores_per_chip: u32,

    /// Root of the cpu directory tree (sysfs topology).
    #[arg(long, default_value = SysfsTopology::SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Clock frequency in MHz used to report microseconds. Detected when omitted.
    #[arg(long, short = 'u', env = "CPMD_CPU_MHZ")]
    cpu_mhz: Option<f64>,

    /// Report raw cycle counts instead of microseconds.
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "cpu_mhz")]
    cycles: bool,

    /// Hot passes recorded per job.
    #[arg(long, default_value_t = params::REFTOTAL)]
    hot_reads: usize,

    /// Use at most this many preemption samples.
    #[arg(long)]
    limit_preempt: Option<usize>,

    /// Use at most this many shared-L2 migration samples.
    #[arg(long)]
    limit_l2: Option<usize>,

    /// Use at most this many on-chip migration samples.
    #[arg(long)]
    limit_onchip: Option<usize>,

    /// Use at most this many off-chip migration samples.
    #[arg(long)]
    limit_offchip: Option<usize>,

    /// Drop overheads outside this many interquartile ranges of the quartiles.
    #[arg(long)]
    iqr: Option<f64>,

    /// Append per-bucket CSV rows to files in this directory.
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    /// Print the report as JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Cap each bucket at the sample counts of the trace with the fewest
    /// preemptions among traces of the same working set size.
    #[arg(long, short = 'a', action = ArgAction::SetTrue)]
    autocap: bool,

    /// Reload overheads saved by an earlier analysis instead of replaying the traces.
    #[arg(long, short = 'r', action = ArgAction::SetTrue, conflicts_with = "autocap")]
    read_valid_data: bool,
}

#[derive(Args, Debug)]
struct DumpArgs {
    /// Trace file to print.
    trace: PathBuf,
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    // Memory locking and real-time policies need root.
    if !(args.skip_root_check || Uid::effective().is_root()) {
        return Err(anyhow!("must run as root"));
    }

    Setup {
        cpu: args.cpu,
        fifo_priority: args.fifo_priority,
    }
    .apply()?;

    let period_ms = match args.period_ms {
        Some(period_ms) => period_ms,
        None => Sched::task_period_ms()?,
    };
    let status = StatusPage::open(&args.status_device)?;
    let mask = if args.mask_interrupts {
        InterruptMask::acquire()
    } else {
        InterruptMask::disabled()
    };

    let config = ProbeConfig {
        wss_kb: args.wss,
        cache_kb: args.cache_size,
        runtime_ms: args.runtime_ms,
        ..Default::default()
    };
    measure(&args.output, status, Tsc, mask, config, period_ms)?;
    log_kernel_view();
    Ok(())
}

fn topology(args: &AnalyzeArgs) -> Result<Box<dyn CacheTopology>> {
    Ok(match args.topology {
        TopologyKind::Interleaved => {
            Box::new(InterleavedTopology::new(args.cores_per_l2, args.num_chips)?)
        }
        TopologyKind::Linear => Box::new(LinearTopology::new(args.cores_per_l2, args.cores_per_chip)?),
        TopologyKind::Sysfs => Box::new(SysfsTopology::from_root(&args.sysfs_root)?),
    })
}

fn run_analyze(args: AnalyzeArgs, verbose: bool) -> Result<()> {
    let (cpu_mhz, unit) = if args.cycles {
        (1.0, "cycles")
    } else {
        let mhz = args.cpu_mhz.or_else(detect_cpu_mhz).unwrap_or_else(|| {
            warn!(
                "cannot detect the clock frequency, assuming {} MHz",
                params::DEFAULT_CPU_MHZ
            );
            params::DEFAULT_CPU_MHZ
        });
        (mhz, "us")
    };

    let topology = topology(&args)?;
    let config = AnalysisConfig {
        hot_window: args.hot_reads,
        cpu_mhz,
        unit,
        limits: BucketLimits {
            preemption: args.limit_preempt,
            l2cache: args.limit_l2,
            onchip: args.limit_onchip,
            offchip: args.limit_offchip,
        },
        iqr_extent: args.iqr,
        has_l2_level: topology.has_l2_level(),
    };
    config.validate()?;

    let options = BatchOptions {
        autocap: args.autocap,
        read_valid: args.read_valid_data,
    };
    for report in analyze_batch(&args.traces, topology.as_ref(), &config, options)? {
        if args.json {
            println!("{}", report.to_json()?);
        } else {
            print!("{}", report.render(verbose));
        }
        if let Some(dir) = &args.csv_dir {
            let files = report.append_csv(dir)?;
            info!("appended {} csv rows under {}", files.len(), dir.display());
        }
    }
    Ok(())
}

fn run_dump(args: DumpArgs) -> Result<()> {
    for record in trace::read(&args.trace)? {
        println!(
            "({}) - ACC {}, CPU {}, PLEN {}",
            record.access_type as char,
            record.elapsed_cycles,
            record.cpu,
            record.preemption_length
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments.
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Command::Probe(args) => run_probe(args),
        Command::Analyze(args) => run_analyze(args, cli.verbose),
        Command::Dump(args) => run_dump(args),
    }
}
