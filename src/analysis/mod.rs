//! Offline analysis of probe traces.

pub mod extract;
pub mod report;
pub mod stats;
pub mod topology;
pub mod valid;

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use anyhow::anyhow;
use log::info;
use log::warn;

use crate::analysis::extract::Extraction;
use crate::analysis::extract::extract_file;
use crate::analysis::report::AnalysisConfig;
use crate::analysis::report::BucketLimits;
use crate::analysis::report::Report;
use crate::analysis::report::name_params;
use crate::analysis::topology::CacheTopology;
use crate::analysis::topology::ClassifiedBuckets;
use crate::analysis::valid::ValidOverheads;

/// Overheads recovered from one trace.
#[derive(Debug, Clone)]
pub struct TraceOverheads {
    pub path: PathBuf,
    /// The full replay; `None` when the overheads were reloaded.
    pub extraction: Option<Extraction>,
    pub valid: ValidOverheads,
}

impl TraceOverheads {
    /// Replay a trace, classify its overheads and save them beside it.
    pub fn extract(path: &Path, topology: &dyn CacheTopology, config: &AnalysisConfig) -> Result<Self> {
        let extraction = extract_file(path, config.hot_window)?;
        let buckets = ClassifiedBuckets::classify(&extraction.overheads, topology);
        if buckets.is_empty() {
            warn!("{}: no valid overheads", path.display());
        }
        let valid = ValidOverheads::from_classified(&buckets, config.has_l2_level);
        valid.save(path)?;
        info!(
            "{}: {} records, {} overheads",
            path.display(),
            extraction.records,
            valid.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            extraction: Some(extraction),
            valid,
        })
    }

    /// Reload the overheads saved by an earlier [`TraceOverheads::extract`].
    pub fn load(path: &Path, config: &AnalysisConfig) -> Result<Self> {
        let valid = ValidOverheads::load(path, config.has_l2_level)?;
        if valid.is_empty() {
            warn!("{}: no saved overheads", path.display());
        }
        info!("{}: {} saved overheads", path.display(), valid.len());
        Ok(Self {
            path: path.to_path_buf(),
            extraction: None,
            valid,
        })
    }

    pub fn report(&self, caps: &BucketLimits, config: &AnalysisConfig) -> Report {
        Report::build(&self.path, &self.valid, self.extraction.as_ref(), caps, config)
    }
}

/// Extract, classify and summarise one trace.
pub fn analyze(path: &Path, topology: &dyn CacheTopology, config: &AnalysisConfig) -> Result<Report> {
    let trace = TraceOverheads::extract(path, topology, config)?;
    Ok(trace.report(&BucketLimits::default(), config))
}

/// How a batch of traces is analysed.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchOptions {
    /// Cap every bucket at the sample counts of the trace with the fewest
    /// preemption samples in its working-set group.
    pub autocap: bool,
    /// Reload saved overheads instead of replaying the traces.
    pub read_valid: bool,
}

/// Sample counts of the trace with the fewest preemption samples.
///
/// The first such trace wins a tie. Buckets the trace does not have are left
/// uncapped.
pub fn autocap_limits(traces: &[TraceOverheads]) -> BucketLimits {
    traces
        .iter()
        .map(|t| t.valid.counts())
        .min_by_key(|counts| counts.preemption.unwrap_or(0))
        .unwrap_or_default()
}

/// Analyse traces in order, grouping consecutive traces of the same working
/// set size.
///
/// # Arguments
///
/// * `paths` - Traces, sorted so that traces of one working set size are
///   adjacent
/// * `topology` - Cache topology of the measured machine
/// * `config` - Units, limits and filtering
/// * `options` - Capping and reloading
///
/// # Returns
///
/// One report per trace, in input order.
pub fn analyze_batch(
    paths: &[PathBuf],
    topology: &dyn CacheTopology,
    config: &AnalysisConfig,
    options: BatchOptions,
) -> Result<Vec<Report>> {
    // The saved overheads do not record the per-group minimum.
    if options.autocap && options.read_valid {
        return Err(anyhow!("autocap cannot be combined with reading saved overheads"));
    }

    let mut reports = Vec::with_capacity(paths.len());
    for group in paths.chunk_by(|a, b| name_params(a).get("wss") == name_params(b).get("wss")) {
        let mut traces = Vec::with_capacity(group.len());
        for path in group {
            if path.extension().is_none_or(|ext| ext != "raw") {
                warn!("{} does not look like a .raw trace", path.display());
            }
            traces.push(if options.read_valid {
                TraceOverheads::load(path, config)?
            } else {
                TraceOverheads::extract(path, topology, config)?
            });
        }

        let caps = if options.autocap {
            let caps = autocap_limits(&traces);
            info!("capping statistics at {caps:?}");
            caps
        } else {
            BucketLimits::default()
        };
        reports.extend(traces.iter().map(|t| t.report(&caps, config)));
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::analysis::topology::Bucket;
    use crate::analysis::topology::InterleavedTopology;
    use crate::analysis::valid::valid_path;
    use crate::trace;
    use crate::trace::AccessKind;
    use crate::trace::SerializedSample;

    fn job(cpu: u32, event_cpu: u32, event_cost: u64) -> Vec<SerializedSample> {
        vec![
            SerializedSample::new(AccessKind::ColdValid, 5_000, cpu, 0),
            SerializedSample::new(AccessKind::HotValid, 1_000, cpu, 0),
            SerializedSample::new(AccessKind::HotValid, 900, cpu, 0),
            SerializedSample::new(AccessKind::EventValid, event_cost, event_cpu, 10_000),
        ]
    }

    /// A trace with `preemptions` preemptions followed by one migration of
    /// each kind.
    fn write_trace(path: &Path, preemptions: usize) -> Result<()> {
        let mut records = Vec::new();
        for i in 0..preemptions {
            records.extend(job(1, 1, 1_900 + 100 * i as u64));
        }
        records.extend(job(1, 5, 2_900));
        records.extend(job(1, 9, 2_900));
        records.extend(job(1, 2, 2_900));
        trace::write(path, &records)
    }

    fn cycles() -> AnalysisConfig {
        AnalysisConfig {
            cpu_mhz: 1.0,
            unit: "cycles",
            ..Default::default()
        }
    }

    #[test]
    fn test_analyze_trace() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("pm_wss=64_tss=4.raw");
        write_trace(&path, 1)?;

        let topo = InterleavedTopology::new(2, 4)?;
        let report = analyze(&path, &topo, &cycles())?;
        assert_eq!(report.records, 16);
        assert_eq!(report.overheads, 4);
        assert!(!report.reloaded);
        assert_eq!(report.buckets[0].summary.max, 1_000.0);
        for b in &report.buckets[1..] {
            assert_eq!(b.samples, 1, "{}", b.bucket);
            assert_eq!(b.summary.max, 2_000.0);
        }
        assert_eq!(report.buckets[1].bucket, Bucket::SameL2);
        assert!(valid_path(&path, Bucket::OffChip).exists());
        Ok(())
    }

    #[test]
    fn test_autocap_uses_fewest_preemptions() -> Result<()> {
        let dir = TempDir::new()?;
        let paths: Vec<PathBuf> = [("64", 4, 5), ("64", 20, 3), ("64", 40, 4), ("128", 4, 1)]
            .iter()
            .map(|(wss, tss, preemptions)| -> Result<PathBuf> {
                let path = dir.path().join(format!("pm_wss={wss}_tss={tss}.raw"));
                write_trace(&path, *preemptions)?;
                Ok(path)
            })
            .collect::<Result<_>>()?;

        let topo = InterleavedTopology::new(2, 4)?;
        let options = BatchOptions {
            autocap: true,
            ..Default::default()
        };
        let reports = analyze_batch(&paths, &topo, &cycles(), options)?;
        assert_eq!(reports.len(), 4);

        // Within the wss=64 group the second trace has the fewest preemptions.
        for report in &reports[..3] {
            assert_eq!(report.buckets[0].used, 3);
            assert_eq!(report.buckets[0].summary.max, 1_200.0);
            assert_eq!(report.buckets[3].used, 1);
        }
        assert_eq!(reports[0].buckets[0].samples, 5);
        // The wss=128 group is capped on its own.
        assert_eq!(reports[3].buckets[0].used, 1);
        Ok(())
    }

    #[test]
    fn test_reload_saved_overheads() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("pm_wss=64_tss=4.raw");
        write_trace(&path, 2)?;
        let topo = InterleavedTopology::new(2, 4)?;
        let config = cycles();
        let paths = vec![path.clone()];

        let extracted = analyze_batch(&paths, &topo, &config, BatchOptions::default())?;
        std::fs::remove_file(&path)?;
        let options = BatchOptions {
            read_valid: true,
            ..Default::default()
        };
        let reloaded = analyze_batch(&paths, &topo, &config, options)?;

        assert!(reloaded[0].reloaded);
        assert_eq!(reloaded[0].overheads, extracted[0].overheads);
        for (a, b) in extracted[0].buckets.iter().zip(&reloaded[0].buckets) {
            assert_eq!(a.bucket, b.bucket);
            assert_eq!(a.summary, b.summary);
        }
        Ok(())
    }

    #[test]
    fn test_autocap_with_reload_is_rejected() {
        let topo = InterleavedTopology::new(2, 4).unwrap();
        let options = BatchOptions {
            autocap: true,
            read_valid: true,
        };
        let paths = vec![PathBuf::from("pm_wss=64_tss=4.raw")];
        assert!(analyze_batch(&paths, &topo, &cycles(), options).is_err());
    }

    #[test]
    fn test_autocap_limits_empty() {
        let caps = autocap_limits(&[]);
        assert_eq!(caps.preemption, None);
    }
}
