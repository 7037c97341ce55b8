//! Analysis results and their text, CSV and JSON renderings.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use serde::Serialize;

use crate::analysis::extract::Extraction;
use crate::analysis::stats::BucketSummary;
use crate::analysis::stats::Distribution;
use crate::analysis::stats::Estimates;
use crate::analysis::stats::RoughStats;
use crate::analysis::stats::iqr_filter;
use crate::analysis::topology::Bucket;
use crate::analysis::valid::ValidOverheads;
use crate::params;

/// Optional caps on how many samples of each bucket enter the statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketLimits {
    pub preemption: Option<usize>,
    pub l2cache: Option<usize>,
    pub onchip: Option<usize>,
    pub offchip: Option<usize>,
}

impl BucketLimits {
    /// Limits from `self`, falling back to `other` where unset.
    pub fn or(self, other: BucketLimits) -> BucketLimits {
        BucketLimits {
            preemption: self.preemption.or(other.preemption),
            l2cache: self.l2cache.or(other.l2cache),
            onchip: self.onchip.or(other.onchip),
            offchip: self.offchip.or(other.offchip),
        }
    }

    pub fn get(&self, bucket: Bucket) -> Option<usize> {
        match bucket {
            Bucket::Preemption => self.preemption,
            Bucket::SameL2 => self.l2cache,
            Bucket::SameChipOrL3 => self.onchip,
            Bucket::OffChip => self.offchip,
        }
    }
}

/// How to turn an extraction into a report.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Hot records per job in the trace.
    pub hot_window: usize,
    /// Divisor applied to every cycle count; 1 reports raw cycles.
    pub cpu_mhz: f64,
    /// Unit name matching `cpu_mhz`.
    pub unit: &'static str,
    pub limits: BucketLimits,
    /// Interquartile extent for outlier removal; no removal when `None`.
    pub iqr_extent: Option<f64>,
    /// Whether the topology distinguishes shared-L2 migrations.
    pub has_l2_level: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            hot_window: params::REFTOTAL,
            cpu_mhz: params::DEFAULT_CPU_MHZ,
            unit: "us",
            limits: BucketLimits::default(),
            iqr_extent: None,
            has_l2_level: true,
        }
    }
}

impl AnalysisConfig {
    /// Reject scales and extents that would turn every statistic into NaN.
    pub fn validate(&self) -> Result<()> {
        if !(self.cpu_mhz.is_finite() && self.cpu_mhz > 0.0) {
            return Err(anyhow!(
                "clock frequency must be positive and finite, got {}",
                self.cpu_mhz
            ));
        }
        if let Some(extent) = self.iqr_extent {
            if !(extent.is_finite() && extent >= 0.0) {
                return Err(anyhow!(
                    "interquartile extent must be finite and not negative, got {extent}"
                ));
            }
        }
        Ok(())
    }
}

/// Rough statistics of one valid-sample population.
#[derive(Debug, Clone, Serialize)]
pub struct PopulationReport {
    pub label: &'static str,
    pub stats: Option<RoughStats>,
}

/// Statistics of one overhead bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    pub bucket: Bucket,
    /// Samples classified into the bucket.
    pub samples: usize,
    /// Samples left after outlier removal and limits.
    pub used: usize,
    pub summary: BucketSummary,
    pub rough: Option<RoughStats>,
    #[serde(skip)]
    pub estimates: Option<Estimates>,
}

/// The outcome of analysing one trace.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub trace: String,
    /// Whether the overheads were reloaded from saved valid data rather
    /// than extracted from the trace.
    pub reloaded: bool,
    /// Parameters decoded from the trace file name, such as `wss` and `tss`.
    pub params: BTreeMap<String, String>,
    pub unit: &'static str,
    pub cpu_mhz: f64,
    pub records: usize,
    pub unknown: usize,
    pub overheads: usize,
    pub populations: Vec<PopulationReport>,
    pub buckets: Vec<BucketReport>,
}

/// Decode `key=value` pairs from an underscore-separated file name, e.g.
/// `res_plugin=GSN-EDF_wss=1024_tss=20.raw`.
pub fn name_params(path: &Path) -> BTreeMap<String, String> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.split('_')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Report {
    /// Compute all statistics for a trace.
    ///
    /// # Arguments
    ///
    /// * `trace` - Trace the overheads came from
    /// * `valid` - Overheads by cache level
    /// * `extraction` - Populations recovered from the trace; `None` when
    ///   the overheads were reloaded
    /// * `caps` - Sample caps applied where `config` sets no limit
    /// * `config` - Units, limits and filtering
    pub fn build(
        trace: &Path,
        valid: &ValidOverheads,
        extraction: Option<&Extraction>,
        caps: &BucketLimits,
        config: &AnalysisConfig,
    ) -> Self {
        let population = |label, values: &[u64]| PopulationReport {
            label,
            stats: RoughStats::from_cycles(values, config.cpu_mhz),
        };
        let populations = extraction
            .map(|e| {
                vec![
                    population("Cold cache", &e.cold),
                    population("Hot cache", &e.hot),
                    population("After preemption", &e.events),
                ]
            })
            .unwrap_or_default();
        let limits = config.limits.or(*caps);

        let buckets = valid
            .iter()
            .map(|(bucket, samples)| {
                let mut values: Vec<f64> = samples.iter().map(|v| *v as f64).collect();
                if let Some(extent) = config.iqr_extent {
                    values = iqr_filter(&values, extent);
                }
                if let Some(limit) = limits.get(bucket) {
                    values.truncate(limit);
                }
                debug!("{bucket}: {} samples, {} used", samples.len(), values.len());

                let estimates = (!values.is_empty()).then(|| {
                    let mut dist = Distribution::new();
                    dist.add_all(&values.iter().map(|v| v / config.cpu_mhz).collect::<Vec<_>>());
                    dist.estimates()
                });
                BucketReport {
                    bucket,
                    samples: samples.len(),
                    used: values.len(),
                    summary: BucketSummary::compute(&values, config.cpu_mhz),
                    rough: RoughStats::compute(&values, config.cpu_mhz),
                    estimates,
                }
            })
            .collect();

        Self {
            trace: trace.display().to_string(),
            reloaded: extraction.is_none(),
            params: name_params(trace),
            unit: config.unit,
            cpu_mhz: config.cpu_mhz,
            records: extraction.map_or(0, |e| e.records),
            unknown: extraction.map_or(0, |e| e.unknown),
            overheads: valid.len(),
            populations,
            buckets,
        }
    }

    /// Human-readable summary. `verbose` adds a distribution line per bucket.
    pub fn render(&self, verbose: bool) -> String {
        let mut out = String::new();
        if self.reloaded {
            let _ = writeln!(
                out,
                "# {}: {} saved overheads, times in {}",
                self.trace, self.overheads, self.unit
            );
        } else {
            let _ = writeln!(
                out,
                "# {}: {} records ({} unknown), {} overheads, times in {}",
                self.trace, self.records, self.unknown, self.overheads, self.unit
            );
        }
        for p in &self.populations {
            match &p.stats {
                Some(stats) => {
                    let _ = writeln!(out, "# {}: {stats}", p.label);
                }
                None => {
                    let _ = writeln!(out, "# {}: no samples", p.label);
                }
            }
        }
        if !self.populations.is_empty() {
            let count = |i: usize| {
                self.populations
                    .get(i)
                    .and_then(|p| p.stats)
                    .map_or(0, |s| s.count)
            };
            let _ = writeln!(
                out,
                "## Nsamples(c,h,p): {}, {}, {}",
                count(0),
                count(1),
                count(2)
            );
        }
        for b in &self.buckets {
            let _ = writeln!(
                out,
                "{:<12} samples={:<7} used={:<7} max={:.5} avg={:.5} std={:.5}",
                b.bucket.label(),
                b.samples,
                b.used,
                b.summary.max,
                b.summary.avg,
                b.summary.std
            );
            if verbose {
                if let Some(estimates) = &b.estimates {
                    let _ = writeln!(out, "    {}", estimates.visualize(None));
                }
            }
        }
        out
    }

    /// One CSV row for a bucket: `tss, max, avg, avg - std, avg + std`.
    pub fn csv_row(&self, bucket: &BucketReport) -> String {
        let tss = self.params.get("tss").map_or("-", String::as_str);
        let s = &bucket.summary;
        format!(
            "{tss}, {:.5}, {:.5}, {:.5}, {:.5}",
            s.max,
            s.avg,
            s.avg - s.std,
            s.avg + s.std
        )
    }

    /// Append one row per bucket to `pm_wss=<wss>_ovd=<bucket>.csv` in `dir`.
    ///
    /// # Returns
    ///
    /// The files written.
    pub fn append_csv(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let wss = self.params.get("wss").map_or("unknown", String::as_str);
        let mut written = Vec::with_capacity(self.buckets.len());
        for bucket in &self.buckets {
            let path = dir.join(format!("pm_wss={wss}_ovd={}.csv", bucket.bucket.label()));
            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .with_context(|| format!("unable to open {}", path.display()))?;
            writeln!(file, "{}", self.csv_row(bucket))
                .with_context(|| format!("unable to write {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "unable to serialize report")
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::analysis::extract::OverheadSample;
    use crate::analysis::topology::ClassifiedBuckets;
    use crate::analysis::topology::InterleavedTopology;

    fn overhead(curr_cpu: u32, last_cpu: u32, overhead: i64) -> OverheadSample {
        OverheadSample {
            curr_cpu,
            last_cpu,
            overhead,
            length: 1,
        }
    }

    fn extraction() -> Extraction {
        let mut overheads: Vec<OverheadSample> = (1..=10).map(|i| overhead(0, 0, i * 100)).collect();
        overheads.push(overhead(0, 0, 100_000));
        overheads.push(overhead(1, 2, 700));
        Extraction {
            cold: vec![1000, 2000, 3000, 4000],
            hot: vec![100, 100, 100],
            events: vec![500; 12],
            records: 19,
            unknown: 0,
            overheads,
        }
    }

    fn valid(extraction: &Extraction, config: &AnalysisConfig) -> ValidOverheads {
        let topo = InterleavedTopology::new(2, 4).unwrap();
        let buckets = ClassifiedBuckets::classify(&extraction.overheads, &topo);
        ValidOverheads::from_classified(&buckets, config.has_l2_level)
    }

    fn capped_report(config: &AnalysisConfig, caps: &BucketLimits) -> Report {
        let extraction = extraction();
        Report::build(
            Path::new("/tmp/pm_wss=1024_tss=20.raw"),
            &valid(&extraction, config),
            Some(&extraction),
            caps,
            config,
        )
    }

    fn report(config: &AnalysisConfig) -> Report {
        capped_report(config, &BucketLimits::default())
    }

    fn cycles() -> AnalysisConfig {
        AnalysisConfig {
            cpu_mhz: 1.0,
            unit: "cycles",
            ..Default::default()
        }
    }

    #[test]
    fn test_name_params() {
        let params = name_params(Path::new("out/res_plugin=GSN-EDF_wss=1024_tss=20.raw"));
        assert_eq!(params.get("plugin").map(String::as_str), Some("GSN-EDF"));
        assert_eq!(params.get("wss").map(String::as_str), Some("1024"));
        assert_eq!(params.get("tss").map(String::as_str), Some("20"));
        assert!(name_params(Path::new("pm.raw")).is_empty());
    }

    #[test]
    fn test_populations() {
        let report = report(&cycles());
        let cold = report.populations[0].stats.unwrap();
        assert_eq!(cold.count, 4);
        assert_eq!(cold.max, 3000.0);
        assert!(report.populations.iter().all(|p| p.stats.is_some()));
        assert!(report.render(false).contains("## Nsamples(c,h,p): 4, 3, 12"));
    }

    #[test]
    fn test_buckets() {
        let report = report(&cycles());
        assert_eq!(report.buckets.len(), 4);
        let preempt = &report.buckets[0];
        assert_eq!(preempt.bucket, Bucket::Preemption);
        assert_eq!(preempt.samples, 11);
        assert_eq!(preempt.used, 11);
        assert_eq!(preempt.summary.max, 100_000.0);
        let offchip = &report.buckets[3];
        assert_eq!(offchip.samples, 1);
        assert_eq!(offchip.summary.avg, 700.0);
        assert_eq!(report.buckets[1].used, 0);
        assert_eq!(report.buckets[1].summary, BucketSummary::default());
    }

    #[test]
    fn test_outliers_and_limits() {
        let config = AnalysisConfig {
            iqr_extent: Some(1.5),
            limits: BucketLimits {
                preemption: Some(4),
                ..Default::default()
            },
            ..cycles()
        };
        let report = report(&config);
        let preempt = &report.buckets[0];
        assert_eq!(preempt.samples, 11);
        assert_eq!(preempt.used, 4);
        assert_eq!(preempt.summary.max, 400.0);
        assert_eq!(preempt.summary.avg, 250.0);
    }

    #[test]
    fn test_caps_apply_where_no_limit() {
        let config = AnalysisConfig {
            limits: BucketLimits {
                offchip: Some(5),
                ..Default::default()
            },
            ..cycles()
        };
        let caps = BucketLimits {
            preemption: Some(3),
            offchip: Some(0),
            ..Default::default()
        };
        let report = capped_report(&config, &caps);
        assert_eq!(report.buckets[0].used, 3);
        assert_eq!(report.buckets[0].summary.max, 300.0);
        assert_eq!(report.buckets[3].used, 1);
    }

    #[test]
    fn test_reloaded_report() {
        let config = cycles();
        let valid = valid(&extraction(), &config);
        let report = Report::build(
            Path::new("pm_wss=1024_tss=20.raw"),
            &valid,
            None,
            &BucketLimits::default(),
            &config,
        );
        assert!(report.reloaded);
        assert!(report.populations.is_empty());
        assert_eq!(report.overheads, 12);
        assert_eq!(report.buckets[3].summary.avg, 700.0);
        let text = report.render(false);
        assert!(text.contains("12 saved overheads"));
        assert!(!text.contains("Nsamples"));
    }

    #[test]
    fn test_without_l2_level() {
        let config = AnalysisConfig {
            has_l2_level: false,
            ..cycles()
        };
        let report = report(&config);
        assert_eq!(report.buckets.len(), 3);
        assert!(report.buckets.iter().all(|b| b.bucket != Bucket::SameL2));
    }

    #[test]
    fn test_units() {
        let config = AnalysisConfig {
            cpu_mhz: 100.0,
            ..Default::default()
        };
        let report = report(&config);
        assert_eq!(report.buckets[3].summary.avg, 7.0);
        assert_eq!(report.populations[1].stats.unwrap().mean, 1.0);
    }

    #[test]
    fn test_csv() -> Result<()> {
        let dir = TempDir::new()?;
        let report = report(&cycles());
        let files = report.append_csv(dir.path())?;
        report.append_csv(dir.path())?;
        assert_eq!(files.len(), 4);

        let offchip = dir.path().join("pm_wss=1024_ovd=offchip.csv");
        let content = std::fs::read_to_string(offchip)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "20, 700.00000, 700.00000, 700.00000, 700.00000");
        Ok(())
    }

    #[test]
    fn test_json() -> Result<()> {
        let report = report(&cycles());
        let value: serde_json::Value = serde_json::from_str(&report.to_json()?)?;
        assert_eq!(value["records"], 19);
        assert_eq!(value["params"]["wss"], "1024");
        assert_eq!(value["buckets"][0]["bucket"], "Preemption");
        assert_eq!(value["buckets"][0]["samples"], 11);
        Ok(())
    }

    #[test]
    fn test_render_verbose() {
        let text = report(&cycles()).render(true);
        assert!(text.contains("preemption"));
        assert!(text.contains("offchip"));
        assert!(text.contains("# Cold cache: n=4"));
    }

    #[test]
    fn test_validate_config() {
        let with_iqr = |extent| AnalysisConfig {
            iqr_extent: Some(extent),
            ..cycles()
        };
        assert!(cycles().validate().is_ok());
        assert!(with_iqr(0.0).validate().is_ok());
        assert!(with_iqr(f64::INFINITY).validate().is_err());
        assert!(with_iqr(f64::NAN).validate().is_err());
        assert!(with_iqr(-1.0).validate().is_err());

        let zero_clock = AnalysisConfig {
            cpu_mhz: 0.0,
            ..cycles()
        };
        assert!(zero_clock.validate().is_err());
        let infinite_clock = AnalysisConfig {
            cpu_mhz: f64::INFINITY,
            ..cycles()
        };
        assert!(infinite_clock.validate().is_err());
    }
}
