//! Mapping of CPU pairs onto the cache level they share.
//!
//! A migration between two CPUs costs more the further out the closest
//! shared cache is. Machines number their CPUs differently, so the mapping
//! is a strategy: two arithmetic layouts configured by core counts, and one
//! that reads the cache hierarchy the kernel describes in sysfs.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use serde::Serialize;

use crate::analysis::extract::OverheadSample;

/// Where an overhead sample falls in the cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Bucket {
    /// Resumed on the same CPU.
    Preemption,
    /// Moved between CPUs sharing an L2 cache.
    SameL2,
    /// Moved between CPUs sharing only an L3 cache or the chip.
    SameChipOrL3,
    /// Moved to another chip.
    OffChip,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Bucket::Preemption,
        Bucket::SameL2,
        Bucket::SameChipOrL3,
        Bucket::OffChip,
    ];

    /// Short name used in reports and output file names.
    pub fn label(self) -> &'static str {
        match self {
            Bucket::Preemption => "preemption",
            Bucket::SameL2 => "l2cache",
            Bucket::SameChipOrL3 => "onchip",
            Bucket::OffChip => "offchip",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A strategy for classifying a move from `last` to `curr`.
pub trait CacheTopology {
    /// Classify a resume on `curr` after last running on `last`.
    fn classify(&self, curr: u32, last: u32) -> Bucket;

    /// Whether the machine has a private-L2 level distinct from the chip.
    fn has_l2_level(&self) -> bool {
        true
    }
}

/// CPUs numbered round-robin across chips: CPU `n` lives on chip
/// `n % num_chips`, and consecutive CPUs of one chip share an L2 in groups of
/// `cores_per_l2`.
#[derive(Debug, Clone, Copy)]
pub struct InterleavedTopology {
    cores_per_l2: u32,
    num_chips: u32,
}

impl InterleavedTopology {
    /// # Arguments
    ///
    /// * `cores_per_l2` - Cores sharing an L2; 0 if every core of a chip shares
    ///   its L2 (no separate L3 level)
    /// * `num_chips` - Number of physical packages
    pub fn new(cores_per_l2: u32, num_chips: u32) -> Result<Self> {
        if num_chips == 0 {
            return Err(anyhow!("number of chips must be positive"));
        }
        Ok(Self {
            cores_per_l2,
            num_chips,
        })
    }
}

impl CacheTopology for InterleavedTopology {
    fn classify(&self, curr: u32, last: u32) -> Bucket {
        if curr == last {
            return Bucket::Preemption;
        }
        if curr % self.num_chips != last % self.num_chips {
            return Bucket::OffChip;
        }
        if self.cores_per_l2 > 0
            && (curr / self.num_chips) / self.cores_per_l2
                == (last / self.num_chips) / self.cores_per_l2
        {
            Bucket::SameL2
        } else {
            Bucket::SameChipOrL3
        }
    }

    fn has_l2_level(&self) -> bool {
        self.cores_per_l2 > 0
    }
}

/// CPUs numbered chip by chip: the first `cores_per_chip` CPUs are on chip
/// 0, and so on.
#[derive(Debug, Clone, Copy)]
pub struct LinearTopology {
    cores_per_l2: u32,
    cores_per_chip: u32,
}

impl LinearTopology {
    pub fn new(cores_per_l2: u32, cores_per_chip: u32) -> Result<Self> {
        if cores_per_chip == 0 {
            return Err(anyhow!("cores per chip must be positive"));
        }
        Ok(Self {
            cores_per_l2,
            cores_per_chip,
        })
    }
}

impl CacheTopology for LinearTopology {
    fn classify(&self, curr: u32, last: u32) -> Bucket {
        if curr == last {
            Bucket::Preemption
        } else if self.cores_per_l2 > 0 && curr / self.cores_per_l2 == last / self.cores_per_l2 {
            Bucket::SameL2
        } else if curr / self.cores_per_chip == last / self.cores_per_chip {
            Bucket::SameChipOrL3
        } else {
            Bucket::OffChip
        }
    }

    fn has_l2_level(&self) -> bool {
        self.cores_per_l2 > 0
    }
}

/// One data or unified cache of a CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub level: u32,
    pub shared_cpus: Vec<u32>,
}

/// Cache hierarchy as described by the kernel under
/// `cpuN/cache/indexM/{level,type,shared_cpu_list}`.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    caches: BTreeMap<u32, Vec<CacheInfo>>,
}

impl SysfsTopology {
    pub const SYSFS_ROOT: &'static str = "/sys/devices/system/cpu";

    /// Read the running system's cache hierarchy.
    pub fn system() -> Result<Self> {
        Self::from_root(Path::new(Self::SYSFS_ROOT))
    }

    /// Read a cache hierarchy from a sysfs-shaped directory tree.
    pub fn from_root(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root)
            .with_context(|| format!("unable to list cpus under {}", root.display()))?;

        let mut caches = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(cpu) = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let cache_dir = entry.path().join("cache");
            if !cache_dir.is_dir() {
                continue;
            }
            caches.insert(cpu, read_cpu_caches(&cache_dir)?);
        }

        if caches.is_empty() {
            return Err(anyhow!("no cache topology found under {}", root.display()));
        }
        debug!("cache topology for {} cpus from {}", caches.len(), root.display());
        Ok(Self { caches })
    }

    /// Number of CPUs described.
    pub fn cpus(&self) -> usize {
        self.caches.len()
    }

    /// Data and unified caches of `cpu`.
    pub fn caches(&self, cpu: u32) -> &[CacheInfo] {
        self.caches.get(&cpu).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn read_cpu_caches(cache_dir: &Path) -> Result<Vec<CacheInfo>> {
    let mut out = Vec::new();
    let entries = fs::read_dir(cache_dir)
        .with_context(|| format!("unable to list {}", cache_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("index") {
            continue;
        }
        let dir = entry.path();
        let read = |attr: &str| -> Result<String> {
            let path = dir.join(attr);
            let value = fs::read_to_string(&path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            Ok(value.trim().to_string())
        };

        let kind = read("type")?;
        if kind == "Instruction" || kind == "Unknown" {
            continue;
        }
        let level = read("level")?;
        let level = level
            .parse::<u32>()
            .with_context(|| format!("bad cache level {level:?} in {}", dir.display()))?;
        let shared_cpus = parse_cpu_list(&read("shared_cpu_list")?)
            .with_context(|| format!("bad shared_cpu_list in {}", dir.display()))?;
        out.push(CacheInfo { level, shared_cpus });
    }
    out.sort_by_key(|c| c.level);
    Ok(out)
}

impl CacheTopology for SysfsTopology {
    fn classify(&self, curr: u32, last: u32) -> Bucket {
        if curr == last {
            return Bucket::Preemption;
        }
        let shared = self
            .caches(last)
            .iter()
            .filter(|c| c.shared_cpus.contains(&curr))
            .map(|c| c.level)
            .min();
        match shared {
            Some(level) if level <= 2 => Bucket::SameL2,
            Some(_) => Bucket::SameChipOrL3,
            None => Bucket::OffChip,
        }
    }
}

/// Parse a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = lo.trim().parse::<u32>()?;
                let hi = hi.trim().parse::<u32>()?;
                if hi < lo {
                    return Err(anyhow!("descending cpu range {part}"));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse::<u32>()?),
        }
    }
    Ok(cpus)
}

/// Overhead samples split by cache level.
#[derive(Debug, Default, Clone)]
pub struct ClassifiedBuckets {
    buckets: [Vec<OverheadSample>; 4],
}

impl ClassifiedBuckets {
    /// Classify every sample, preserving order within each bucket.
    pub fn classify(samples: &[OverheadSample], topology: &dyn CacheTopology) -> Self {
        let mut out = Self::default();
        for sample in samples {
            let bucket = topology.classify(sample.curr_cpu, sample.last_cpu);
            out.buckets[bucket.index()].push(*sample);
        }
        out
    }

    pub fn get(&self, bucket: Bucket) -> &[OverheadSample] {
        &self.buckets[bucket.index()]
    }

    /// Total samples across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Bucket, &[OverheadSample])> {
        Bucket::ALL.into_iter().map(|b| (b, self.get(b)))
    }
}
