//! Valid overheads persisted beside a trace.
//!
//! Once a trace has been replayed, the overheads of each bucket are written
//! to `<trace stem>_<bucket>.vbin` in the trace's directory as native-endian
//! `i64` values in trace order. Reloading them skips the replay.

use std::collections::BTreeMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use log::debug;

use crate::analysis::report::BucketLimits;
use crate::analysis::topology::Bucket;
use crate::analysis::topology::ClassifiedBuckets;

/// Extension of a persisted bucket.
pub const VALID_EXTENSION: &str = "vbin";

const VALUE_SIZE: usize = std::mem::size_of::<i64>();

/// File holding the valid overheads of `bucket` for `trace`.
pub fn valid_path(trace: &Path, bucket: Bucket) -> PathBuf {
    let stem = trace
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    trace.with_file_name(format!("{stem}_{}.{VALID_EXTENSION}", bucket.label()))
}

/// Overheads of one trace, per bucket, in trace order.
///
/// Only the buckets the topology distinguishes are present.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidOverheads {
    buckets: BTreeMap<Bucket, Vec<i64>>,
}

impl ValidOverheads {
    /// Keep the overhead of every classified sample.
    ///
    /// # Arguments
    ///
    /// * `classified` - Samples split by cache level
    /// * `has_l2_level` - Whether to keep the shared-L2 bucket
    pub fn from_classified(classified: &ClassifiedBuckets, has_l2_level: bool) -> Self {
        let buckets = classified
            .iter()
            .filter(|(bucket, _)| has_l2_level || *bucket != Bucket::SameL2)
            .map(|(bucket, samples)| (bucket, samples.iter().map(|s| s.overhead).collect()))
            .collect();
        Self { buckets }
    }

    pub fn get(&self, bucket: Bucket) -> Option<&[i64]> {
        self.buckets.get(&bucket).map(Vec::as_slice)
    }

    /// Present buckets, from preemption outwards.
    pub fn iter(&self) -> impl Iterator<Item = (Bucket, &[i64])> {
        self.buckets.iter().map(|(b, v)| (*b, v.as_slice()))
    }

    /// Total overheads across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The size of every present bucket, as limits.
    pub fn counts(&self) -> BucketLimits {
        let count = |b| self.get(b).map(<[i64]>::len);
        BucketLimits {
            preemption: count(Bucket::Preemption),
            l2cache: count(Bucket::SameL2),
            onchip: count(Bucket::SameChipOrL3),
            offchip: count(Bucket::OffChip),
        }
    }

    /// Write every present bucket beside `trace`, replacing earlier files.
    ///
    /// # Returns
    ///
    /// The files written.
    pub fn save(&self, trace: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.buckets.len());
        for (bucket, values) in self.iter() {
            let path = valid_path(trace, bucket);
            let mut buf = Vec::with_capacity(values.len() * VALUE_SIZE);
            for v in values {
                buf.extend_from_slice(&v.to_ne_bytes());
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o660)
                .open(&path)
                .with_context(|| format!("unable to open {} for writing", path.display()))?;
            file.write_all(&buf)
                .with_context(|| format!("write to {} failed", path.display()))?;
            debug!("saved {} {bucket} overheads to {}", values.len(), path.display());
            written.push(path);
        }
        Ok(written)
    }

    /// Reload the buckets saved for `trace`.
    ///
    /// # Arguments
    ///
    /// * `trace` - Trace the overheads were extracted from
    /// * `has_l2_level` - Whether to expect a shared-L2 bucket
    pub fn load(trace: &Path, has_l2_level: bool) -> Result<Self> {
        let mut buckets = BTreeMap::new();
        for bucket in Bucket::ALL {
            if bucket == Bucket::SameL2 && !has_l2_level {
                continue;
            }
            let path = valid_path(trace, bucket);
            let bytes = fs::read(&path)
                .with_context(|| format!("unable to read valid overheads {}", path.display()))?;
            if bytes.len() % VALUE_SIZE != 0 {
                return Err(anyhow!(
                    "{} is corrupt: {} bytes is not a whole number of values",
                    path.display(),
                    bytes.len()
                ));
            }
            let values: Vec<i64> = bytes
                .chunks_exact(VALUE_SIZE)
                .map(|chunk| {
                    let mut raw = [0u8; VALUE_SIZE];
                    raw.copy_from_slice(chunk);
                    i64::from_ne_bytes(raw)
                })
                .collect();
            debug!("loaded {} {bucket} overheads from {}", values.len(), path.display());
            buckets.insert(bucket, values);
        }
        Ok(Self { buckets })
    }
}
