//! Binary trace file format.
//!
//! A trace is a flat sequence of fixed-size records with no header. Each
//! record is laid out like the C struct
//! `{ char access_type; u64 elapsed; u32 cpu; u64 preemption_length; }` with
//! natural alignment, in native byte order, so traces are only portable
//! between machines of the same architecture.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use log::warn;

use super::AccessKind;
use super::Sample;
use crate::params::READ_BLOCK;
use crate::params::WRITE_BLOCK;

/// Size of one on-disk record, in bytes.
pub const RECORD_SIZE: usize = std::mem::size_of::<SerializedSample>();

const _: () = assert!(RECORD_SIZE == 32);

const ELAPSED_OFFSET: usize = 8;
const CPU_OFFSET: usize = 16;
const LENGTH_OFFSET: usize = 24;

/// The persisted projection of a [`Sample`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SerializedSample {
    /// Raw access code. Kept as a byte so that records with codes outside
    /// the known vocabulary survive a read/write cycle.
    pub access_type: u8,
    pub elapsed_cycles: u64,
    pub cpu: u32,
    pub preemption_length: u64,
}

impl SerializedSample {
    pub fn new(kind: AccessKind, elapsed_cycles: u64, cpu: u32, preemption_length: u64) -> Self {
        Self {
            access_type: kind.code(),
            elapsed_cycles,
            cpu,
            preemption_length,
        }
    }

    /// The decoded access kind, or `None` for an unknown code.
    pub fn kind(&self) -> Option<AccessKind> {
        AccessKind::from_code(self.access_type)
    }

    /// Encode into the on-disk layout. Padding bytes are zero.
    pub fn encode(&self, out: &mut [u8; RECORD_SIZE]) {
        out.fill(0);
        out[0] = self.access_type;
        out[ELAPSED_OFFSET..ELAPSED_OFFSET + 8].copy_from_slice(&self.elapsed_cycles.to_ne_bytes());
        out[CPU_OFFSET..CPU_OFFSET + 4].copy_from_slice(&self.cpu.to_ne_bytes());
        out[LENGTH_OFFSET..LENGTH_OFFSET + 8]
            .copy_from_slice(&self.preemption_length.to_ne_bytes());
    }

    /// Decode one record. `bytes` must hold at least [`RECORD_SIZE`] bytes.
    fn decode(bytes: &[u8]) -> Self {
        Self {
            access_type: bytes[0],
            elapsed_cycles: ne_u64(bytes, ELAPSED_OFFSET),
            cpu: ne_u32(bytes, CPU_OFFSET),
            preemption_length: ne_u64(bytes, LENGTH_OFFSET),
        }
    }
}

fn ne_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

fn ne_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

/// An open trace file that records are appended to.
///
/// Opening is separate from writing so that an unusable output path is
/// reported before a measurement run starts rather than after it ends.
pub struct TraceWriter {
    file: File,
    path: PathBuf,
}

impl TraceWriter {
    /// Open `path` for appending, creating it with mode 0660 if needed.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o660)
            .open(path)
            .with_context(|| format!("unable to open trace {} for writing", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records in blocks of [`WRITE_BLOCK`].
    ///
    /// A block that is only partially written is an error; nothing is
    /// retried.
    pub fn append(&mut self, records: &[SerializedSample]) -> Result<()> {
        let mut buf = Vec::with_capacity(WRITE_BLOCK.min(records.len()) * RECORD_SIZE);
        let mut record = [0u8; RECORD_SIZE];
        for block in records.chunks(WRITE_BLOCK) {
            buf.clear();
            for r in block {
                r.encode(&mut record);
                buf.extend_from_slice(&record);
            }
            let written = self
                .file
                .write(&buf)
                .with_context(|| format!("write to trace {} failed", self.path.display()))?;
            if written != buf.len() {
                return Err(anyhow!(
                    "short write to trace {}: {written} of {} bytes",
                    self.path.display(),
                    buf.len()
                ));
            }
        }
        debug!("wrote {} records to {}", records.len(), self.path.display());
        Ok(())
    }

    /// Project samples to their on-disk form and append them.
    pub fn append_samples(&mut self, samples: &[Sample]) -> Result<()> {
        let records: Vec<SerializedSample> = samples.iter().map(Sample::serialize).collect();
        self.append(&records)
    }
}

/// Append records to a trace file, creating it if needed.
///
/// # Arguments
///
/// * `path` - Trace file; created with mode 0660 if it does not exist
/// * `records` - Records to append, in order
pub fn write(path: &Path, records: &[SerializedSample]) -> Result<()> {
    TraceWriter::create(path)?.append(records)
}

/// Read every whole record from a trace file.
///
/// The record count is derived from the file size. Trailing bytes that do
/// not form a whole record are ignored with a warning.
pub fn read(path: &Path) -> Result<Vec<SerializedSample>> {
    let mut file = File::open(path)
        .with_context(|| format!("unable to open trace {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("unable to stat trace {}", path.display()))?
        .len() as usize;

    let count = size / RECORD_SIZE;
    let trailing = size % RECORD_SIZE;
    if trailing != 0 {
        warn!(
            "{}: ignoring {trailing} trailing bytes after {count} records",
            path.display()
        );
    }

    let mut records = Vec::new();
    records
        .try_reserve_exact(count)
        .map_err(|e| anyhow!("cannot allocate {count} trace records: {e}"))?;

    let mut buf = vec![0u8; READ_BLOCK.min(count) * RECORD_SIZE];
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(READ_BLOCK);
        let block = &mut buf[..n * RECORD_SIZE];
        file.read_exact(block)
            .with_context(|| format!("read from trace {} failed", path.display()))?;
        records.extend(block.chunks_exact(RECORD_SIZE).map(SerializedSample::decode));
        remaining -= n;
    }
    debug!("read {} records from {}", records.len(), path.display());
    Ok(records)
}
