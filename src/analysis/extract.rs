//! Overhead extraction from a recorded trace.
//!
//! Hot records arrive in windows of a fixed size, one window per job. The
//! smallest valid hot cost of a window is the warm-cache baseline; a window
//! with a suspect record stops contributing at that record, and a window
//! with no valid record leaves no baseline. Every valid event seen while a
//! baseline holds yields one [`OverheadSample`].

use std::path::Path;

use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use serde::Serialize;

use crate::trace;
use crate::trace::AccessKind;
use crate::trace::SerializedSample;

/// The cost of one preemption or migration relative to a warm cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverheadSample {
    /// CPU the task resumed on.
    pub curr_cpu: u32,
    /// CPU the task last ran on.
    pub last_cpu: u32,
    /// Event cost minus baseline, in cycles. Negative when the event pass
    /// happened to beat the baseline.
    pub overhead: i64,
    /// Time spent away from the CPU, in cycles.
    pub length: i64,
}

/// Baseline tracking threaded through a trace replay.
#[derive(Debug, Clone)]
pub struct BaselineState {
    window: usize,
    hot_cost: u64,
    valid_hot_reads: usize,
    total_hot_reads: usize,
    no_invalid_reads: bool,
    baseline_established: bool,
    last_cpu: u32,
}

impl BaselineState {
    /// Start a replay with hot windows of `window` records.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            hot_cost: 0,
            valid_hot_reads: 0,
            total_hot_reads: 0,
            no_invalid_reads: true,
            baseline_established: false,
            last_cpu: 0,
        }
    }

    /// The baseline in force, if the last complete window produced one.
    pub fn baseline(&self) -> Option<u64> {
        self.baseline_established.then_some(self.hot_cost)
    }

    /// CPU of the most recent hot or event record.
    pub fn last_cpu(&self) -> u32 {
        self.last_cpu
    }

    /// Feed the next record of the trace.
    ///
    /// # Returns
    ///
    /// The overhead of the record, if it is a valid event measured against
    /// an established baseline.
    pub fn observe(&mut self, record: &SerializedSample) -> Option<OverheadSample> {
        match record.kind()? {
            kind if kind.is_hot() => {
                self.observe_hot(kind, record);
                None
            }
            kind if kind.is_event() => {
                let overhead = match (kind, self.baseline()) {
                    (AccessKind::EventValid, Some(baseline)) => Some(OverheadSample {
                        curr_cpu: record.cpu,
                        last_cpu: self.last_cpu,
                        overhead: record.elapsed_cycles.wrapping_sub(baseline) as i64,
                        length: record.preemption_length as i64,
                    }),
                    _ => None,
                };
                self.last_cpu = record.cpu;
                overhead
            }
            _ => None,
        }
    }

    fn observe_hot(&mut self, kind: AccessKind, record: &SerializedSample) {
        self.total_hot_reads += 1;
        if self.no_invalid_reads && kind == AccessKind::HotValid {
            self.valid_hot_reads += 1;
            if self.valid_hot_reads == 1 {
                self.hot_cost = record.elapsed_cycles;
            } else {
                self.hot_cost = self.hot_cost.min(record.elapsed_cycles);
            }
        } else {
            self.no_invalid_reads = false;
        }

        if self.total_hot_reads == self.window {
            self.baseline_established = self.valid_hot_reads > 0;
            self.valid_hot_reads = 0;
            self.total_hot_reads = 0;
            self.no_invalid_reads = true;
        }
        self.last_cpu = record.cpu;
    }
}

/// Everything recovered from one trace.
#[derive(Debug, Default, Clone)]
pub struct Extraction {
    /// Overheads of valid events, in trace order.
    pub overheads: Vec<OverheadSample>,
    /// Elapsed cycles of valid cold passes.
    pub cold: Vec<u64>,
    /// Elapsed cycles of valid hot passes.
    pub hot: Vec<u64>,
    /// Elapsed cycles of valid event passes.
    pub events: Vec<u64>,
    /// Total records replayed.
    pub records: usize,
    /// Records whose access code was not recognised.
    pub unknown: usize,
}

fn reserved<T>(len: usize, what: &str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| anyhow!("cannot allocate {len} {what}: {e}"))?;
    Ok(v)
}

/// Replay a trace and extract overheads and valid-sample populations.
///
/// # Arguments
///
/// * `records` - Trace records in chronological order
/// * `hot_window` - Hot records per job
pub fn extract(records: &[SerializedSample], hot_window: usize) -> Result<Extraction> {
    let count = |k: AccessKind| records.iter().filter(|r| r.kind() == Some(k)).count();
    let events = count(AccessKind::EventValid);

    let mut out = Extraction {
        overheads: reserved(events, "overhead samples")?,
        cold: reserved(count(AccessKind::ColdValid), "cold samples")?,
        hot: reserved(count(AccessKind::HotValid), "hot samples")?,
        events: reserved(events, "event samples")?,
        records: records.len(),
        unknown: 0,
    };

    let mut state = BaselineState::new(hot_window);
    for record in records {
        match record.kind() {
            Some(AccessKind::ColdValid) => out.cold.push(record.elapsed_cycles),
            Some(AccessKind::HotValid) => out.hot.push(record.elapsed_cycles),
            Some(AccessKind::EventValid) => out.events.push(record.elapsed_cycles),
            Some(_) => {}
            None => out.unknown += 1,
        }
        if let Some(overhead) = state.observe(record) {
            out.overheads.push(overhead);
        }
    }

    debug!(
        "{} records: {} overheads, {} cold, {} hot, {} events, {} unknown",
        out.records,
        out.overheads.len(),
        out.cold.len(),
        out.hot.len(),
        out.events.len(),
        out.unknown
    );
    Ok(out)
}

/// Read a trace file and extract from it.
pub fn extract_file(path: &Path, hot_window: usize) -> Result<Extraction> {
    let records = trace::read(path)?;
    extract(&records, hot_window)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use crate::params::REFTOTAL;

    fn rec(code: u8, elapsed: u64, cpu: u32) -> SerializedSample {
        SerializedSample {
            access_type: code,
            elapsed_cycles: elapsed,
            cpu,
            preemption_length: 0,
        }
    }

    fn event(valid: bool, elapsed: u64, cpu: u32, length: u64) -> SerializedSample {
        SerializedSample::new(AccessKind::event(valid), elapsed, cpu, length)
    }

    #[test]
    fn test_baseline_is_window_minimum() -> Result<()> {
        let records = [
            rec(b'C', 900, 0),
            rec(b'H', 120, 0),
            rec(b'H', 100, 0),
            event(true, 400, 1, 5_000),
        ];
        let out = extract(&records, REFTOTAL)?;
        assert_eq!(
            out.overheads,
            vec![OverheadSample {
                curr_cpu: 1,
                last_cpu: 0,
                overhead: 300,
                length: 5_000,
            }]
        );
        assert_eq!(out.cold, vec![900]);
        assert_eq!(out.hot, vec![120, 100]);
        assert_eq!(out.events, vec![400]);
        Ok(())
    }

    #[test]
    fn test_suspect_first_hot_voids_window() -> Result<()> {
        let records = [rec(b'h', 50, 0), rec(b'H', 100, 0), event(true, 400, 0, 1)];
        assert!(extract(&records, REFTOTAL)?.overheads.is_empty());
        Ok(())
    }

    #[test]
    fn test_suspect_second_hot_keeps_first() -> Result<()> {
        let records = [rec(b'H', 130, 0), rec(b'h', 10, 0), event(true, 400, 0, 1)];
        let out = extract(&records, REFTOTAL)?;
        assert_eq!(out.overheads.len(), 1);
        assert_eq!(out.overheads[0].overhead, 270);
        Ok(())
    }

    #[test]
    fn test_baseline_monotone_within_window() {
        let mut state = BaselineState::new(3);
        for (elapsed, expected) in [(300, None), (200, None), (250, Some(200))] {
            state.observe(&rec(b'H', elapsed, 0));
            assert_eq!(state.baseline(), expected);
        }
    }

    #[test]
    fn test_negative_overhead() -> Result<()> {
        let records = [rec(b'H', 500, 2), rec(b'H', 500, 2), event(true, 450, 2, 9)];
        let out = extract(&records, REFTOTAL)?;
        assert_eq!(out.overheads[0].overhead, -50);
        Ok(())
    }

    #[test]
    fn test_extreme_elapsed_values() -> Result<()> {
        let records = [
            rec(b'H', 100, 0),
            rec(b'H', 100, 0),
            event(true, 1 << 63, 1, 1),
            event(true, 0, 2, u64::MAX),
        ];
        let out = extract(&records, REFTOTAL)?;
        assert_eq!(out.overheads.len(), 2);
        assert_eq!(out.overheads[0].overhead, i64::MAX - 99);
        assert_eq!(out.overheads[1].overhead, -100);
        assert_eq!(out.overheads[1].length, -1);
        Ok(())
    }

    #[test]
    fn test_suspect_event_moves_last_cpu() -> Result<()> {
        let records = [
            rec(b'H', 100, 0),
            rec(b'H', 100, 0),
            event(false, 900, 2, 1),
            event(true, 700, 3, 1),
        ];
        let out = extract(&records, REFTOTAL)?;
        assert_eq!(out.overheads.len(), 1);
        assert_eq!(out.overheads[0].last_cpu, 2);
        assert_eq!(out.overheads[0].curr_cpu, 3);
        assert_eq!(out.events, vec![700]);
        Ok(())
    }

    #[test]
    fn test_cold_does_not_move_last_cpu() -> Result<()> {
        let records = [
            rec(b'H', 100, 0),
            rec(b'H', 100, 0),
            rec(b'C', 800, 5),
            event(true, 300, 1, 1),
        ];
        let out = extract(&records, REFTOTAL)?;
        assert_eq!(out.overheads[0].last_cpu, 0);
        Ok(())
    }

    #[test]
    fn test_invalid_window_withdraws_baseline() -> Result<()> {
        let records = [
            rec(b'H', 100, 0),
            rec(b'H', 100, 0),
            event(true, 300, 0, 1),
            rec(b'h', 100, 0),
            rec(b'h', 100, 0),
            event(true, 300, 0, 1),
        ];
        assert_eq!(extract(&records, REFTOTAL)?.overheads.len(), 1);
        Ok(())
    }

    #[test]
    fn test_no_baseline_before_first_window() -> Result<()> {
        let records = [rec(b'H', 100, 0), event(true, 300, 0, 1)];
        assert!(extract(&records, REFTOTAL)?.overheads.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_records_are_skipped() -> Result<()> {
        let records = [
            rec(b'H', 100, 0),
            rec(b'?', 1, 7),
            rec(b'H', 100, 0),
            event(true, 300, 1, 1),
        ];
        let out = extract(&records, REFTOTAL)?;
        assert_eq!(out.unknown, 1);
        assert_eq!(out.records, 4);
        assert_eq!(out.overheads[0].last_cpu, 0);
        Ok(())
    }

    #[test]
    fn test_empty_trace() -> Result<()> {
        let out = extract(&[], REFTOTAL)?;
        assert!(out.overheads.is_empty());
        assert_eq!(out.records, 0);
        Ok(())
    }

    #[test]
    fn test_extract_truncated_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("pm.raw");
        trace::write(
            &path,
            &[rec(b'H', 100, 0), rec(b'H', 90, 0), event(true, 190, 4, 77)],
        )?;
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(&[b'P', 0, 0])?;

        let out = extract_file(&path, REFTOTAL)?;
        assert_eq!(out.records, 3);
        assert_eq!(out.overheads[0].overhead, 100);
        assert_eq!(out.overheads[0].length, 77);
        Ok(())
    }
}
