//! Trace records produced by the probe.
//!
//! A [`Sample`] is the full in-memory record the probe keeps while running.
//! Only its [`SerializedSample`] projection is persisted; see [`codec`] for
//! the file format.

pub mod codec;

use std::fmt;

pub use codec::RECORD_SIZE;
pub use codec::SerializedSample;
pub use codec::TraceWriter;
pub use codec::read;
pub use codec::write;

/// What a sample measured and whether the measurement window was clean.
///
/// Each kind has a one-byte code; lowercase codes mark suspect samples whose
/// window overlapped a scheduling change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    ColdValid,
    ColdSuspect,
    HotValid,
    HotSuspect,
    EventValid,
    EventSuspect,
}

impl AccessKind {
    /// Pick the valid or suspect variant of a cold access.
    pub fn cold(valid: bool) -> Self {
        if valid { Self::ColdValid } else { Self::ColdSuspect }
    }

    /// Pick the valid or suspect variant of a hot access.
    pub fn hot(valid: bool) -> Self {
        if valid { Self::HotValid } else { Self::HotSuspect }
    }

    /// Pick the valid or suspect variant of a post-event access.
    pub fn event(valid: bool) -> Self {
        if valid { Self::EventValid } else { Self::EventSuspect }
    }

    /// The on-disk code for this kind.
    pub fn code(self) -> u8 {
        match self {
            Self::ColdValid => b'C',
            Self::ColdSuspect => b'c',
            Self::HotValid => b'H',
            Self::HotSuspect => b'h',
            Self::EventValid => b'P',
            Self::EventSuspect => b'p',
        }
    }

    /// Decode an on-disk code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'C' => Some(Self::ColdValid),
            b'c' => Some(Self::ColdSuspect),
            b'H' => Some(Self::HotValid),
            b'h' => Some(Self::HotSuspect),
            b'P' => Some(Self::EventValid),
            b'p' => Some(Self::EventSuspect),
            _ => None,
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(self, Self::ColdValid | Self::HotValid | Self::EventValid)
    }

    pub fn is_cold(self) -> bool {
        matches!(self, Self::ColdValid | Self::ColdSuspect)
    }

    pub fn is_hot(self) -> bool {
        matches!(self, Self::HotValid | Self::HotSuspect)
    }

    pub fn is_event(self) -> bool {
        matches!(self, Self::EventValid | Self::EventSuspect)
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code() as char)
    }
}

/// One timed access to the working set, as recorded by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Cycle count at which the measurement completed.
    pub timestamp: u64,
    pub kind: AccessKind,
    /// Cycles taken by the access.
    pub elapsed_cycles: u64,
    pub cpu: u32,
    pub job_count: u64,
    pub sched_count: u64,
    pub last_rt_task: u64,
    /// Cycles spent away from the CPU; zero unless `kind` is an event.
    pub preemption_length: u64,
}

impl Sample {
    /// The part of the sample that is written to disk.
    pub fn serialize(&self) -> SerializedSample {
        SerializedSample::new(self.kind, self.elapsed_cycles, self.cpu, self.preemption_length)
    }
}
