//! Measurement of cache-related preemption and migration delays.
//!
//! The crate has two halves. The [`probe`] runs as a real-time task under an
//! external scheduler, watches the scheduler's status page and records timed
//! accesses to its working set. The [`analysis`] half replays a [`trace`]
//! produced by the probe, derives the overhead of each preemption or migration
//! against a warm-cache baseline and classifies it by cache level.

pub mod analysis;
pub mod params;
pub mod probe;
pub mod trace;
pub mod util;
