pub mod clock;
pub mod memfd;
pub mod sched;
pub mod status;
