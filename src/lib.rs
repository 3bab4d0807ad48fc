//! Per-thread block I/O attribution.
//!
//! Kernel hooks report request attribution, start and completion; the
//! [`engine::Engine`] correlates them into cumulative per-task buckets
//! keyed by (pid, direction, device, task name). The [`report`] loop
//! installs the hooks, samples on an interval, and detaches on shutdown.

pub mod clock;
pub mod config;
pub mod engine;
pub mod export;
pub mod report;
pub mod signal;
pub mod tracer;
