use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free handler outcome counters.
///
/// `drain()` atomically reads and resets every counter, making it suitable
/// for periodic reporting without contention.
#[derive(Debug, Default)]
pub struct EngineStats {
    attributions: AtomicU64,
    attribution_failures: AtomicU64,
    starts: AtomicU64,
    recorded: AtomicU64,
    unattributed: AtomicU64,
    missed_traces: AtomicU64,
}

/// Plain counter values taken by [`EngineStats::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    /// Attribution events that stored a record.
    pub attributions: u64,
    /// Attribution events whose task lookup failed.
    pub attribution_failures: u64,
    pub starts: u64,
    /// Completions folded into the aggregate table.
    pub recorded: u64,
    /// Recorded completions that fell back to the pid 0 bucket.
    pub unattributed: u64,
    /// Completions dropped for lack of a start record.
    pub missed_traces: u64,
}

impl EngineCounters {
    /// Add another drain into this running total.
    pub fn merge(&mut self, other: &EngineCounters) {
        self.attributions += other.attributions;
        self.attribution_failures += other.attribution_failures;
        self.starts += other.starts;
        self.recorded += other.recorded;
        self.unattributed += other.unattributed;
        self.missed_traces += other.missed_traces;
    }

    pub fn completions(&self) -> u64 {
        self.recorded + self.missed_traces
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn attribution(&self, stored: bool) {
        if stored {
            self.attributions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.attribution_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn start(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn recorded(&self, attributed: bool) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if !attributed {
            self.unattributed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn missed_trace(&self) {
        self.missed_traces.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn drain(&self) -> EngineCounters {
        EngineCounters {
            attributions: self.attributions.swap(0, Ordering::Relaxed),
            attribution_failures: self.attribution_failures.swap(0, Ordering::Relaxed),
            starts: self.starts.swap(0, Ordering::Relaxed),
            recorded: self.recorded.swap(0, Ordering::Relaxed),
            unattributed: self.unattributed.swap(0, Ordering::Relaxed),
            missed_traces: self.missed_traces.swap(0, Ordering::Relaxed),
        }
    }
}
