use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cumulative I/O counters for one bucket.
/// All operations are atomic and safe for concurrent use.
#[derive(Debug, Default)]
pub struct IoAggregate {
    bytes: AtomicU64,
    ns: AtomicU64,
    io: AtomicU32,
}

impl IoAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed request.
    pub fn record(&self, bytes: u64, latency_ns: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.io.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    pub fn snapshot(&self) -> IoSnapshot {
        IoSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            ns: self.ns.load(Ordering::Relaxed),
            io: self.io.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSnapshot {
    pub bytes: u64,
    pub ns: u64,
    pub io: u32,
}

impl IoSnapshot {
    /// Mean per-request latency, 0 when empty.
    pub fn avg_latency_ns(&self) -> u64 {
        if self.io == 0 {
            0
        } else {
            self.ns / u64::from(self.io)
        }
    }
}
