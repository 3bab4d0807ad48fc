use dashmap::DashMap;

use crate::tracer::event::{ProcessContext, RequestId};

use super::aggregate::IoAggregate;
use super::key::AggregateKey;

/// The three correlation tables.
///
/// Uses `DashMap` for sharded concurrent access, so handlers for unrelated
/// requests never contend on a single lock. Each entry is independently
/// lockable.
pub struct Tables {
    /// In-flight request -> issuing task.
    pub attribution: DashMap<RequestId, ProcessContext>,
    /// In-flight request -> start timestamp (monotonic ns).
    pub start: DashMap<RequestId, u64>,
    /// Bucket -> cumulative counters. Grows only.
    pub aggregate: DashMap<AggregateKey, IoAggregate>,
}

impl Tables {
    /// Creates tables with the given initial capacities.
    pub fn new(transient_capacity: usize, aggregate_capacity: usize) -> Self {
        Self {
            attribution: DashMap::with_capacity(transient_capacity),
            start: DashMap::with_capacity(transient_capacity),
            aggregate: DashMap::with_capacity(aggregate_capacity),
        }
    }

    /// Adds one completed request to its bucket, creating it at zero first.
    ///
    /// Existing buckets are updated under a shard read lock; the counters
    /// are atomics, so concurrent completions on one bucket still sum
    /// exactly.
    pub fn fold(&self, key: AggregateKey, bytes: u64, latency_ns: u64) {
        if let Some(agg) = self.aggregate.get(&key) {
            agg.record(bytes, latency_ns);
            return;
        }
        self.aggregate
            .entry(key)
            .or_default()
            .record(bytes, latency_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::{Comm, Direction};

    fn key(pid: u32) -> AggregateKey {
        AggregateKey {
            pid,
            direction: Direction::Write,
            major: 8,
            minor: 0,
            comm: Comm::from("fio"),
        }
    }

    #[test]
    fn test_fold_creates_bucket_lazily() {
        let tables = Tables::new(16, 16);
        assert!(tables.aggregate.is_empty());

        tables.fold(key(1), 4096, 100);
        tables.fold(key(1), 4096, 300);

        let entry = tables.aggregate.get(&key(1)).expect("bucket exists");
        let snap = entry.snapshot();
        assert_eq!(snap.io, 2);
        assert_eq!(snap.bytes, 8192);
        assert_eq!(snap.ns, 400);
        assert_eq!(tables.aggregate.len(), 1);
    }

    #[test]
    fn test_fold_separates_keys() {
        let tables = Tables::new(16, 16);
        tables.fold(key(1), 1, 1);
        tables.fold(key(2), 2, 2);
        assert_eq!(tables.aggregate.len(), 2);
    }

    #[test]
    fn test_concurrent_fold_same_bucket() {
        use std::sync::Arc;
        use std::thread;

        let tables = Arc::new(Tables::new(16, 16));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let tables = Arc::clone(&tables);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    tables.fold(key(7), 512, 25);
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        let snap = tables.aggregate.get(&key(7)).expect("bucket").snapshot();
        assert_eq!(snap.io, 8000);
        assert_eq!(snap.bytes, 8000 * 512);
        assert_eq!(snap.ns, 8000 * 25);
    }
}
