pub mod aggregate;
pub mod key;
pub mod stats;
pub mod tables;

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::tracer::event::{BlockEvent, Completion, ProcessContext, RequestId};

use aggregate::IoSnapshot;
use key::AggregateKey;
use stats::EngineStats;
use tables::Tables;

/// Default initial entries per transient table.
pub const DEFAULT_TRANSIENT_CAPACITY: usize = 1024;

/// Default initial buckets in the aggregate table.
pub const DEFAULT_AGGREGATE_CAPACITY: usize = 64;

/// What a completion did to the aggregate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The request was folded into `key`.
    Recorded {
        key: AggregateKey,
        latency_ns: u64,
        /// False when no attribution record existed and the pid 0 bucket
        /// absorbed the request.
        attributed: bool,
    },
    /// No start record existed; nothing was aggregated.
    MissedTrace,
}

/// Correlates attribution, start and completion events into per-task
/// cumulative I/O buckets.
///
/// Every handler takes `&self` and may run concurrently from any thread.
/// Share the engine with `Arc`.
pub struct Engine {
    tables: Tables,
    stats: EngineStats,
    clock: Arc<dyn Clock>,
    started_ns: u64,
}

impl Engine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEFAULT_TRANSIENT_CAPACITY, DEFAULT_AGGREGATE_CAPACITY)
    }

    /// Creates an engine with pre-sized tables so warm handlers do not
    /// reallocate.
    pub fn with_capacity(
        clock: Arc<dyn Clock>,
        transient_capacity: usize,
        aggregate_capacity: usize,
    ) -> Self {
        let started_ns = clock.now_ns();
        Self {
            tables: Tables::new(transient_capacity, aggregate_capacity),
            stats: EngineStats::new(),
            clock,
            started_ns,
        }
    }

    /// Remembers which task issued `req`. `None` means the task name could
    /// not be read; nothing is stored and completion falls back to pid 0.
    ///
    /// A `None` also clears any record left for `req` by an earlier request
    /// whose completion was lost, so the new request is never charged to
    /// the old task.
    pub fn on_attribution(&self, req: RequestId, process: Option<ProcessContext>) {
        match process {
            Some(ctx) => {
                self.tables.attribution.insert(req, ctx);
                self.stats.attribution(true);
            }
            None => {
                self.tables.attribution.remove(&req);
                self.stats.attribution(false);
            }
        }
    }

    /// Records the start timestamp of `req`. A repeated start overwrites.
    pub fn on_start(&self, req: RequestId, ts_ns: u64) {
        self.tables.start.insert(req, ts_ns);
        self.stats.start();
    }

    /// Folds a completed request into its bucket.
    ///
    /// Both transient records for `c.req` are gone when this returns,
    /// whatever the outcome.
    pub fn on_completion(&self, c: &Completion) -> CompletionOutcome {
        let Some((_, issued_ns)) = self.tables.start.remove(&c.req) else {
            self.tables.attribution.remove(&c.req);
            self.stats.missed_trace();
            debug!(req = %c.req, "completion without start record");
            return CompletionOutcome::MissedTrace;
        };

        let latency_ns = c.ts_ns.saturating_sub(issued_ns);

        let mut key = AggregateKey::unattributed(c.direction, c.device);
        let attributed = match self.tables.attribution.remove(&c.req) {
            Some((_, ctx)) => {
                key.pid = ctx.pid;
                key.comm = ctx.comm;
                true
            }
            None => false,
        };

        self.tables.fold(key, c.bytes, latency_ns);
        self.stats.recorded(attributed);

        CompletionOutcome::Recorded {
            key,
            latency_ns,
            attributed,
        }
    }

    /// Dispatches one decoded event to its handler.
    pub fn handle(&self, event: &BlockEvent) {
        match event {
            BlockEvent::Attribution { req, process } => self.on_attribution(*req, *process),
            BlockEvent::Start { req, ts_ns } => self.on_start(*req, *ts_ns),
            BlockEvent::Completion(c) => {
                self.on_completion(c);
            }
        }
    }

    /// Read-only copy of every bucket. Each bucket is read atomically on
    /// its own; buckets updated during the walk may be mid-flight.
    pub fn snapshot(&self) -> Snapshot {
        let buckets = self
            .tables
            .aggregate
            .iter()
            .map(|entry| (*entry.key(), entry.value().snapshot()))
            .collect();

        Snapshot {
            buckets,
            elapsed_ns: self.elapsed_ns(),
        }
    }

    /// Current counters of one bucket.
    pub fn bucket(&self, key: &AggregateKey) -> Option<IoSnapshot> {
        self.tables.aggregate.get(key).map(|agg| agg.snapshot())
    }

    pub fn bucket_count(&self) -> usize {
        self.tables.aggregate.len()
    }

    /// Start records awaiting completion.
    pub fn inflight_starts(&self) -> usize {
        self.tables.start.len()
    }

    /// Attribution records awaiting completion.
    pub fn inflight_attributions(&self) -> usize {
        self.tables.attribution.len()
    }

    /// True if any transient record exists for `req`.
    #[cfg(test)]
    pub(crate) fn is_pending(&self, req: RequestId) -> bool {
        self.tables.start.contains_key(&req) || self.tables.attribution.contains_key(&req)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Nanoseconds since the engine was created.
    pub fn elapsed_ns(&self) -> u64 {
        self.clock.now_ns().saturating_sub(self.started_ns)
    }
}

/// A point-in-time copy of the aggregate table.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub buckets: Vec<(AggregateKey, IoSnapshot)>,
    /// Measurement time covered by the buckets.
    pub elapsed_ns: u64,
}

impl Snapshot {
    /// The `n` buckets with the most bytes, largest first. Ties break on
    /// key order so output is stable.
    pub fn top_by_bytes(&self, n: usize) -> Vec<(AggregateKey, IoSnapshot)> {
        let mut sorted = self.buckets.clone();
        sorted.sort_unstable_by(|a, b| b.1.bytes.cmp(&a.1.bytes).then_with(|| a.0.cmp(&b.0)));
        sorted.truncate(n);
        sorted
    }

    /// Sum over all buckets. Each field saturates at its maximum.
    pub fn total(&self) -> IoSnapshot {
        self.buckets
            .iter()
            .fold(IoSnapshot::default(), |mut acc, (_, s)| {
                acc.bytes = acc.bytes.saturating_add(s.bytes);
                acc.ns = acc.ns.saturating_add(s.ns);
                acc.io = acc.io.saturating_add(s.io);
                acc
            })
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
