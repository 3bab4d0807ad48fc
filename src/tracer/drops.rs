//! Ring buffer drop accounting.
//!
//! The BPF programs count every record they could not reserve ring buffer
//! space for in a per-CPU array indexed by event kind. User space sums the
//! CPUs and feeds the cumulative totals to a [`DropTracker`], which turns
//! them into per-poll increases.

use tracing::warn;

use crate::export::health::HealthMetrics;

use super::event::{EventKind, MAX_EVENT_KIND};

/// Drop counts by event kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts([u64; MAX_EVENT_KIND]);

impl DropCounts {
    pub fn get(&self, kind: EventKind) -> u64 {
        self.0.get(kind as usize - 1).copied().unwrap_or(0)
    }

    pub fn set(&mut self, kind: EventKind, n: u64) {
        if let Some(slot) = self.0.get_mut(kind as usize - 1) {
            *slot = n;
        }
    }

    pub fn total(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, n| acc.saturating_add(*n))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|n| *n == 0)
    }

    /// `(kind, count)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (EventKind, u64)> + '_ {
        EventKind::all().iter().map(|k| (*k, self.get(*k)))
    }
}

/// Remembers the last cumulative totals read from the kernel.
#[derive(Debug, Default)]
pub struct DropTracker {
    last: DropCounts,
}

impl DropTracker {
    /// Increase of `totals` over the previous call.
    pub fn update(&mut self, totals: DropCounts) -> DropCounts {
        let mut delta = DropCounts::default();
        for (kind, now) in totals.iter() {
            delta.set(kind, now.saturating_sub(self.last.get(kind)));
        }
        self.last = totals;
        delta
    }

    /// [`update`](Self::update), then warn and advance `metrics` when
    /// anything new was dropped.
    pub fn observe(&mut self, totals: DropCounts, metrics: Option<&HealthMetrics>) -> DropCounts {
        let delta = self.update(totals);
        if delta.is_zero() {
            return delta;
        }

        warn!(
            attribution = delta.get(EventKind::Attribution),
            start = delta.get(EventKind::Start),
            completion = delta.get(EventKind::Completion),
            total = totals.total(),
            "ring buffer full, events dropped"
        );
        if let Some(m) = metrics {
            m.observe_drops(&delta);
        }

        delta
    }
}
