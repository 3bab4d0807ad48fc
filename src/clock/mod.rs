use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond time source.
///
/// Kernel-side events carry their own `bpf_ktime_get_ns` stamps; this trait
/// lets user space read the same time base (for rates and tests).
pub trait Clock: Send + Sync {
    /// Current monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;
}

/// CLOCK_MONOTONIC, the time base used by `bpf_ktime_get_ns`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is
        // always available on Linux.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0;
        }

        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    }
}

/// Manually advanced clock for tests and benches.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_ns`.
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// Move time forward by `delta_ns`.
    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
