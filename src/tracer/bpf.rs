//! BPF object loading, kprobe attachment, and ring buffer reading.
//!
//! Implements [`HookInstaller`] using aya. All code is gated behind
//! `#[cfg(feature = "bpf")]`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use prometheus::Counter;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use aya::maps::{MapData, MapError, PerCpuArray, RingBuf};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::{KProbe, ProgramError};
use aya::{Ebpf, EbpfLoader};

use crate::engine::Engine;
use crate::export::health::HealthMetrics;

use super::drops::{DropCounts, DropTracker};
use super::event::EventKind;
use super::links::LinkTable;
use super::parse::parse_event;
use super::{HookError, HookInstaller, HookKind};

/// Compiled BPF object, embedded at build time.
///
/// Uses `include_bytes_aligned!` to guarantee 32-byte alignment. Without this,
/// `include_bytes!` provides only 1-byte alignment and `aya-obj`'s ELF parser
/// rejects the data when the pointer lands at a non-8-byte-aligned address.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/iomigrater.bpf.o"));

/// Name of the ring buffer map in the BPF object.
const EVENTS_MAP: &str = "events";

/// Per-CPU array of records dropped on a full ring buffer, indexed by kind.
const DROPS_MAP: &str = "drops";

/// How often the reader sums the drop counters.
const DROP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Locked memory allowed for maps on kernels without memcg accounting.
const MEMLOCK_LIMIT: libc::rlim_t = 128 << 20;

/// aya-backed hook installer.
///
/// Programs are loaded into the kernel lazily on first install; the shared
/// start program is loaded once and attached at both start symbols.
pub struct BpfHooks {
    ebpf: Ebpf,
    ring_buf_size: u32,
    loaded: HashSet<&'static str>,
    links: LinkTable<KProbeLinkId>,
    reader: Option<Reader>,
}

struct Reader {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BpfHooks {
    /// Load the embedded BPF object with the given ring buffer size.
    pub fn load(ring_buf_size: u32) -> Result<Self> {
        if let Err(e) = bump_memlock_rlimit() {
            tracing::warn!(error = %e, "could not raise RLIMIT_MEMLOCK");
        }

        let ebpf = EbpfLoader::new()
            .set_max_entries(EVENTS_MAP, ring_buf_size)
            .load(BPF_OBJ)
            .context("loading BPF objects")?;

        tracing::debug!(ring_buf_size, "BPF object loaded");

        Ok(Self {
            ebpf,
            ring_buf_size,
            loaded: HashSet::with_capacity(3),
            links: LinkTable::default(),
            reader: None,
        })
    }

    /// Spawn the task draining the ring buffer into `engine`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn spawn_reader(
        &mut self,
        engine: Arc<Engine>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Result<()> {
        if self.reader.is_some() {
            bail!("ring buffer reader already running");
        }

        let events_map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| anyhow::anyhow!("{EVENTS_MAP} map not found"))?;
        let ring_buf =
            RingBuf::try_from(events_map).context("creating ring buffer from events map")?;

        let drops_map = self
            .ebpf
            .take_map(DROPS_MAP)
            .ok_or_else(|| anyhow::anyhow!("{DROPS_MAP} map not found"))?;
        let drops = PerCpuArray::<MapData, u64>::try_from(drops_map)
            .context("creating per-CPU array from drops map")?;

        if let Some(m) = &metrics {
            m.ringbuf_capacity_bytes.set(f64::from(self.ring_buf_size));
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            read_loop(ring_buf, drops, engine, metrics, token).await;
        });

        self.reader = Some(Reader { cancel, handle });
        tracing::info!("ring buffer reader started");

        Ok(())
    }

    /// Stop the reader, waiting at most `timeout` for it to exit.
    pub async fn stop_reader(&mut self, timeout: Duration) {
        let Some(reader) = self.reader.take() else {
            return;
        };

        reader.cancel.cancel();
        match tokio::time::timeout(timeout, reader.handle).await {
            Ok(Ok(())) => tracing::info!("ring buffer reader stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "ring buffer reader panicked"),
            Err(_) => tracing::warn!(?timeout, "ring buffer reader did not stop in time"),
        }
    }

}

/// The kprobe program servicing `hook`. Errors carry a bare reason.
fn kprobe(ebpf: &mut Ebpf, hook: HookKind) -> Result<&mut KProbe, String> {
    let name = hook.program();
    let prog: &mut KProbe = ebpf
        .program_mut(name)
        .ok_or_else(|| format!("program '{name}' not found in BPF object"))?
        .try_into()
        .map_err(|e: ProgramError| format!("'{name}' is not a kprobe program: {e}"))?;
    Ok(prog)
}

impl HookInstaller for BpfHooks {
    fn install(&mut self, hook: HookKind) -> Result<(), HookError> {
        if self.links.contains(hook) {
            return Err(HookError::AlreadyInstalled(hook));
        }

        let name = hook.program();
        let needs_load = !self.loaded.contains(name);
        let prog =
            kprobe(&mut self.ebpf, hook).map_err(|reason| HookError::Install { hook, reason })?;

        if needs_load {
            prog.load().map_err(|e| HookError::Install {
                hook,
                reason: format!("loading program '{name}': {e}"),
            })?;
        }

        let link = prog
            .attach(hook.symbol(), 0)
            .map_err(|e| HookError::Install {
                hook,
                reason: e.to_string(),
            })?;

        self.loaded.insert(name);
        self.links.insert(hook, link)?;
        tracing::debug!(hook = %hook, symbol = hook.symbol(), "attached kprobe");

        Ok(())
    }

    fn remove(&mut self, hook: HookKind) -> Result<(), HookError> {
        // aya drops its own handle before detaching, so a failed detach
        // cannot be retried; only a failed lookup keeps the link.
        let prog = kprobe(&mut self.ebpf, hook);
        self.links
            .remove_with(hook, prog, |prog, link| prog.detach(link))?;

        tracing::debug!(hook = %hook, symbol = hook.symbol(), "detached kprobe");
        Ok(())
    }
}

async fn read_loop(
    ring_buf: RingBuf<MapData>,
    drops: PerCpuArray<MapData, u64>,
    engine: Arc<Engine>,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) {
    let mut async_fd = match AsyncFd::new(ring_buf) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "failed to create async fd for ring buffer");
            return;
        }
    };

    // Resolve label children once so the drain loop does no hashing.
    let kind_counters: Option<Vec<Counter>> = metrics.as_ref().map(|m| {
        EventKind::all()
            .iter()
            .map(|k| m.events_by_kind.with_label_values(&[k.as_str()]))
            .collect()
    });

    let mut drop_tracker = DropTracker::default();
    let mut drop_poll = tokio::time::interval(DROP_POLL_INTERVAL);
    drop_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = drop_poll.tick() => match sum_drops(&drops) {
                Ok(totals) => {
                    drop_tracker.observe(totals, metrics.as_deref());
                }
                Err(e) => tracing::debug!(error = %e, "reading drop counters"),
            },
            result = async_fd.readable_mut() => {
                let mut guard = match result {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(error = %e, "ring buffer poll error");
                        continue;
                    }
                };

                // Drain all available events.
                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    let data: &[u8] = &item;

                    match parse_event(data) {
                        Ok(event) => {
                            if let Some(counters) = &kind_counters {
                                if let Some(c) = counters.get(event.kind() as usize - 1) {
                                    c.inc();
                                }
                            }
                            engine.handle(&event);
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "event parse error");
                            if let Some(m) = &metrics {
                                m.event_parse_errors.with_label_values(&[e.as_str()]).inc();
                            }
                        }
                    }
                }

                guard.clear_ready();
            }
        }
    }
}

/// Cumulative drops per kind, summed over all CPUs.
fn sum_drops(drops: &PerCpuArray<MapData, u64>) -> Result<DropCounts, MapError> {
    let mut counts = DropCounts::default();
    for kind in EventKind::all() {
        let per_cpu = drops.get(&u32::from(*kind as u8), 0)?;
        counts.set(*kind, per_cpu.iter().sum());
    }
    Ok(counts)
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_LIMIT,
        rlim_max: MEMLOCK_LIMIT,
    };

    // SAFETY: `rlimit` is a valid, fully initialised struct.
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!("setrlimit: {}", std::io::Error::last_os_error());
    }

    Ok(())
}
