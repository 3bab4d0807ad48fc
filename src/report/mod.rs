pub mod render;

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::stats::EngineCounters;
use crate::engine::Engine;
use crate::export::health::HealthMetrics;
use crate::tracer::{HookError, HookInstaller, HookKind};

/// Printed once per sampling tick.
pub const LIVENESS_LINE: &str = "It is still trying to find I/O intensive threads...";

/// Reporting loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Installed,
    Sampling,
    Detaching,
    Terminated,
}

impl LoopState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Installed => "installed",
            Self::Sampling => "sampling",
            Self::Detaching => "detaching",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of detaching all hooks.
#[derive(Debug, Default)]
pub struct DetachReport {
    /// Hooks removed cleanly.
    pub removed: Vec<HookKind>,
    /// Hooks whose removal failed; they may still be attached.
    pub failures: Vec<HookError>,
}

impl DetachReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reporting loop settings.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub interval: Duration,
    /// Buckets rendered per tick; 0 disables rendering.
    pub top: usize,
    pub bucket_warn_threshold: usize,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            top: 0,
            bucket_warn_threshold: 65536,
        }
    }
}

/// Drives `Idle -> Installed -> Sampling -> Detaching -> Terminated`.
///
/// Single-threaded: only reads the engine, never mutates it.
pub struct Reporter<W: Write> {
    engine: Arc<Engine>,
    opts: ReportOptions,
    metrics: Option<Arc<HealthMetrics>>,
    out: W,
    state: LoopState,
    installed: Vec<HookKind>,
    totals: EngineCounters,
    ticks: u64,
    warned_growth: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(engine: Arc<Engine>, opts: ReportOptions, out: W) -> Self {
        Self {
            engine,
            opts,
            metrics: None,
            out,
            state: LoopState::Idle,
            installed: Vec::with_capacity(HookKind::ALL.len()),
            totals: EngineCounters::default(),
            ticks: 0,
            warned_growth: false,
        }
    }

    /// Publish loop and engine stats to the health endpoint.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Hooks currently installed by this reporter, in install order.
    pub fn installed(&self) -> &[HookKind] {
        &self.installed
    }

    /// Engine counters accumulated over all ticks so far.
    pub fn totals(&self) -> EngineCounters {
        self.totals
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Output sink, for inspection.
    pub fn output(&self) -> &W {
        &self.out
    }

    /// Install, sample until `cancel` fires, then detach.
    pub async fn run<H: HookInstaller + ?Sized>(
        &mut self,
        hooks: &mut H,
        cancel: &CancellationToken,
    ) -> Result<DetachReport> {
        self.install(hooks)?;

        writeln!(
            self.out,
            "Filtering I/O intensive threads for {} milliseconds",
            self.opts.interval.as_millis()
        )
        .context("writing report output")?;
        self.out.flush().context("writing report output")?;

        let sampled = self.sample(cancel).await;
        let report = self.detach(hooks);
        sampled?;

        Ok(report)
    }

    /// Install every hook in order. On the first failure, hooks installed by
    /// this call are removed again and the error names the failing hook.
    pub fn install<H: HookInstaller + ?Sized>(&mut self, hooks: &mut H) -> Result<()> {
        if self.state != LoopState::Idle {
            anyhow::bail!("cannot install hooks in state {}", self.state);
        }

        for hook in HookKind::ALL {
            if let Err(e) = hooks.install(hook) {
                error!(hook = %hook, error = %e, "hook installation failed, rolling back");
                self.rollback(hooks);
                return Err(e).context("installing kernel hooks");
            }

            self.installed.push(hook);
            if let Some(m) = &self.metrics {
                m.set_hook_attached(hook, true);
            }
        }

        info!(hooks = self.installed.len(), "kernel hooks installed");
        self.state = LoopState::Installed;
        Ok(())
    }

    fn rollback<H: HookInstaller + ?Sized>(&mut self, hooks: &mut H) {
        while let Some(hook) = self.installed.pop() {
            match hooks.remove(hook) {
                Ok(()) => {
                    if let Some(m) = &self.metrics {
                        m.set_hook_attached(hook, false);
                    }
                }
                Err(e) => warn!(hook = %hook, error = %e, "rollback removal failed"),
            }
        }
    }

    /// Sleep, tick, repeat until cancelled.
    pub async fn sample(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state != LoopState::Installed {
            anyhow::bail!("cannot start sampling in state {}", self.state);
        }
        self.state = LoopState::Sampling;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opts.interval) => {
                    self.tick().context("writing report output")?;
                }
            }
        }

        Ok(())
    }

    /// One sampling iteration.
    pub fn tick(&mut self) -> std::io::Result<()> {
        self.ticks += 1;

        writeln!(self.out, "{LIVENESS_LINE}")?;

        if self.opts.top > 0 {
            let snapshot = self.engine.snapshot();
            render::render_top(&mut self.out, &snapshot, self.opts.top)?;
        }
        self.out.flush()?;

        let buckets = self.engine.bucket_count();
        if !self.warned_growth && buckets >= self.opts.bucket_warn_threshold {
            self.warned_growth = true;
            warn!(
                buckets,
                threshold = self.opts.bucket_warn_threshold,
                "aggregate table keeps growing; buckets are never evicted"
            );
        }

        let step = self.engine.stats().drain();
        self.totals.merge(&step);

        if let Some(m) = &self.metrics {
            m.sampling_ticks.inc();
            m.observe_counters(&step);
            m.observe_engine(&self.engine);
        }

        Ok(())
    }

    /// Remove every installed hook. Failures are logged and collected;
    /// removal continues with the next hook.
    pub fn detach<H: HookInstaller + ?Sized>(&mut self, hooks: &mut H) -> DetachReport {
        self.state = LoopState::Detaching;
        // Stdout is best effort on the way out.
        let _ = writeln!(self.out, "Detaching and free resources...");
        let _ = self.out.flush();

        let mut report = DetachReport::default();
        for hook in std::mem::take(&mut self.installed) {
            match hooks.remove(hook) {
                Ok(()) => {
                    if let Some(m) = &self.metrics {
                        m.set_hook_attached(hook, false);
                    }
                    report.removed.push(hook);
                }
                Err(e) => {
                    error!(hook = %hook, error = %e, "failed to remove hook");
                    report.failures.push(e);
                }
            }
        }

        self.state = LoopState::Terminated;
        let total = self.engine.snapshot().total();
        info!(
            removed = report.removed.len(),
            failed = report.failures.len(),
            ticks = self.ticks,
            completions = self.totals.completions(),
            missed_traces = self.totals.missed_traces,
            bytes = total.bytes,
            io = total.io,
            "hooks detached"
        );

        report
    }
}
