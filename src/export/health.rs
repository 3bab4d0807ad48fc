use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::engine::stats::EngineCounters;
use crate::engine::Engine;
use crate::tracer::drops::DropCounts;
use crate::tracer::HookKind;

const NAMESPACE: &str = "iomigrater";

/// Prometheus metrics for engine health.
///
/// All metrics use the "iomigrater" namespace. Counters fed from
/// [`EngineCounters`] advance once per sampling tick; gauges are refreshed
/// on the same tick.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Raw events received from the ring buffer by kind.
    pub events_by_kind: CounterVec,
    /// Ring buffer records that failed to parse, by error type.
    pub event_parse_errors: CounterVec,
    /// Records the kernel dropped because the ring buffer was full, by kind.
    pub ringbuf_drops: CounterVec,
    /// Attribution events whose task lookup failed.
    pub attribution_failures: Counter,
    /// Completions folded into a bucket.
    pub completions_recorded: Counter,
    /// Completions without a start record.
    pub missed_traces: Counter,
    /// Recorded completions charged to the pid 0 bucket.
    pub unattributed: Counter,
    /// Sampling loop iterations.
    pub sampling_ticks: Counter,

    /// Hook attachment state (1=attached, 0=detached).
    pub hooks_attached: GaugeVec,
    /// Buckets in the aggregate table.
    pub buckets: Gauge,
    /// Outstanding start records.
    pub inflight_starts: Gauge,
    /// Outstanding attribution records.
    pub inflight_attributions: Gauge,
    /// Total ring buffer capacity in bytes.
    pub ringbuf_capacity_bytes: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_by_kind = CounterVec::new(
            Opts::new(
                "events_by_kind_total",
                "Total ring buffer events received by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let event_parse_errors = CounterVec::new(
            Opts::new(
                "event_parse_errors_total",
                "Total event parse errors by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let ringbuf_drops = CounterVec::new(
            Opts::new(
                "ringbuf_drops_total",
                "Total records dropped by the kernel on a full ring buffer, by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let attribution_failures = Counter::with_opts(
            Opts::new(
                "attribution_failures_total",
                "Attribution events whose task name could not be read.",
            )
            .namespace(NAMESPACE),
        )?;
        let completions_recorded = Counter::with_opts(
            Opts::new(
                "completions_recorded_total",
                "Completions folded into the aggregate table.",
            )
            .namespace(NAMESPACE),
        )?;
        let missed_traces = Counter::with_opts(
            Opts::new(
                "missed_traces_total",
                "Completions dropped for lack of a start record.",
            )
            .namespace(NAMESPACE),
        )?;
        let unattributed = Counter::with_opts(
            Opts::new(
                "unattributed_completions_total",
                "Recorded completions charged to the pid 0 bucket.",
            )
            .namespace(NAMESPACE),
        )?;
        let sampling_ticks = Counter::with_opts(
            Opts::new("sampling_ticks_total", "Sampling loop iterations.").namespace(NAMESPACE),
        )?;

        let hooks_attached = GaugeVec::new(
            Opts::new(
                "hooks_attached",
                "Whether a kernel hook is attached (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["hook"],
        )?;
        let buckets = Gauge::with_opts(
            Opts::new("aggregate_buckets", "Buckets in the aggregate table.").namespace(NAMESPACE),
        )?;
        let inflight_starts = Gauge::with_opts(
            Opts::new("inflight_starts", "Start records awaiting completion.")
                .namespace(NAMESPACE),
        )?;
        let inflight_attributions = Gauge::with_opts(
            Opts::new(
                "inflight_attributions",
                "Attribution records awaiting completion.",
            )
            .namespace(NAMESPACE),
        )?;
        let ringbuf_capacity_bytes = Gauge::with_opts(
            Opts::new(
                "ringbuf_capacity_bytes",
                "Total ring buffer capacity in bytes.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(events_by_kind.clone()))?;
        registry.register(Box::new(event_parse_errors.clone()))?;
        registry.register(Box::new(ringbuf_drops.clone()))?;
        registry.register(Box::new(attribution_failures.clone()))?;
        registry.register(Box::new(completions_recorded.clone()))?;
        registry.register(Box::new(missed_traces.clone()))?;
        registry.register(Box::new(unattributed.clone()))?;
        registry.register(Box::new(sampling_ticks.clone()))?;
        registry.register(Box::new(hooks_attached.clone()))?;
        registry.register(Box::new(buckets.clone()))?;
        registry.register(Box::new(inflight_starts.clone()))?;
        registry.register(Box::new(inflight_attributions.clone()))?;
        registry.register(Box::new(ringbuf_capacity_bytes.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_by_kind,
            event_parse_errors,
            ringbuf_drops,
            attribution_failures,
            completions_recorded,
            missed_traces,
            unattributed,
            sampling_ticks,
            hooks_attached,
            buckets,
            inflight_starts,
            inflight_attributions,
            ringbuf_capacity_bytes,
        })
    }

    /// Advance counters by one drain of the engine stats.
    pub fn observe_counters(&self, counters: &EngineCounters) {
        self.attribution_failures
            .inc_by(counters.attribution_failures as f64);
        self.completions_recorded.inc_by(counters.recorded as f64);
        self.missed_traces.inc_by(counters.missed_traces as f64);
        self.unattributed.inc_by(counters.unattributed as f64);
    }

    /// Advance drop counters by one poll's increase.
    pub fn observe_drops(&self, delta: &DropCounts) {
        for (kind, n) in delta.iter().filter(|(_, n)| *n > 0) {
            self.ringbuf_drops
                .with_label_values(&[kind.as_str()])
                .inc_by(n as f64);
        }
    }

    /// Refresh table gauges from the engine.
    pub fn observe_engine(&self, engine: &Engine) {
        self.buckets.set(engine.bucket_count() as f64);
        self.inflight_starts.set(engine.inflight_starts() as f64);
        self.inflight_attributions
            .set(engine.inflight_attributions() as f64);
    }

    pub fn set_hook_attached(&self, hook: HookKind, attached: bool) {
        self.hooks_attached
            .with_label_values(&[hook.as_str()])
            .set(if attached { 1.0 } else { 0.0 });
    }

    /// Encode the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
