use std::io::Stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use iomigrater::clock::MonotonicClock;
use iomigrater::config::Config;
use iomigrater::engine::Engine;
use iomigrater::export::health::HealthMetrics;
use iomigrater::report::{DetachReport, ReportOptions, Reporter};
use iomigrater::signal::{SignalError, Signals};

#[cfg(feature = "bpf")]
type Hooks = iomigrater::tracer::bpf::BpfHooks;
#[cfg(not(feature = "bpf"))]
type Hooks = iomigrater::tracer::UnsupportedHooks;

/// Environment variable naming an optional YAML config file.
const CONFIG_ENV: &str = "IOMIGRATER_CONFIG";

/// Measures block I/O issued by each thread.
#[derive(Parser)]
#[command(name = "iomigrater", about)]
struct Cli {
    /// Sampling interval in milliseconds.
    #[arg(default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            Config::load(&path)
                .with_context(|| format!("loading config from {}", path.display()))?
        }
        None => Config::default(),
    };

    // RUST_LOG wins over the configured level.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.log_level)
            .with_context(|| format!("invalid log level: {}", cfg.log_level))?,
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        interval_ms = cli.interval,
        "starting iomigrater",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(Duration::from_millis(cli.interval), cfg).await })
}

async fn run(interval: Duration, cfg: Config) -> Result<()> {
    let engine = Arc::new(Engine::with_capacity(
        Arc::new(MonotonicClock),
        cfg.tables.capacity,
        cfg.tables.aggregate_capacity,
    ));

    let metrics = if cfg.health.enabled {
        let m = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        m.start().await.context("starting health server")?;
        Some(m)
    } else {
        None
    };

    let opts = ReportOptions {
        interval,
        top: cfg.report.top,
        bucket_warn_threshold: cfg.report.bucket_warn_threshold,
    };
    let mut reporter = Reporter::new(Arc::clone(&engine), opts, std::io::stdout());
    if let Some(m) = &metrics {
        reporter = reporter.with_metrics(Arc::clone(m));
    }

    let signals = Signals::register().context("installing signal handlers")?;

    let mut hooks = open_hooks(&cfg, &engine, metrics.clone())?;
    let result = drive(&mut reporter, &mut hooks, signals).await;
    close_hooks(&mut hooks, cfg.shutdown_timeout).await;

    if let Some(m) = &metrics {
        m.stop();
    }

    let report = result?;
    if !report.is_clean() {
        tracing::warn!(failed = report.failures.len(), "some hooks could not be removed");
    }

    tracing::info!("iomigrater stopped");
    Ok(())
}

/// Run the reporting loop alongside the signal bridge.
async fn drive(
    reporter: &mut Reporter<Stdout>,
    hooks: &mut Hooks,
    signals: Signals,
) -> Result<DetachReport> {
    let cancel = CancellationToken::new();

    let bridge = signals.bridge(cancel.clone());
    tokio::pin!(bridge);
    let run = reporter.run(hooks, &cancel);
    tokio::pin!(run);

    tokio::select! {
        res = &mut run => res,
        res = &mut bridge => match res {
            Ok(()) => (&mut run).await,
            Err(e @ SignalError::Unexpected(_)) => fatal_signal(e),
            Err(e) => Err(e).context("signal bridge"),
        },
    }
}

/// Unexpected signals end the process at once, without detaching.
fn fatal_signal(err: SignalError) -> ! {
    tracing::error!(error = %err, "fatal signal");
    eprintln!("Signal Error! {err}");
    std::process::exit(1);
}

#[cfg(feature = "bpf")]
fn open_hooks(
    cfg: &Config,
    engine: &Arc<Engine>,
    metrics: Option<Arc<HealthMetrics>>,
) -> Result<Hooks> {
    let ring_buf_size =
        u32::try_from(cfg.ring_buffer_size).context("ring_buffer_size does not fit in u32")?;
    let mut hooks = Hooks::load(ring_buf_size)?;
    hooks.spawn_reader(Arc::clone(engine), metrics)?;
    Ok(hooks)
}

#[cfg(not(feature = "bpf"))]
fn open_hooks(
    _cfg: &Config,
    _engine: &Arc<Engine>,
    _metrics: Option<Arc<HealthMetrics>>,
) -> Result<Hooks> {
    tracing::warn!("built without the bpf feature; hook installation will fail");
    Ok(Hooks::default())
}

#[cfg(feature = "bpf")]
async fn close_hooks(hooks: &mut Hooks, timeout: Duration) {
    hooks.stop_reader(timeout).await;
}

#[cfg(not(feature = "bpf"))]
async fn close_hooks(_hooks: &mut Hooks, _timeout: Duration) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_defaults_to_ten_ms() {
        let cli = Cli::try_parse_from(["iomigrater"]).expect("parse");
        assert_eq!(cli.interval, 10);
    }

    #[test]
    fn test_interval_is_the_only_argument() {
        let cli = Cli::try_parse_from(["iomigrater", "250"]).expect("parse");
        assert_eq!(cli.interval, 250);

        assert!(Cli::try_parse_from(["iomigrater", "--version"]).is_err());
        assert!(Cli::try_parse_from(["iomigrater", "-V"]).is_err());
        assert!(Cli::try_parse_from(["iomigrater", "10", "20"]).is_err());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(Cli::try_parse_from(["iomigrater", "0"]).is_err());
    }
}
