use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::engine::{DEFAULT_AGGREGATE_CAPACITY, DEFAULT_TRANSIENT_CAPACITY};

/// Top-level configuration for iomigrater.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// BPF ring buffer size in bytes. Default: 256KiB.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    /// Correlation table sizing.
    #[serde(default)]
    pub tables: TablesConfig,

    /// Sampling loop output.
    #[serde(default)]
    pub report: ReportConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Upper bound on waiting for the event reader during detach. Default: 5s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Initial table capacities.
#[derive(Debug, Clone, Deserialize)]
pub struct TablesConfig {
    /// Initial entries per transient (attribution, start) table. Default: 1024.
    #[serde(default = "default_tables_capacity")]
    pub capacity: usize,

    /// Initial buckets in the aggregate table. Default: 64.
    #[serde(default = "default_aggregate_capacity")]
    pub aggregate_capacity: usize,
}

/// Sampling loop output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Buckets to print per tick, ranked by bytes. 0 prints only the
    /// liveness line. Default: 0.
    #[serde(default)]
    pub top: usize,

    /// Bucket count that triggers a one-time growth warning. Default: 65536.
    #[serde(default = "default_bucket_warn_threshold")]
    pub bucket_warn_threshold: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve `/metrics` and `/healthz`. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ring_buffer_size() -> usize {
    256 * 1024 // 256KiB
}

fn default_tables_capacity() -> usize {
    DEFAULT_TRANSIENT_CAPACITY
}

fn default_aggregate_capacity() -> usize {
    DEFAULT_AGGREGATE_CAPACITY
}

fn default_bucket_warn_threshold() -> usize {
    65536
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ring_buffer_size: default_ring_buffer_size(),
            tables: TablesConfig::default(),
            report: ReportConfig::default(),
            health: HealthConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            capacity: default_tables_capacity(),
            aggregate_capacity: default_aggregate_capacity(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            top: 0,
            bucket_warn_threshold: default_bucket_warn_threshold(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate a YAML document. Empty input yields defaults.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(data).context("parsing config")?
        };

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            bail!("log_level must not be empty");
        }

        if self.ring_buffer_size == 0 {
            bail!("ring_buffer_size must be positive");
        }
        if !self.ring_buffer_size.is_power_of_two() {
            bail!(
                "ring_buffer_size must be a power of two, got {}",
                self.ring_buffer_size
            );
        }

        if self.tables.capacity == 0 {
            bail!("tables.capacity must be positive");
        }

        if self.report.bucket_warn_threshold == 0 {
            bail!("report.bucket_warn_threshold must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        if self.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be positive");
        }

        Ok(())
    }
}
