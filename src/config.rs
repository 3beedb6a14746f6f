// Configuration for the benchmark binary
//
// Priority order (highest to lowest):
// 1. Command-line arguments (applied by the binary after load())
// 2. Environment variables (PAGEBENCH__* prefix)
// 3. Config file (TOML/YAML/JSON)
// 4. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limiter::DEFAULT_BURST;
use crate::runner::{BenchMode, LimiterScope, RunnerConfig, DEFAULT_READ_WORKERS};
use crate::store::{FsyncPolicy, LogEngineOptions};
use crate::workload::{
    PayloadSpec, DEFAULT_PAYLOAD_MAX_BYTES, DEFAULT_PAYLOAD_MIN_BYTES, DEFAULT_PAYLOAD_POOL_SIZE,
};

/// Prefix of environment overrides, e.g. `PAGEBENCH__WORKLOAD__READ_QPS=500`
pub const ENV_PREFIX: &str = "PAGEBENCH";

/// Complete benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub workload: WorkloadConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub report: ReportConfig,
}

// ============================================================================
// Workload Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Write rate in `write` mode (0 = unlimited)
    pub write_qps: u64,

    /// Aggregate read rate in `read` mode (0 = unlimited)
    pub read_qps: u64,

    /// Write rate in `mix` mode
    pub mix_write_qps: u64,

    /// Read rate in `mix` mode
    pub mix_read_qps: u64,

    /// Token bucket capacity
    pub burst: u32,

    pub read_workers: usize,

    pub limiter_scope: LimiterScope,

    pub payload_pool_size: usize,
    pub payload_min_bytes: usize,
    pub payload_max_bytes: usize,

    /// Fixed seed for reproducible payloads and sampling
    pub seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            write_qps: 15_000,
            read_qps: 10_000,
            mix_write_qps: 10_000,
            mix_read_qps: 1_000,
            burst: DEFAULT_BURST,
            read_workers: DEFAULT_READ_WORKERS,
            limiter_scope: LimiterScope::Shared,
            payload_pool_size: DEFAULT_PAYLOAD_POOL_SIZE,
            payload_min_bytes: DEFAULT_PAYLOAD_MIN_BYTES,
            payload_max_bytes: DEFAULT_PAYLOAD_MAX_BYTES,
            seed: None,
        }
    }
}

// ============================================================================
// Store Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub fsync: FsyncPolicy,
    pub write_buffer_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("bench_workspace"),
            fsync: FsyncPolicy::Never,
            write_buffer_bytes: 256 * 1024,
        }
    }
}

// ============================================================================
// Metrics Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Serve the prometheus endpoint while running
    pub enabled: bool,
    pub listen_addr: String,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:6060".to_string(),
            path: "/debug/metrics/prometheus".to_string(),
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format (for log aggregation)
    Json,
}

// ============================================================================
// Report Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// Seconds between progress log lines (0 disables them)
    pub interval_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl BenchConfig {
    /// Load configuration with priority chain:
    /// 1. Environment variables (PAGEBENCH__*)
    /// 2. Config file (if provided)
    /// 3. Built-in defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let defaults_json =
            serde_json::to_string(&Self::default()).context("Failed to serialize defaults")?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("Failed to build config")?;
        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let workload = &self.workload;

        anyhow::ensure!(
            workload.read_workers > 0,
            "workload.read_workers must be > 0"
        );
        anyhow::ensure!(workload.burst > 0, "workload.burst must be > 0");
        anyhow::ensure!(
            workload.payload_pool_size > 0,
            "workload.payload_pool_size must be > 0"
        );
        anyhow::ensure!(
            workload.payload_min_bytes > 0,
            "workload.payload_min_bytes must be > 0"
        );
        anyhow::ensure!(
            workload.payload_min_bytes <= workload.payload_max_bytes,
            "workload.payload_min_bytes ({}) must be <= payload_max_bytes ({})",
            workload.payload_min_bytes,
            workload.payload_max_bytes
        );

        anyhow::ensure!(
            !self.store.data_dir.as_os_str().is_empty(),
            "store.data_dir cannot be empty"
        );
        anyhow::ensure!(
            self.store.write_buffer_bytes > 0,
            "store.write_buffer_bytes must be > 0"
        );

        self.metrics_addr()?;
        anyhow::ensure!(
            self.metrics.path.starts_with('/'),
            "metrics.path must start with '/', got '{}'",
            self.metrics.path
        );

        Ok(())
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics
            .listen_addr
            .parse()
            .with_context(|| format!("invalid metrics.listen_addr '{}'", self.metrics.listen_addr))
    }

    pub fn payload_spec(&self) -> PayloadSpec {
        PayloadSpec {
            count: self.workload.payload_pool_size,
            min_bytes: self.workload.payload_min_bytes,
            max_bytes: self.workload.payload_max_bytes,
        }
    }

    pub fn engine_options(&self) -> LogEngineOptions {
        LogEngineOptions {
            fsync: self.store.fsync,
            write_buffer_bytes: self.store.write_buffer_bytes,
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report.interval_secs)
    }

    /// Runner settings for `mode`; mixed runs use the `mix_*` rates.
    pub fn runner_config(&self, mode: &BenchMode) -> RunnerConfig {
        let workload = &self.workload;
        let (write_qps, read_qps) = match mode {
            BenchMode::Mix { .. } => (workload.mix_write_qps, workload.mix_read_qps),
            _ => (workload.write_qps, workload.read_qps),
        };

        RunnerConfig {
            write_qps,
            read_qps,
            burst: workload.burst,
            read_workers: workload.read_workers,
            limiter_scope: workload.limiter_scope,
            payload: self.payload_spec(),
            seed: workload.seed,
            report_interval: self.report_interval(),
        }
    }

    /// Override the rate of every loop `mode` runs
    pub fn override_qps(&mut self, mode: &BenchMode, qps: u64) {
        let workload = &mut self.workload;
        match mode {
            BenchMode::Write { .. } => workload.write_qps = qps,
            BenchMode::Read { .. } => workload.read_qps = qps,
            BenchMode::Mix { .. } => {
                workload.mix_write_qps = qps;
                workload.mix_read_qps = qps;
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config as TOML")
    }
}
