//! Latency collection for store operations.
//!
//! [`BenchMonitor`] is constructed explicitly and handed to the store and the
//! driver. It keeps two views of every observation:
//! - a prometheus histogram (`time_metric`, labelled `write` / `read`) that
//!   can be scraped while the benchmark runs
//! - an in-process HDR histogram per operation kind for the end-of-run summary

use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use prometheus::{HistogramOpts, HistogramVec, Registry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub mod reporter;
pub mod server;

pub use reporter::ResultsReporter;
use server::MetricsServer;

/// Name of the prometheus histogram
pub const TIME_METRIC_NAME: &str = "time_metric";

/// Kind of store operation being timed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Write,
    Read,
}

impl OpKind {
    pub const ALL: [OpKind; 2] = [OpKind::Write, OpKind::Read];

    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Write => "write",
            OpKind::Read => "read",
        }
    }

    fn slot(&self) -> usize {
        match self {
            OpKind::Write => 0,
            OpKind::Read => 1,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sink for the duration of each store call
pub trait DurationRecorder: Send + Sync {
    fn record_duration(&self, op: OpKind, elapsed: Duration, ok: bool);
}

/// Latency distribution of one operation kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub op: OpKind,
    pub successes: u64,
    pub failures: u64,
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Operation counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub writes: u64,
    pub reads: u64,
}

struct OpStats {
    histogram: Mutex<Histogram<u64>>,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl OpStats {
    fn new() -> Result<Self> {
        Ok(Self {
            histogram: Mutex::new(Histogram::new(3)?),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    fn total(&self) -> u64 {
        self.successes.load(Ordering::Relaxed) + self.failures.load(Ordering::Relaxed)
    }
}

/// Metrics collector for one benchmark run
pub struct BenchMonitor {
    registry: Registry,
    time_metric: HistogramVec,
    stats: [OpStats; 2],
    server: Mutex<Option<MetricsServer>>,
}

impl BenchMonitor {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let time_metric = HistogramVec::new(
            HistogramOpts::new(
                TIME_METRIC_NAME,
                "Track the time of read/write from/to page store.",
            )
            .buckets(prometheus::DEFAULT_BUCKETS.to_vec()),
            &[TIME_METRIC_NAME],
        )?;
        registry.register(Box::new(time_metric.clone()))?;

        Ok(Self {
            registry,
            time_metric,
            stats: [OpStats::new()?, OpStats::new()?],
            server: Mutex::new(None),
        })
    }

    /// Serve the prometheus exposition on `listen_addr` under `path`.
    ///
    /// Returns the bound address. Calling it while already serving returns
    /// the existing address.
    pub async fn start(&self, listen_addr: SocketAddr, path: &str) -> Result<SocketAddr> {
        if let Some(server) = self.server.lock().as_ref() {
            return Ok(server.local_addr());
        }

        let server = MetricsServer::bind(listen_addr, path, self.registry.clone()).await?;
        let addr = server.local_addr();

        let raced = {
            let mut slot = self.server.lock();
            match slot.as_ref().map(MetricsServer::local_addr) {
                Some(existing) => Some((existing, server)),
                None => {
                    *slot = Some(server);
                    None
                }
            }
        };

        // Lost a race with a concurrent start
        if let Some((existing, server)) = raced {
            server.shutdown().await;
            return Ok(existing);
        }
        Ok(addr)
    }

    /// Stop serving; a no-op when not started.
    pub async fn stop(&self) {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await;
        }
    }

    pub fn is_serving(&self) -> bool {
        self.server.lock().is_some()
    }

    /// Prometheus text exposition of the registry
    pub fn render(&self) -> Result<String> {
        server::encode_registry(&self.registry)
    }

    pub fn counts(&self) -> OpCounts {
        OpCounts {
            writes: self.stats[OpKind::Write.slot()].total(),
            reads: self.stats[OpKind::Read.slot()].total(),
        }
    }

    pub fn summary(&self, op: OpKind) -> LatencySummary {
        let stats = &self.stats[op.slot()];
        let histogram = stats.histogram.lock();

        LatencySummary {
            op,
            successes: stats.successes.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            min_us: histogram.min(),
            mean_us: histogram.mean(),
            p50_us: histogram.value_at_quantile(0.50),
            p95_us: histogram.value_at_quantile(0.95),
            p99_us: histogram.value_at_quantile(0.99),
            p999_us: histogram.value_at_quantile(0.999),
            max_us: histogram.max(),
        }
    }
}

impl DurationRecorder for BenchMonitor {
    fn record_duration(&self, op: OpKind, elapsed: Duration, ok: bool) {
        self.time_metric
            .with_label_values(&[op.label()])
            .observe(elapsed.as_secs_f64());

        let stats = &self.stats[op.slot()];
        let _ = stats.histogram.lock().record(elapsed.as_micros() as u64);
        if ok {
            stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
