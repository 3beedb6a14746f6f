//! Page store load-testing harness
//!
//! Drives rate-limited read/write traffic against a versioned key-value page
//! store and records the latency of every store call.
//!
//! # Architecture
//!
//! ```text
//! pagestore_bench
//! ├── key           # Page identifiers and their order-preserving key encoding
//! ├── rate_limiter  # Cancellable token bucket admission control
//! ├── workload/     # Write (monotonic versions) and read (range sampling) generators
//! ├── store/        # Page store facade and the append-only log engine
//! ├── metrics/      # Prometheus + HDR latency collection and reporting
//! ├── runner/       # Write loop, read worker pool, driver, shutdown
//! └── config        # Layered configuration (defaults, file, environment)
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use pagestore_bench::{BenchConfig, BenchDriver, BenchMode, BenchMonitor, PageStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchConfig::default();
//!     let monitor = Arc::new(BenchMonitor::new()?);
//!     let store = PageStore::open(&config.store.data_dir, config.engine_options(), monitor.clone())?;
//!
//!     let mode = BenchMode::Write { start_version: 0 };
//!     let driver = BenchDriver::new(Arc::new(store), monitor, config.runner_config(&mode));
//!     let report = driver.run(mode, CancellationToken::new()).await?;
//!     println!("{:?}", report.write);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod key;
pub mod metrics;
pub mod rate_limiter;
pub mod runner;
pub mod store;
pub mod workload;

pub use config::BenchConfig;
pub use key::{encode_key, OwnerHash, PageData, PageId};
pub use metrics::{BenchMonitor, DurationRecorder, LatencySummary, OpKind, ResultsReporter};
pub use rate_limiter::{Cancelled, RateLimiter, TokenBucket};
pub use runner::{BenchDriver, BenchMode, LimiterScope, RunReport, RunnerConfig};
pub use store::{LogEngine, LogEngineOptions, PageEngine, PageStore, StoreError};
pub use workload::{PayloadSpec, ReadGenerator, ReadRange, WorkloadError, WriteGenerator};
