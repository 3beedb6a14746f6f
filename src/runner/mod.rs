//! Benchmark orchestration.
//!
//! [`BenchDriver`] runs one of three modes against a shared [`PageStore`]:
//! a single write loop, a pool of read workers, or both at once. Every loop
//! is gated by a [`RateLimiter`] and exits when the run token is cancelled.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod progress;
pub mod reader;
pub mod signal;
pub mod writer;

pub use progress::{spawn_progress_ticker, ProgressSample};
pub use reader::{ReadStats, ReadWorker, ReadWorkerPool, WorkerState};
pub use signal::{cancel_on_shutdown, shutdown_signal};
pub use writer::{WriteLoop, WriteLoopError, WriteReport};

use crate::metrics::BenchMonitor;
use crate::rate_limiter::{RateLimiter, DEFAULT_BURST};
use crate::store::PageStore;
use crate::workload::{PayloadSpec, ReadRange, WorkloadError, WriteGenerator};

/// Default number of concurrent read workers
pub const DEFAULT_READ_WORKERS: usize = 20;

/// How read workers share admission control
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterScope {
    /// One bucket for all readers; `read_qps` is the aggregate rate
    #[default]
    Shared,
    /// One bucket per reader, each at `read_qps / read_workers`
    PerWorker,
}

/// What to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchMode {
    Write {
        start_version: u64,
    },
    Read {
        range: ReadRange,
        miss: bool,
    },
    Mix {
        start_version: u64,
        range: ReadRange,
        miss: bool,
    },
}

impl BenchMode {
    pub fn name(&self) -> &'static str {
        match self {
            BenchMode::Write { .. } => "write",
            BenchMode::Read { .. } => "read",
            BenchMode::Mix { .. } => "mix",
        }
    }

    pub fn writes(&self) -> bool {
        matches!(self, BenchMode::Write { .. } | BenchMode::Mix { .. })
    }

    pub fn reads(&self) -> bool {
        matches!(self, BenchMode::Read { .. } | BenchMode::Mix { .. })
    }
}

impl fmt::Display for BenchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Write loop rate, 0 for unlimited
    pub write_qps: u64,
    /// Read rate, 0 for unlimited; see [`LimiterScope`]
    pub read_qps: u64,
    pub burst: u32,
    pub read_workers: usize,
    pub limiter_scope: LimiterScope,
    pub payload: PayloadSpec,
    pub seed: Option<u64>,
    /// Progress log interval, zero disables it
    pub report_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            write_qps: 15_000,
            read_qps: 10_000,
            burst: DEFAULT_BURST,
            read_workers: DEFAULT_READ_WORKERS,
            limiter_scope: LimiterScope::Shared,
            payload: PayloadSpec::default(),
            seed: None,
            report_interval: Duration::from_secs(10),
        }
    }
}

/// Counters of the read side of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReport {
    pub workers: usize,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

/// Outcome of [`BenchDriver::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub mode: BenchMode,
    pub write: Option<WriteReport>,
    pub read: Option<ReadReport>,
}

/// Drives load against the page store until cancelled
pub struct BenchDriver {
    store: Arc<PageStore>,
    monitor: Arc<BenchMonitor>,
    config: RunnerConfig,
}

impl BenchDriver {
    pub fn new(store: Arc<PageStore>, monitor: Arc<BenchMonitor>, config: RunnerConfig) -> Self {
        Self {
            store,
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `mode` until `cancel` fires or the write path fails.
    ///
    /// Configuration errors are reported before any worker starts. In mixed
    /// mode a write failure also stops the readers.
    pub async fn run(&self, mode: BenchMode, cancel: CancellationToken) -> Result<RunReport> {
        if mode.reads() && self.config.read_workers == 0 {
            return Err(WorkloadError::ZeroWorkers.into());
        }
        let writer = match mode {
            BenchMode::Write { start_version } | BenchMode::Mix { start_version, .. } => {
                Some(self.write_loop(start_version)?)
            }
            BenchMode::Read { .. } => None,
        };

        info!(mode = %mode, "benchmark started");

        let run = cancel.child_token();
        let ticker = spawn_progress_ticker(
            Arc::clone(&self.monitor),
            self.config.report_interval,
            run.child_token(),
        );

        let result = match (mode, writer) {
            (BenchMode::Write { .. }, Some(writer)) => writer
                .run(run.clone())
                .await
                .map(|write| RunReport {
                    mode,
                    write: Some(write),
                    read: None,
                })
                .context("write loop failed"),
            (BenchMode::Read { range, miss }, _) => self
                .read_until_cancelled(range, miss, &run)
                .await
                .map(|read| RunReport {
                    mode,
                    write: None,
                    read: Some(read),
                }),
            (BenchMode::Mix { range, miss, .. }, Some(writer)) => {
                self.run_mixed(mode, writer, range, miss, &run).await
            }
            (_, None) => Err(anyhow::anyhow!("{} mode requires a write loop", mode)),
        };

        // Stops the ticker too
        run.cancel();
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                error!(error = %e, "progress ticker task failed");
            }
        }

        info!(mode = %mode, ok = result.is_ok(), "benchmark finished");
        result
    }

    fn write_loop(&self, start_version: u64) -> Result<WriteLoop> {
        let generator = WriteGenerator::new(start_version, self.config.payload, self.config.seed)
            .context("failed to build write generator")?;
        Ok(WriteLoop::new(
            Arc::clone(&self.store),
            Arc::new(generator),
            Arc::new(RateLimiter::new(self.config.write_qps, self.config.burst)),
        ))
    }

    fn spawn_readers(
        &self,
        range: ReadRange,
        miss: bool,
        run: &CancellationToken,
    ) -> Result<ReadWorkerPool> {
        // Keep reader seeds away from the write generator's seed
        let seed = self.config.seed.map(|seed| seed.rotate_left(32));
        let pool = ReadWorkerPool::spawn(
            self.config.read_workers,
            range,
            miss,
            self.config.read_qps,
            self.config.burst,
            self.config.limiter_scope,
            seed,
            Arc::clone(&self.store),
            run,
        )?;
        Ok(pool)
    }

    async fn read_until_cancelled(
        &self,
        range: ReadRange,
        miss: bool,
        run: &CancellationToken,
    ) -> Result<ReadReport> {
        let mut pool = self.spawn_readers(range, miss, run)?;
        run.cancelled().await;
        Ok(Self::read_report(&mut pool).await)
    }

    async fn run_mixed(
        &self,
        mode: BenchMode,
        writer: WriteLoop,
        range: ReadRange,
        miss: bool,
        run: &CancellationToken,
    ) -> Result<RunReport> {
        let mut pool = self.spawn_readers(range, miss, run)?;

        let write = async {
            let result = writer.run(run.clone()).await;
            if result.is_err() {
                run.cancel();
            }
            result
        };
        let read = async {
            run.cancelled().await;
            Self::read_report(&mut pool).await
        };

        let (write, read) = tokio::join!(write, read);
        let write = write.context("write loop failed")?;

        Ok(RunReport {
            mode,
            write: Some(write),
            read: Some(read),
        })
    }

    async fn read_report(pool: &mut ReadWorkerPool) -> ReadReport {
        let stats = pool.stop_all().await;
        ReadReport {
            workers: pool.len(),
            hits: stats.hits,
            misses: stats.misses,
            errors: stats.errors,
            elapsed: pool.started().elapsed(),
        }
    }
}
