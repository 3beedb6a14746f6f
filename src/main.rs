//! pagestore-bench
//!
//! Rate-limited load generator for the page store.
//!
//! # Usage
//! ```bash
//! # Write pages starting after version 0 at the configured rate
//! pagestore-bench write
//!
//! # 20 readers over versions [1000, 2000), forcing misses
//! pagestore-bench read --start 1000 --end 2000 --miss
//!
//! # Writer and readers together, 500 ops/sec each
//! pagestore-bench --qps 500 mix --start 0 --end 1000
//!
//! # Environment overrides
//! PAGEBENCH__WORKLOAD__READ_WORKERS=8 RUST_LOG=pagestore_bench=debug pagestore-bench read --start 0 --end 10
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pagestore_bench::config::{BenchConfig, LogFormat};
use pagestore_bench::runner::{cancel_on_shutdown, BenchDriver, BenchMode};
use pagestore_bench::store::PageStore;
use pagestore_bench::workload::ReadRange;
use pagestore_bench::{BenchMonitor, OpKind, ResultsReporter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pagestore-bench")]
#[command(version)]
#[command(about = "Rate-limited read/write load harness for the page store", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override store data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the rate of the selected mode (0 = unlimited)
    #[arg(long, global = true)]
    qps: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Single write loop with increasing versions
    Write {
        /// Last version already in the store; writing starts after it
        #[arg(long, default_value_t = 0)]
        start_version: u64,
    },
    /// Parallel readers sampling versions from [start, end)
    Read {
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
        /// Read keys that can never exist
        #[arg(long)]
        miss: bool,
    },
    /// Write loop plus readers
    Mix {
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
        #[arg(long)]
        miss: bool,
        #[arg(long, default_value_t = 0)]
        start_version: u64,
    },
    /// Print the effective configuration as TOML and exit
    PrintConfig,
}

impl Command {
    fn mode(&self) -> Result<Option<BenchMode>> {
        let mode = match *self {
            Command::Write { start_version } => BenchMode::Write { start_version },
            Command::Read { start, end, miss } => BenchMode::Read {
                range: ReadRange::new(start, end)?,
                miss,
            },
            Command::Mix {
                start,
                end,
                miss,
                start_version,
            } => BenchMode::Mix {
                start_version,
                range: ReadRange::new(start, end)?,
                miss,
            },
            Command::PrintConfig => return Ok(None),
        };
        Ok(Some(mode))
    }
}

fn init_tracing(config: &BenchConfig) {
    let level = config.logging.level.as_str();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("pagestore_bench={},tower_http=warn", level).into());

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_thread_ids(true),
                )
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(true))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        BenchConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(data_dir) = &cli.data_dir {
        config.store.data_dir = data_dir.clone();
    }

    // Range errors surface here, before anything is opened
    let Some(mode) = cli.command.mode()? else {
        if let Some(qps) = cli.qps {
            config.workload.write_qps = qps;
            config.workload.read_qps = qps;
            config.workload.mix_write_qps = qps;
            config.workload.mix_read_qps = qps;
        }
        config.validate()?;
        print!("{}", config.to_toml()?);
        return Ok(());
    };

    if let Some(qps) = cli.qps {
        config.override_qps(&mode, qps);
    }
    config.validate()?;

    init_tracing(&config);
    info!("Starting pagestore-bench v{}", env!("CARGO_PKG_VERSION"));
    info!(
        mode = %mode,
        data_dir = %config.store.data_dir.display(),
        read_workers = config.workload.read_workers,
        "configuration loaded"
    );

    let monitor = Arc::new(BenchMonitor::new()?);
    if config.metrics.enabled {
        monitor
            .start(config.metrics_addr()?, &config.metrics.path)
            .await
            .context("Failed to start metrics endpoint")?;
    }

    let store = PageStore::open(
        &config.store.data_dir,
        config.engine_options(),
        monitor.clone(),
    )
    .with_context(|| format!("Failed to open page store at {}", config.store.data_dir.display()))?;
    let store = Arc::new(store);

    let cancel = CancellationToken::new();
    let signal_task = cancel_on_shutdown(cancel.clone());

    let driver = BenchDriver::new(
        Arc::clone(&store),
        Arc::clone(&monitor),
        config.runner_config(&mode),
    );
    let result = driver.run(mode, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = signal_task.await {
        error!(error = %e, "signal handler task failed");
    }

    if let Err(e) = store.close() {
        error!(error = %e, "failed to close page store");
    }
    monitor.stop().await;

    let report = result?;
    let latencies: Vec<_> = OpKind::ALL.iter().map(|op| monitor.summary(*op)).collect();
    ResultsReporter::print_summary(&report, &latencies);

    info!("pagestore-bench stopped");
    Ok(())
}
