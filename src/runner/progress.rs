use crate::metrics::{BenchMonitor, OpCounts};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Operation counts and rates over one reporting interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub writes: u64,
    pub reads: u64,
    pub write_rate: f64,
    pub read_rate: f64,
}

impl ProgressSample {
    pub fn between(previous: OpCounts, current: OpCounts, elapsed: Duration) -> Self {
        let writes = current.writes.saturating_sub(previous.writes);
        let reads = current.reads.saturating_sub(previous.reads);
        let secs = elapsed.as_secs_f64();
        let rate = |count: u64| if secs > 0.0 { count as f64 / secs } else { 0.0 };

        Self {
            writes,
            reads,
            write_rate: rate(writes),
            read_rate: rate(reads),
        }
    }
}

/// Spawn a task logging per-interval throughput until `cancel` fires.
///
/// Returns `None` when `interval` is zero.
pub fn spawn_progress_ticker(
    monitor: Arc<BenchMonitor>,
    interval: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut previous = monitor.counts();
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let current = monitor.counts();
                    let now = Instant::now();
                    let sample = ProgressSample::between(previous, current, now - last);
                    info!(
                        writes = sample.writes,
                        reads = sample.reads,
                        write_rate = sample.write_rate.round() as u64,
                        read_rate = sample.read_rate.round() as u64,
                        total_writes = current.writes,
                        total_reads = current.reads,
                        "progress"
                    );
                    previous = current;
                    last = now;
                }
            }
        }
    }))
}
