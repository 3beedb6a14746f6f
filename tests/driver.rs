// Driver modes, cancellation and write-path failure handling

use bytes::Bytes;
use pagestore_bench::runner::{BenchDriver, BenchMode, LimiterScope, RunnerConfig};
use pagestore_bench::store::{LogEngineOptions, PageEngine};
use pagestore_bench::{
    BenchMonitor, OpKind, PageStore, PayloadSpec, ReadRange, StoreError, WriteGenerator,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        write_qps: 0,
        read_qps: 0,
        read_workers: 4,
        payload: PayloadSpec {
            count: 4,
            min_bytes: 32,
            max_bytes: 96,
        },
        seed: Some(11),
        report_interval: Duration::ZERO,
        ..RunnerConfig::default()
    }
}

fn cancel_after(cancel: &CancellationToken, delay: Duration) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        cancel.cancel();
    });
}

/// In-memory engine whose puts start failing after a fixed number of writes
struct FlakyEngine {
    pages: Mutex<BTreeMap<Vec<u8>, Bytes>>,
    puts_before_failure: usize,
    puts: AtomicUsize,
}

impl FlakyEngine {
    fn new(puts_before_failure: usize) -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            puts_before_failure,
            puts: AtomicUsize::new(0),
        }
    }
}

impl PageEngine for FlakyEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if self.puts.fetch_add(1, Ordering::SeqCst) >= self.puts_before_failure {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.pages
            .lock()
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.pages.lock().get(key).cloned())
    }

    fn len(&self) -> usize {
        self.pages.lock().len()
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// How many reads are running at once
#[derive(Default)]
struct ReadTracker {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Engine with slow reads
struct SlowReadEngine(Arc<ReadTracker>);

impl PageEngine for SlowReadEngine {
    fn put(&self, _key: &[u8], _value: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, _key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }

    fn len(&self) -> usize {
        0
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_run_in_parallel_beyond_runtime_threads() {
    let tracker = Arc::new(ReadTracker::default());
    let monitor = Arc::new(BenchMonitor::new().unwrap());
    let store = Arc::new(PageStore::with_engine(
        Box::new(SlowReadEngine(Arc::clone(&tracker))),
        monitor.clone(),
    ));
    let driver = BenchDriver::new(
        store,
        monitor,
        RunnerConfig {
            read_workers: 20,
            ..runner_config()
        },
    );

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(500));

    let mode = BenchMode::Read {
        range: ReadRange::new(0, 100).unwrap(),
        miss: false,
    };
    let read = driver.run(mode, cancel).await.unwrap().read.unwrap();

    // Two runtime threads, twenty readers each blocked 50ms per read
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 20);
    assert!(read.misses >= 100, "only {} reads", read.misses);
    assert_eq!(tracker.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_mode_until_cancelled() {
    let dir = TempDir::new().unwrap();
    let monitor = Arc::new(BenchMonitor::new().unwrap());
    let store = Arc::new(
        PageStore::open(dir.path(), LogEngineOptions::default(), monitor.clone()).unwrap(),
    );
    let driver = BenchDriver::new(
        Arc::clone(&store),
        monitor.clone(),
        RunnerConfig {
            write_qps: 1_000,
            ..runner_config()
        },
    );

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(200));

    let report = driver
        .run(BenchMode::Write { start_version: 10 }, cancel)
        .await
        .unwrap();
    let write = report.write.unwrap();
    assert!(report.read.is_none());

    assert_eq!(write.start_version, 10);
    assert!(write.pages_written > 0);
    assert_eq!(write.last_version, Some(10 + write.pages_written));
    assert_eq!(store.page_count().unwrap() as u64, write.pages_written);
    // Burst of 100 plus 1000/s for 0.2s, with slack for scheduling
    assert!(write.pages_written <= 400, "wrote {}", write.pages_written);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_mode_counts_hits() {
    let dir = TempDir::new().unwrap();
    let monitor = Arc::new(BenchMonitor::new().unwrap());
    let store = Arc::new(
        PageStore::open(dir.path(), LogEngineOptions::default(), monitor.clone()).unwrap(),
    );

    // Versions 1..=50 exist
    let generator = WriteGenerator::new(0, runner_config().payload, Some(1)).unwrap();
    for _ in 0..50 {
        let (id, data) = generator.generate().unwrap();
        store.put(&id, &data).unwrap();
    }

    let driver = BenchDriver::new(
        Arc::clone(&store),
        monitor.clone(),
        RunnerConfig {
            limiter_scope: LimiterScope::PerWorker,
            ..runner_config()
        },
    );
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(100));

    let mode = BenchMode::Read {
        range: ReadRange::new(1, 51).unwrap(),
        miss: false,
    };
    let report = driver.run(mode, cancel).await.unwrap();
    let read = report.read.unwrap();

    assert_eq!(read.workers, 4);
    assert!(read.hits > 0);
    assert_eq!(read.misses, 0);
    assert_eq!(read.errors, 0);
    assert_eq!(monitor.summary(OpKind::Read).successes, read.hits);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_reaches_workers_blocked_on_tokens() {
    let dir = TempDir::new().unwrap();
    let monitor = Arc::new(BenchMonitor::new().unwrap());
    let store = Arc::new(
        PageStore::open(dir.path(), LogEngineOptions::default(), monitor.clone()).unwrap(),
    );

    // One token each, then a second-long wait
    let driver = BenchDriver::new(
        store,
        monitor,
        RunnerConfig {
            write_qps: 1,
            read_qps: 1,
            burst: 1,
            read_workers: 8,
            limiter_scope: LimiterScope::PerWorker,
            ..runner_config()
        },
    );

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(50));

    let mode = BenchMode::Mix {
        start_version: 0,
        range: ReadRange::new(0, 100).unwrap(),
        miss: true,
    };
    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(2), driver.run(mode, cancel))
        .await
        .expect("driver should stop promptly")
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(report.write.unwrap().pages_written, 1);
    let read = report.read.unwrap();
    assert_eq!(read.hits, 0);
    assert_eq!(read.misses, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_failure_ends_mixed_run() {
    let monitor = Arc::new(BenchMonitor::new().unwrap());
    let store = Arc::new(PageStore::with_engine(
        Box::new(FlakyEngine::new(5)),
        monitor.clone(),
    ));
    let driver = BenchDriver::new(Arc::clone(&store), monitor.clone(), runner_config());

    let mode = BenchMode::Mix {
        start_version: 0,
        range: ReadRange::new(1, 6).unwrap(),
        miss: false,
    };

    // Never cancelled: the run must end on its own
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        driver.run(mode, CancellationToken::new()),
    )
    .await
    .expect("write failure should stop the run");

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("disk full"));
    assert_eq!(store.page_count().unwrap(), 5);

    let writes = monitor.summary(OpKind::Write);
    assert_eq!(writes.successes, 5);
    assert_eq!(writes.failures, 1);
}
