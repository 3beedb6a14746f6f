use super::LimiterScope;
use crate::rate_limiter::RateLimiter;
use crate::store::PageStore;
use crate::workload::{ReadGenerator, ReadRange, WorkloadError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a read worker.
///
/// `Idle -> Running` on [`ReadWorker::start`], `Running -> StopRequested` on
/// [`ReadWorker::request_stop`] (or cancellation of the parent token), and
/// `StopRequested -> Stopped` once the loop has exited. A worker stopped
/// before it was started goes `Idle -> StopRequested -> Stopped` without
/// ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::StopRequested,
            _ => WorkerState::Stopped,
        }
    }
}

/// Outcome counters of one or more read loops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl ReadStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses + self.errors
    }

    fn merge(&mut self, other: &ReadStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.errors += other.errors;
    }
}

struct ReadLoop {
    index: usize,
    store: Arc<PageStore>,
    limiter: Arc<RateLimiter>,
    generator: ReadGenerator,
}

impl ReadLoop {
    async fn run(mut self, stop: CancellationToken, state: Arc<AtomicU8>) -> ReadStats {
        let mut stats = ReadStats::default();
        debug!(worker = self.index, "read worker started");

        while self.limiter.acquire(&stop).await.is_ok() {
            let id = self.generator.generate();
            let version = id.version;
            match self.store.get_async(id).await {
                Ok(_) => stats.hits += 1,
                Err(e) if e.is_not_found() => {
                    stats.misses += 1;
                    debug!(worker = self.index, version, "page not found");
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(worker = self.index, version, error = %e, "page read failed");
                }
            }
        }

        let _ = state.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::StopRequested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        state.store(WorkerState::Stopped as u8, Ordering::Release);
        info!(
            worker = self.index,
            hits = stats.hits,
            misses = stats.misses,
            errors = stats.errors,
            "read worker stopped"
        );
        stats
    }
}

/// One reader task with its own generator.
///
/// The stop token is a child of the run token, so cancelling the run stops
/// every worker while [`ReadWorker::stop`] stops only this one.
pub struct ReadWorker {
    index: usize,
    state: Arc<AtomicU8>,
    stop: CancellationToken,
    pending: Option<ReadLoop>,
    handle: Option<JoinHandle<ReadStats>>,
    stats: ReadStats,
}

impl ReadWorker {
    pub fn new(
        index: usize,
        store: Arc<PageStore>,
        limiter: Arc<RateLimiter>,
        generator: ReadGenerator,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            index,
            state: Arc::new(AtomicU8::new(WorkerState::Idle as u8)),
            stop: parent.child_token(),
            pending: Some(ReadLoop {
                index,
                store,
                limiter,
                generator,
            }),
            handle: None,
            stats: ReadStats::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Spawn the read loop. Returns `false` if the worker was already started
    /// or asked to stop.
    pub fn start(&mut self) -> bool {
        if self.pending.is_none()
            || self
                .state
                .compare_exchange(
                    WorkerState::Idle as u8,
                    WorkerState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return false;
        }
        let Some(read_loop) = self.pending.take() else {
            return false;
        };

        let stop = self.stop.clone();
        let state = Arc::clone(&self.state);
        self.handle = Some(tokio::spawn(read_loop.run(stop, state)));
        true
    }

    /// Ask the loop to exit without waiting for it.
    ///
    /// A read already in flight completes first.
    pub fn request_stop(&self) {
        for from in [WorkerState::Idle, WorkerState::Running] {
            if self
                .state
                .compare_exchange(
                    from as u8,
                    WorkerState::StopRequested as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        self.stop.cancel();
    }

    /// Request the loop to exit and wait until it has.
    ///
    /// Returns the worker's counters. Safe to call repeatedly and on a worker
    /// that was never started.
    pub async fn stop(&mut self) -> ReadStats {
        self.request_stop();

        if self.pending.take().is_some() {
            self.state
                .store(WorkerState::Stopped as u8, Ordering::Release);
            return self.stats;
        }

        let Some(handle) = self.handle.take() else {
            return self.stats;
        };

        match handle.await {
            Ok(stats) => self.stats = stats,
            Err(e) => {
                error!(worker = self.index, error = %e, "read worker task failed");
                self.state
                    .store(WorkerState::Stopped as u8, Ordering::Release);
            }
        }
        self.stats
    }
}

/// Fixed set of read workers sharing one store
pub struct ReadWorkerPool {
    workers: Vec<ReadWorker>,
    started: Instant,
}

impl ReadWorkerPool {
    /// Build and start `count` workers over `range`.
    ///
    /// With [`LimiterScope::Shared`] all workers draw from one bucket of
    /// `qps`; with [`LimiterScope::PerWorker`] each gets `qps / count`
    /// (at least one). A `qps` of zero is unlimited either way.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        count: usize,
        range: ReadRange,
        miss: bool,
        qps: u64,
        burst: u32,
        scope: LimiterScope,
        seed: Option<u64>,
        store: Arc<PageStore>,
        parent: &CancellationToken,
    ) -> Result<Self, WorkloadError> {
        if count == 0 {
            return Err(WorkloadError::ZeroWorkers);
        }

        let shared = Arc::new(RateLimiter::new(qps, burst));
        let per_worker_qps = if qps == 0 {
            0
        } else {
            (qps / count as u64).max(1)
        };

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let limiter = match scope {
                LimiterScope::Shared => Arc::clone(&shared),
                LimiterScope::PerWorker => Arc::new(RateLimiter::new(per_worker_qps, burst)),
            };
            let generator = ReadGenerator::new(
                range,
                miss,
                seed.map(|seed| seed.wrapping_add(index as u64)),
            );
            workers.push(ReadWorker::new(
                index,
                Arc::clone(&store),
                limiter,
                generator,
                parent,
            ));
        }

        for worker in workers.iter_mut() {
            worker.start();
        }

        info!(
            workers = count,
            start = range.start(),
            end = range.end(),
            miss,
            qps,
            ?scope,
            "read workers started"
        );

        Ok(Self {
            workers,
            started: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(ReadWorker::state).collect()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Stop every worker and return the summed counters.
    pub async fn stop_all(&mut self) -> ReadStats {
        let mut total = ReadStats::default();
        for worker in self.workers.iter_mut() {
            let stats = worker.stop().await;
            total.merge(&stats);
        }
        info!(
            workers = self.workers.len(),
            hits = total.hits,
            misses = total.misses,
            errors = total.errors,
            "read workers stopped"
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{PageData, PageId};
    use crate::metrics::BenchMonitor;
    use crate::store::{LogEngineOptions, PageEngine, StoreError};
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Engine whose reads block until the test opens the gate
    #[derive(Default)]
    struct Gate {
        entered: AtomicBool,
        open: AtomicBool,
    }

    struct GatedEngine(Arc<Gate>);

    impl PageEngine for GatedEngine {
        fn put(&self, _key: &[u8], _value: &[u8]) -> Result<(), StoreError> {
            Ok(())
        }

        fn get(&self, _key: &[u8]) -> Result<Option<Bytes>, StoreError> {
            self.0.entered.store(true, Ordering::SeqCst);
            while !self.0.open.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(None)
        }

        fn len(&self) -> usize {
            0
        }

        fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn open_store(dir: &TempDir) -> Arc<PageStore> {
        let monitor = Arc::new(BenchMonitor::new().unwrap());
        Arc::new(PageStore::open(dir.path(), LogEngineOptions::default(), monitor).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_state_transitions() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let root = CancellationToken::new();

        let generator = ReadGenerator::new(ReadRange::new(0, 10).unwrap(), false, Some(1));
        let mut worker = ReadWorker::new(0, store, Arc::new(RateLimiter::new(1000, 10)), generator, &root);
        assert_eq!(worker.state(), WorkerState::Idle);

        assert!(worker.start());
        assert!(!worker.start());
        assert_eq!(worker.state(), WorkerState::Running);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(stats.misses > 0);
        assert_eq!(stats.hits, 0);

        // Second stop returns the same counters
        assert_eq!(worker.stop().await, stats);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let root = CancellationToken::new();

        let generator = ReadGenerator::new(ReadRange::new(0, 10).unwrap(), false, None);
        let mut worker = ReadWorker::new(3, store, Arc::new(RateLimiter::unlimited()), generator, &root);
        assert_eq!(worker.stop().await, ReadStats::default());
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.start());
    }

    #[tokio::test]
    async fn test_stop_while_blocked_in_acquire() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let root = CancellationToken::new();

        // One token, then a wait of a full second for the next
        let limiter = Arc::new(RateLimiter::new(1, 1));
        let generator = ReadGenerator::new(ReadRange::new(0, 10).unwrap(), false, Some(2));
        let mut worker = ReadWorker::new(0, store, limiter, generator, &root);
        worker.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = tokio::time::timeout(Duration::from_millis(200), worker.stop())
            .await
            .expect("stop should not wait for the next token");
        assert_eq!(stats.total(), 1);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_requested_while_read_in_flight() {
        let gate = Arc::new(Gate::default());
        let monitor = Arc::new(BenchMonitor::new().unwrap());
        let store = Arc::new(PageStore::with_engine(
            Box::new(GatedEngine(Arc::clone(&gate))),
            monitor,
        ));
        let root = CancellationToken::new();

        let generator = ReadGenerator::new(ReadRange::new(0, 10).unwrap(), false, Some(4));
        let mut worker = ReadWorker::new(0, store, Arc::new(RateLimiter::unlimited()), generator, &root);
        worker.start();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !gate.entered.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "worker never reached the store");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // The loop cannot exit while its read is blocked
        worker.request_stop();
        assert_eq!(worker.state(), WorkerState::StopRequested);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.state(), WorkerState::StopRequested);

        gate.open.store(true, Ordering::SeqCst);
        let stats = tokio::time::timeout(Duration::from_secs(2), worker.stop())
            .await
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_request_stop_before_start() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let root = CancellationToken::new();

        let generator = ReadGenerator::new(ReadRange::new(0, 10).unwrap(), false, None);
        let mut worker = ReadWorker::new(1, store, Arc::new(RateLimiter::unlimited()), generator, &root);
        worker.request_stop();
        assert_eq!(worker.state(), WorkerState::StopRequested);
        assert!(!worker.start());

        assert_eq!(worker.stop().await, ReadStats::default());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_reads_existing_pages() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for version in 0..10 {
            store
                .put(&PageId::root(version), &PageData::new(vec![version as u8; 16]))
                .unwrap();
        }

        let root = CancellationToken::new();
        let mut pool = ReadWorkerPool::spawn(
            4,
            ReadRange::new(0, 10).unwrap(),
            false,
            0,
            100,
            LimiterScope::Shared,
            Some(7),
            Arc::clone(&store),
            &root,
        )
        .unwrap();
        assert_eq!(pool.len(), 4);

        tokio::time::sleep(Duration::from_millis(30)).await;
        root.cancel();
        let stats = pool.stop_all().await;

        assert!(stats.hits > 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.errors, 0);
        assert!(pool.states().iter().all(|s| *s == WorkerState::Stopped));
    }

    #[tokio::test]
    async fn test_pool_rejects_zero_workers() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let root = CancellationToken::new();

        let result = ReadWorkerPool::spawn(
            0,
            ReadRange::new(0, 10).unwrap(),
            false,
            100,
            10,
            LimiterScope::PerWorker,
            None,
            store,
            &root,
        );
        assert!(matches!(result, Err(WorkloadError::ZeroWorkers)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parent_cancel_stops_workers() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let root = CancellationToken::new();

        let mut pool = ReadWorkerPool::spawn(
            3,
            ReadRange::new(0, 100).unwrap(),
            true,
            1,
            1,
            LimiterScope::PerWorker,
            None,
            store,
            &root,
        )
        .unwrap();

        root.cancel();
        let stats = tokio::time::timeout(Duration::from_millis(500), pool.stop_all())
            .await
            .unwrap();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.errors, 0);
        assert!(pool.states().iter().all(|s| *s == WorkerState::Stopped));
    }
}
