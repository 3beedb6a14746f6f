//! Page store facade.
//!
//! Wraps an ordered key-value engine behind page-level `put`/`get`, encodes
//! identifiers with the key codec and reports the wall-clock duration of
//! every call to a [`DurationRecorder`], whether the call succeeded or not.

pub mod log_engine;

pub use log_engine::{FsyncPolicy, LogEngine, LogEngineOptions};

use crate::key::{PageData, PageId};
use crate::metrics::{DurationRecorder, OpKind};
use bytes::Bytes;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page not found")]
    NotFound,

    #[error("page log corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("page log header invalid: {0}")]
    BadHeader(String),

    #[error("recovery after corruption failed: {source}")]
    Recovery {
        #[source]
        source: Box<StoreError>,
    },

    #[error("page store is closed")]
    Closed,

    #[error("record of {0} bytes exceeds the frame size limit")]
    TooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Damage detected while opening; worth one recovery attempt
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupted { .. } | StoreError::BadHeader(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Contract the benchmark needs from a storage engine.
///
/// Implementations must be safe for concurrent `put`/`get` from many threads;
/// the store facade adds no locking of its own around individual calls.
pub trait PageEngine: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// `Ok(None)` when the key is absent
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and release the engine; must tolerate repeated calls.
    fn close(&self) -> Result<(), StoreError>;
}

/// Shared handle to the page store under test.
///
/// Concurrent callers are expected; each `put`/`get` is a single engine call.
/// After [`PageStore::close`] every operation fails with [`StoreError::Closed`].
pub struct PageStore {
    engine: RwLock<Option<Box<dyn PageEngine>>>,
    recorder: Arc<dyn DurationRecorder>,
}

impl PageStore {
    /// Open the log engine under `dir`, recovering once if it is corrupted.
    pub fn open(
        dir: impl AsRef<Path>,
        options: LogEngineOptions,
        recorder: Arc<dyn DurationRecorder>,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref();

        let engine = match LogEngine::open(dir, options) {
            Ok(engine) => engine,
            Err(e) if e.is_corruption() => {
                warn!(error = %e, dir = %dir.display(), "page store corrupted, attempting recovery");
                LogEngine::recover(dir, options).map_err(|source| {
                    error!(error = %source, dir = %dir.display(), "page store recovery failed");
                    StoreError::Recovery {
                        source: Box::new(source),
                    }
                })?
            }
            Err(e) => return Err(e),
        };

        info!(dir = %dir.display(), pages = engine.len(), "page store opened");
        Ok(Self::with_engine(Box::new(engine), recorder))
    }

    /// Wrap an already open engine
    pub fn with_engine(engine: Box<dyn PageEngine>, recorder: Arc<dyn DurationRecorder>) -> Self {
        Self {
            engine: RwLock::new(Some(engine)),
            recorder,
        }
    }

    pub fn put(&self, id: &PageId, data: &PageData) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = match self.engine.read().as_ref() {
            Some(engine) => engine.put(&id.encode(), &data.raw),
            None => Err(StoreError::Closed),
        };
        self.recorder
            .record_duration(OpKind::Write, start.elapsed(), result.is_ok());
        result
    }

    /// Fetch a page; an absent key is [`StoreError::NotFound`].
    pub fn get(&self, id: &PageId) -> Result<PageData, StoreError> {
        let start = Instant::now();
        let result = match self.engine.read().as_ref() {
            Some(engine) => engine
                .get(&id.encode())
                .and_then(|value| value.map(PageData::new).ok_or(StoreError::NotFound)),
            None => Err(StoreError::Closed),
        };
        self.recorder
            .record_duration(OpKind::Read, start.elapsed(), result.is_ok());
        result
    }

    /// [`PageStore::put`] on the blocking pool.
    ///
    /// Engine calls do file I/O; running them here keeps them off the async
    /// worker threads so concurrent callers are not capped by runtime size.
    pub async fn put_async(self: &Arc<Self>, id: PageId, data: PageData) -> Result<(), StoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.put(&id, &data)).await?
    }

    /// [`PageStore::get`] on the blocking pool
    pub async fn get_async(self: &Arc<Self>, id: PageId) -> Result<PageData, StoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.get(&id)).await?
    }

    /// Number of distinct pages in the engine
    pub fn page_count(&self) -> Result<usize, StoreError> {
        self.engine
            .read()
            .as_ref()
            .map(|engine| engine.len())
            .ok_or(StoreError::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Close the engine. Closing an already closed store is a no-op.
    ///
    /// Waits for in-flight `put`/`get` calls to finish.
    pub fn close(&self) -> Result<(), StoreError> {
        let Some(engine) = self.engine.write().take() else {
            return Ok(());
        };
        engine.close()?;
        info!("page store closed");
        Ok(())
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close page store on drop");
        }
    }
}
