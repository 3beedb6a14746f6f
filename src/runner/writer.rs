use crate::rate_limiter::RateLimiter;
use crate::store::{PageStore, StoreError};
use crate::workload::{WorkloadError, WriteGenerator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Why the write loop gave up
#[derive(Debug, Error)]
pub enum WriteLoopError {
    #[error("failed to write page version {version}")]
    Store {
        version: u64,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Workload(#[from] WorkloadError),
}

/// Result of a write loop that exited on cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub start_version: u64,
    /// Last version the store accepted, `None` if nothing was written
    pub last_version: Option<u64>,
    pub pages_written: u64,
    pub elapsed: Duration,
}

/// Single producer: token, generate, put, until cancelled or a put fails.
pub struct WriteLoop {
    store: Arc<PageStore>,
    generator: Arc<WriteGenerator>,
    limiter: Arc<RateLimiter>,
}

impl WriteLoop {
    pub fn new(
        store: Arc<PageStore>,
        generator: Arc<WriteGenerator>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            store,
            generator,
            limiter,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<WriteReport, WriteLoopError> {
        let start_version = self.generator.current_version();
        let started = Instant::now();
        let mut last_version = None;
        let mut pages_written = 0u64;

        info!(
            start_version,
            qps = ?self.limiter.rate(),
            "write loop started"
        );

        while self.limiter.acquire(&cancel).await.is_ok() {
            let (id, data) = self.generator.generate()?;
            let version = id.version;

            if let Err(source) = self.store.put_async(id, data).await {
                error!(
                    version,
                    pages_written,
                    error = %source,
                    "page write failed, stopping write loop"
                );
                return Err(WriteLoopError::Store { version, source });
            }

            last_version = Some(version);
            pages_written += 1;
        }

        info!(?last_version, pages_written, "write loop stopped");
        Ok(WriteReport {
            start_version,
            last_version,
            pages_written,
            elapsed: started.elapsed(),
        })
    }
}
