//! Bounded pool for blocking work.
//!
//! Document extraction and other CPU- or disk-bound jobs are submitted here
//! instead of running on the async executor. At most `threads` jobs run at
//! once; the rest wait for a permit.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let size = threads.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on the blocking pool and wait for its result.
    pub async fn submit<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("worker pool closed"))?;

        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            // receiver may have been dropped by a cancelled caller
            let _ = tx.send(job());
        });

        rx.await.map_err(|_| anyhow!("worker job panicked"))
    }
}
