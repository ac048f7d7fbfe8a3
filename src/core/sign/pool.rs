//! Worker pool shared by digest computations

use crate::error::{Result, ZFileError};
use std::sync::Arc;

/// Handle to a rayon thread pool
///
/// Cloning is cheap; every clone runs work on the same threads.
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<rayon::ThreadPool>,
}

impl WorkerPool {
    /// Build a pool with `threads` workers (0 picks one per CPU)
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("zfile-worker-{}", i))
            .build()
            .map_err(|e| ZFileError::Config(format!("Cannot start worker pool: {}", e)))?;

        Ok(WorkerPool {
            pool: Arc::new(pool),
        })
    }

    /// Run `op` inside the pool; parallel iterators in `op` use its threads
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .finish()
    }
}
