#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use crate::media::config::WorkerConfig;
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker_manager::WorkerManager;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, error, info};

struct PooledWorker {
    worker: Worker,
    routers: Arc<AtomicUsize>,
}

/// A worker picked for a new router. The lease counts toward the worker's
/// router load until it is released or dropped, whichever comes first.
pub struct WorkerLease {
    pub worker: Worker,
    load: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl WorkerLease {
    /// Routers currently counted against the leased worker.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Returns the slot to the pool. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.load.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Manages a fixed pool of mediasoup workers.
///
/// The pool fails closed: once any worker dies, `acquire` refuses to hand
/// out workers and the process is expected to be restarted.
pub struct WorkerPool {
    workers: StdMutex<Vec<PooledWorker>>,
    failed: Arc<AtomicBool>,
    // Dropping the manager tears down the worker threads
    _manager: WorkerManager,
}

impl WorkerPool {
    /// Starts `config.num_workers` workers.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if any worker fails to start
    pub async fn new(config: &WorkerConfig) -> MediaResult<Self> {
        info!("Creating worker pool with {} workers", config.num_workers);

        let manager = WorkerManager::new();
        let failed = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(config.num_workers);

        for index in 0..config.num_workers {
            let worker = manager
                .create_worker(config.to_worker_settings())
                .await
                .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;

            info!("Created worker {} with id: {}", index, worker.id());
            Self::setup_worker_handlers(&worker, index, Arc::clone(&failed));

            workers.push(PooledWorker {
                worker,
                routers: Arc::new(AtomicUsize::new(0)),
            });
        }

        Ok(Self {
            workers: StdMutex::new(workers),
            failed,
            _manager: manager,
        })
    }

    fn setup_worker_handlers(worker: &Worker, worker_index: usize, failed: Arc<AtomicBool>) {
        let worker_id = worker.id();
        worker
            .on_dead(move |reason| {
                error!(
                    "Worker {} (index {}) died: {:?}; refusing new rooms",
                    worker_id, worker_index, reason
                );
                failed.store(true, Ordering::SeqCst);
            })
            .detach();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Picks the worker hosting the fewest routers.
    ///
    /// # Errors
    /// `MediaError::EngineFailed` after a worker death, `MediaError::WorkerError`
    /// if the pool is empty
    pub fn acquire(&self) -> MediaResult<WorkerLease> {
        if self.is_failed() {
            return Err(MediaError::EngineFailed);
        }

        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let (index, best) = workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.routers.load(Ordering::Relaxed))
            .ok_or_else(|| MediaError::WorkerError("No workers available".to_string()))?;

        let load = best.routers.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Selected worker {} (index {}, {} routers)", best.worker.id(), index, load);

        Ok(WorkerLease {
            worker: best.worker.clone(),
            load: Arc::clone(&best.routers),
            released: AtomicBool::new(false),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drops every worker handle; workers close once their routers are gone.
    pub fn shutdown(&self) {
        info!("Shutting down all workers");
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
