//! Dedicated OS worker threads.
//!
//! Each thread owns a single-threaded tokio runtime, so job code never blocks
//! the main runtime. Threads block on the channel; dropping the sender ends
//! them once the channel is drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

use super::PoolShared;
use crate::config::WorkerPoolConfig;
use crate::core::error::{JobServiceError, Result};
use crate::infra::work_queue::ClaimedRecord;

/// Time allowed for each worker to finish its current job on shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A claimed record plus the worker slot it occupies.
pub(crate) struct WorkerTask {
    pub claim: ClaimedRecord,
    pub permit: OwnedSemaphorePermit,
}

/// Handle on the worker threads.
pub(crate) struct WorkerThreads {
    shared: Arc<PoolShared>,
    task_tx: Mutex<Option<Sender<WorkerTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerThreads {
    /// Spawn `config.worker_count` threads.
    pub(crate) fn spawn(config: &WorkerPoolConfig, shared: Arc<PoolShared>) -> Result<Self> {
        let capacity = config.max_queue_depth.max(config.worker_count);
        let (task_tx, task_rx) = bounded::<WorkerTask>(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                worker_id,
                task_rx.clone(),
                Arc::clone(&shared),
                Arc::clone(&shutdown),
                config.thread_stack_size,
            )
            .map_err(|e| {
                JobServiceError::Internal(format!("failed to spawn worker thread {worker_id}: {e}"))
            })?;
            workers.push(worker);
        }
        info!(
            worker_count = config.worker_count,
            channel_capacity = capacity,
            "Worker threads started"
        );

        Ok(Self {
            shared,
            task_tx: Mutex::new(Some(task_tx)),
            workers: Mutex::new(workers),
            shutdown,
        })
    }

    pub(crate) const fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Hand a task to the threads; gives the task back when they are gone.
    pub(crate) fn submit(&self, task: WorkerTask) -> std::result::Result<(), WorkerTask> {
        let guard = self.task_tx.lock();
        let Some(task_tx) = guard.as_ref() else {
            return Err(task);
        };
        match task_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task) | TrySendError::Disconnected(task)) => Err(task),
        }
    }

    /// Close the channel and join the threads, waiting [`JOIN_TIMEOUT`] per
    /// thread. Queued records are given back instead of run.
    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker threads");
        *self.task_tx.lock() = None;

        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });
            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => debug!(worker_id = idx, "Worker joined"),
                Ok(false) => warn!(worker_id = idx, "Worker panicked"),
                Err(_) => {
                    warn!(worker_id = idx, "Worker did not exit in time, detaching");
                    continue;
                }
            }
            let _ = join_thread.join();
        }
        info!(worker_count, "Worker threads shut down");
    }

    /// Signal the threads to stop without joining them.
    pub(crate) fn detach(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            *self.task_tx.lock() = None;
            debug!("Worker threads detached without explicit shutdown");
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    task_rx: Receiver<WorkerTask>,
    shared: Arc<PoolShared>,
    shutdown: Arc<AtomicBool>,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("js-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id, "Worker thread started");
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to create worker runtime");
                    return;
                }
            };

            while let Ok(task) = task_rx.recv() {
                let WorkerTask { claim, permit } = task;
                shared.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);

                if shutdown.load(Ordering::Acquire) {
                    rt.block_on(shared.give_back(&claim));
                    drop(permit);
                    continue;
                }

                let job_id = claim.record.tracking_id();
                debug!(worker_id, job_id = %job_id, job_name = %claim.record.name, "Worker executing job");
                shared.counters.active_jobs.fetch_add(1, Ordering::Relaxed);
                rt.block_on(shared.process(claim));
                shared.counters.active_jobs.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
                debug!(worker_id, job_id = %job_id, "Worker completed job");
            }
            debug!(worker_id, "Worker thread exiting");
        })
}
