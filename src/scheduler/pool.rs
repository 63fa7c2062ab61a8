//! Fixed pool of workers with round-robin dispatch

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use crate::engine::{Model, SessionParams};
use crate::error::Error;

use super::cancel::CancellationRegistry;
use super::prompt::PromptFormat;
use super::request::Request;
use super::worker::{WorkerHandle, WorkerSetup, WorkerState};

/// Owns the worker threads
///
/// Dispatch is static: the n-th submission goes to worker `n % worker_count`
/// regardless of backlog, so skewed workloads can queue unevenly.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    registry: Arc<CancellationRegistry>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers, each deriving its own session from
    /// `model`. Blocks until every worker is ready; if any fails, the ones
    /// already running are stopped and the error is returned.
    pub fn new<M: Model>(
        model: Arc<M>,
        worker_count: usize,
        params: SessionParams,
        format: PromptFormat,
        registry: Arc<CancellationRegistry>,
    ) -> Result<Self, Error> {
        if worker_count == 0 {
            return Err(Error::Initialization(
                "worker count must be at least 1".to_string(),
            ));
        }

        let format = Arc::new(format);
        let mut workers = Vec::with_capacity(worker_count);
        let mut pending = Vec::with_capacity(worker_count);
        let mut failure = None;

        for id in 0..worker_count {
            let setup = WorkerSetup {
                params: params.clone(),
                format: Arc::clone(&format),
                registry: Arc::clone(&registry),
            };
            match WorkerHandle::spawn(id, Arc::clone(&model), setup) {
                Ok((worker, ready)) => {
                    workers.push(worker);
                    pending.push((id, ready));
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        for (id, ready) in pending {
            let result = match ready.recv() {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => Error::Initialization(format!("worker {id}: {e}")),
                Err(_) => Error::Initialization(format!("worker {id} exited during startup")),
            };
            failure.get_or_insert(result);
        }

        let mut pool = Self {
            workers,
            next_worker: AtomicUsize::new(0),
            registry,
        };
        if let Some(e) = failure {
            pool.shutdown();
            return Err(e);
        }

        tracing::info!("Worker pool ready with {} workers", worker_count);
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Hand a request to the next worker in round-robin order and return
    /// that worker's ordinal. A stopping pool resolves the request as
    /// cancelled and returns `None`.
    pub(crate) fn submit_request(&self, mut request: Request) -> Option<usize> {
        if !self.workers.is_empty() {
            let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            let worker = &self.workers[index];
            tracing::debug!("Request {} -> worker {}", request.id(), worker.id());
            match worker.enqueue(request) {
                Ok(()) => return Some(index),
                Err(rejected) => request = rejected,
            }
        }

        let id = request.id();
        tracing::debug!("Request {} rejected: pool is stopping", id);
        request.finish(Err(Error::Cancelled));
        self.registry.clear(id);
        None
    }

    /// Threads currently owned by the pool
    pub(crate) fn thread_ids(&self) -> Vec<ThreadId> {
        self.workers.iter().filter_map(WorkerHandle::thread_id).collect()
    }

    /// Requests waiting in each worker's queue
    pub fn queue_depths(&self) -> Vec<usize> {
        self.workers.iter().map(WorkerHandle::queue_len).collect()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(WorkerHandle::state).collect()
    }

    /// Signal every worker, then join them all. Queued requests are
    /// cancelled; in-flight ones stop at their next token boundary.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for worker in &self.workers {
            worker.signal_shutdown();
        }
        for worker in &mut self.workers {
            worker.join();
        }
        tracing::info!("Worker pool stopped ({} workers)", self.workers.len());
        self.workers.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
