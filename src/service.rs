//! Service facade
//!
//! `Service` owns the engine, the loaded model and the worker pool, and is
//! the only entry point callers need: initialize, submit, cancel, shut down.
//! It is an ordinary value; construct one per model and pass it around.

use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::{Condvar, Mutex};
use tokio::sync::{mpsc as async_mpsc, oneshot};

use crate::config::ServiceConfig;
use crate::engine::{Engine, SessionParams};
use crate::error::Error;
use crate::scheduler::{
    Callbacks, CancellationRegistry, PromptFormat, Request, RequestId, WorkerPool, WorkerState,
};

/// Returned by `generate_sync` when a request is rejected or fails
pub const SENTINEL_BAD: &str = "__BAD__";

/// Returned by `generate_sync` when no result arrives in time
pub const SENTINEL_TIMEOUT: &str = "__TIMEOUT__";

/// Lifecycle state of a [`Service`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Ready,
    ShuttingDown,
}

/// Live resources of an initialized service
struct Runtime<M> {
    pool: WorkerPool,
    model: Arc<M>,
    config: ServiceConfig,
}

enum Slot<M> {
    Uninitialized,
    Ready(Runtime<M>),
    /// Holds the threads being joined
    ShuttingDown(Vec<ThreadId>),
}

impl<M> Slot<M> {
    fn state(&self) -> ServiceState {
        match self {
            Slot::Uninitialized => ServiceState::Uninitialized,
            Slot::Ready(_) => ServiceState::Ready,
            Slot::ShuttingDown(_) => ServiceState::ShuttingDown,
        }
    }
}

/// Inference scheduler facade
pub struct Service<E: Engine> {
    engine: E,
    state: Mutex<Slot<E::Model>>,
    /// Signalled when a shutdown finishes
    stopped: Condvar,
    /// Serializes initialize against the start of shutdown
    lifecycle: Mutex<()>,
    registry: Arc<CancellationRegistry>,
    next_id: AtomicU64,
}

impl<E: Engine> Service<E> {
    /// Create an uninitialized service
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: Mutex::new(Slot::Uninitialized),
            stopped: Condvar::new(),
            lifecycle: Mutex::new(()),
            registry: Arc::new(CancellationRegistry::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn state(&self) -> ServiceState {
        self.state.lock().state()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// Configuration of the running service
    pub fn config(&self) -> Option<ServiceConfig> {
        match &*self.state.lock() {
            Slot::Ready(runtime) => Some(runtime.config.clone()),
            _ => None,
        }
    }

    /// Load the model and start the workers. Blocks until every worker is
    /// ready. Fails if the service is not uninitialized.
    pub fn initialize(&self, config: ServiceConfig) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock();
        match self.state() {
            ServiceState::Uninitialized => {}
            ServiceState::Ready => {
                return Err(Error::Initialization(
                    "service is already initialized".to_string(),
                ))
            }
            ServiceState::ShuttingDown => {
                return Err(Error::Initialization(
                    "service is shutting down".to_string(),
                ))
            }
        }

        config
            .validate()
            .map_err(|e| Error::Initialization(e.to_string()))?;

        let template = match &config.chat_template_path {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|e| {
                    Error::Initialization(format!(
                        "failed to read chat template {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                tracing::info!("Using chat template: {}", path.display());
                Some(source)
            }
            None => None,
        };

        tracing::info!("Loading model: {}", config.model_path.display());
        let start = Instant::now();
        let model = self
            .engine
            .load_model(&config.model_path)
            .map_err(|e| Error::Initialization(e.to_string()))?;
        let model = Arc::new(model);

        let pool = WorkerPool::new(
            Arc::clone(&model),
            config.worker_count,
            SessionParams::new(config.context_size, &config.generation),
            PromptFormat::from_template(template),
            Arc::clone(&self.registry),
        )?;

        tracing::info!(
            "Service ready in {:?} ({} workers, context size {})",
            start.elapsed(),
            config.worker_count,
            config.context_size
        );
        *self.state.lock() = Slot::Ready(Runtime {
            pool,
            model,
            config,
        });
        Ok(())
    }

    /// Submit a generation request without blocking
    ///
    /// Returns [`RequestId::REJECTED`] and invokes neither callback when the
    /// service is not ready, the prompt is empty or `max_tokens` is zero.
    pub fn generate_async(
        &self,
        prompt: &str,
        context: &str,
        callbacks: Callbacks,
        max_tokens: usize,
    ) -> RequestId {
        match self.try_generate_async(prompt, context, callbacks, max_tokens) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Rejected generation request: {}", e);
                RequestId::REJECTED
            }
        }
    }

    /// Like [`generate_async`](Self::generate_async), reporting why a
    /// submission was rejected
    pub fn try_generate_async(
        &self,
        prompt: &str,
        context: &str,
        callbacks: Callbacks,
        max_tokens: usize,
    ) -> Result<RequestId, Error> {
        if prompt.is_empty() {
            return Err(Error::InvalidRequest("prompt is empty".to_string()));
        }
        if max_tokens == 0 {
            return Err(Error::InvalidRequest(
                "max_tokens must be positive".to_string(),
            ));
        }

        let state = self.state.lock();
        let Slot::Ready(runtime) = &*state else {
            return Err(Error::InvalidRequest(format!(
                "service is {}",
                match state.state() {
                    ServiceState::ShuttingDown => "shutting down",
                    _ => "not initialized",
                }
            )));
        };

        let id = RequestId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = self.registry.register(id);
        let request = Request::new(
            id,
            prompt.to_string(),
            context.to_string(),
            max_tokens,
            callbacks,
            cancel,
        );
        runtime.pool.submit_request(request);
        Ok(id)
    }

    /// Ask for a request to stop. Unknown or finished ids are ignored.
    pub fn cancel_generation(&self, id: RequestId) {
        if id.is_rejected() {
            return;
        }
        if self.registry.mark(id) {
            tracing::debug!("Cancellation requested for request {}", id);
        }
    }

    /// Blocking generation with the string sentinels of the legacy API
    ///
    /// Returns the generated text, [`SENTINEL_BAD`] when the request is
    /// rejected or fails, or [`SENTINEL_TIMEOUT`] when no result arrives
    /// within `sync_timeout_ms` (the request is cancelled in that case).
    pub fn generate_sync(&self, prompt: &str, max_tokens: usize, context: &str) -> String {
        let timeout = match &*self.state.lock() {
            Slot::Ready(runtime) => Duration::from_millis(runtime.config.sync_timeout_ms),
            _ => return SENTINEL_BAD.to_string(),
        };

        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        let callbacks = Callbacks::new(
            move |text| {
                let _ = tx.send(Ok(text));
            },
            move |e| {
                let _ = err_tx.send(Err(e));
            },
        );
        let id = self.generate_async(prompt, context, callbacks, max_tokens);
        if id.is_rejected() {
            return SENTINEL_BAD.to_string();
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::debug!("Synchronous request {} failed: {}", id, e);
                SENTINEL_BAD.to_string()
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Synchronous request {} timed out after {:?}", id, timeout);
                self.cancel_generation(id);
                SENTINEL_TIMEOUT.to_string()
            }
            Err(RecvTimeoutError::Disconnected) => SENTINEL_BAD.to_string(),
        }
    }

    /// Single-callback submission: `on_done` receives the text, or
    /// [`SENTINEL_BAD`] on rejection or failure. A rejected request gets its
    /// answer immediately on the calling thread.
    pub fn generate_text_async<F>(
        &self,
        prompt: &str,
        context: &str,
        max_tokens: usize,
        on_done: F,
    ) -> RequestId
    where
        F: FnOnce(String) + Send + 'static,
    {
        let slot = OnceSlot::new(on_done);
        let (on_complete, on_error) = (slot.clone(), slot.clone());
        let callbacks = Callbacks::new(
            move |text| on_complete.fire(text),
            move |_| on_error.fire(SENTINEL_BAD.to_string()),
        );
        match self.try_generate_async(prompt, context, callbacks, max_tokens) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Rejected generation request: {}", e);
                slot.fire(SENTINEL_BAD.to_string());
                RequestId::REJECTED
            }
        }
    }

    /// Submit a request and await its text
    ///
    /// Submission happens immediately; dropping the returned future cancels
    /// the request.
    pub fn generate(
        &self,
        prompt: &str,
        context: &str,
        max_tokens: usize,
    ) -> impl Future<Output = Result<String, Error>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let slot = OnceSlot::new(move |outcome: Result<String, Error>| {
            let _ = tx.send(outcome);
        });
        let on_error = slot.clone();
        let callbacks = Callbacks::new(
            move |text| slot.fire(Ok(text)),
            move |e| on_error.fire(Err(e)),
        );
        let submitted = self
            .try_generate_async(prompt, context, callbacks, max_tokens)
            .map(|id| CancelOnDrop::new(Arc::clone(&self.registry), id));

        async move {
            let guard = submitted?;
            let outcome = rx
                .await
                .unwrap_or_else(|_| Err(Error::Engine("request dropped".to_string())));
            guard.disarm();
            outcome
        }
    }

    /// Submit a request and stream its tokens
    ///
    /// The stream ends after the last token, or yields one error and ends.
    /// Dropping it early cancels the request.
    pub fn stream(
        &self,
        prompt: &str,
        context: &str,
        max_tokens: usize,
    ) -> Result<impl Stream<Item = Result<String, Error>> + Send + 'static, Error> {
        let (tx, mut rx) = async_mpsc::unbounded_channel();
        let (done_tx, err_tx) = (tx.clone(), tx.clone());
        let callbacks = Callbacks::new(
            move |_| {
                let _ = done_tx.send(StreamEvent::Done);
            },
            move |e| {
                let _ = err_tx.send(StreamEvent::Failed(e));
            },
        )
        .on_token(move |piece| {
            let _ = tx.send(StreamEvent::Token(piece.to_string()));
        });

        let id = self.try_generate_async(prompt, context, callbacks, max_tokens)?;
        let guard = CancelOnDrop::new(Arc::clone(&self.registry), id);

        Ok(async_stream::stream! {
            let guard = guard;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Token(piece) => yield Ok(piece),
                    StreamEvent::Done => break,
                    StreamEvent::Failed(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
            guard.disarm();
        })
    }

    /// Requests waiting in each worker's queue (empty when not ready)
    pub fn queue_depths(&self) -> Vec<usize> {
        match &*self.state.lock() {
            Slot::Ready(runtime) => runtime.pool.queue_depths(),
            _ => Vec::new(),
        }
    }

    /// Current state of each worker (empty when not ready)
    pub fn worker_states(&self) -> Vec<WorkerState> {
        match &*self.state.lock() {
            Slot::Ready(runtime) => runtime.pool.worker_states(),
            _ => Vec::new(),
        }
    }

    /// Requests accepted but not yet terminal
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Stop every worker and release the model
    ///
    /// Queued requests are cancelled and in-flight ones stop at their next
    /// token boundary; each still gets its terminal callback. Blocks until
    /// all workers are joined, also when another shutdown is already in
    /// progress. A no-op when not initialized. Called from a callback, it
    /// does not wait for the worker running that callback.
    pub fn shutdown(&self) {
        let runtime = {
            let lifecycle = self.lifecycle.lock();
            let mut state = self.state.lock();
            if let Slot::ShuttingDown(workers) = &*state {
                if workers.contains(&thread::current().id()) {
                    return;
                }
                drop(lifecycle);
                while matches!(*state, Slot::ShuttingDown(_)) {
                    self.stopped.wait(&mut state);
                }
                return;
            }
            let Slot::Ready(runtime) = mem::replace(&mut *state, Slot::ShuttingDown(Vec::new()))
            else {
                return;
            };
            *state = Slot::ShuttingDown(runtime.pool.thread_ids());
            runtime
        };

        tracing::info!("Shutting down service");
        let Runtime {
            mut pool, model, ..
        } = runtime;
        pool.shutdown();
        drop(pool);
        drop(model);

        *self.state.lock() = Slot::Uninitialized;
        self.stopped.notify_all();
        tracing::info!("Service stopped");
    }
}

impl<E: Engine> Drop for Service<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum StreamEvent {
    Token(String),
    Done,
    Failed(Error),
}

/// Callable shared by both terminal sinks; only the first fire goes through
struct OnceSlot<T>(Arc<Mutex<Option<Box<dyn FnOnce(T) + Send>>>>);

impl<T> OnceSlot<T> {
    fn new<F: FnOnce(T) + Send + 'static>(f: F) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(f)))))
    }

    fn fire(&self, value: T) {
        let f = self.0.lock().take();
        if let Some(f) = f {
            f(value);
        }
    }
}

impl<T> Clone for OnceSlot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Cancels a request unless disarmed first
struct CancelOnDrop {
    registry: Arc<CancellationRegistry>,
    id: RequestId,
    armed: bool,
}

impl CancelOnDrop {
    fn new(registry: Arc<CancellationRegistry>, id: RequestId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.registry.mark(self.id) {
            tracing::debug!("Request {} cancelled by dropped handle", self.id);
        }
    }
}
