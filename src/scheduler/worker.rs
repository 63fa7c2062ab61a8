//! Worker threads
//!
//! Each worker owns one engine session, created on and confined to its own
//! thread, plus a private FIFO queue. The loop handles one request at a time
//! from dequeue to terminal callback.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::engine::{EngineError, Model, Session, SessionParams, Token};
use crate::error::Error;

use super::cancel::CancellationRegistry;
use super::prompt::PromptFormat;
use super::request::Request;

/// Where a worker is in its processing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Queue empty, parked on the wake condition
    Idle = 0,
    /// A request was popped from the queue
    Dequeued = 1,
    /// Building model input from prompt and context
    Formatting = 2,
    /// Token loop running
    Generating = 3,
    /// Terminal callback in progress
    Completing = 4,
    /// Thread has exited its loop
    Terminated = 5,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Idle,
            1 => WorkerState::Dequeued,
            2 => WorkerState::Formatting,
            3 => WorkerState::Generating,
            4 => WorkerState::Completing,
            _ => WorkerState::Terminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Dequeued => "dequeued",
            WorkerState::Formatting => "formatting",
            WorkerState::Generating => "generating",
            WorkerState::Completing => "completing",
            WorkerState::Terminated => "terminated",
        }
    }
}

/// State shared between a worker thread and the pool
struct Shared {
    queue: Mutex<VecDeque<Request>>,
    wake: Condvar,
    shutdown: AtomicBool,
    state: AtomicU8,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Everything a worker thread needs besides its model
pub(crate) struct WorkerSetup {
    pub(crate) params: SessionParams,
    pub(crate) format: Arc<PromptFormat>,
    pub(crate) registry: Arc<CancellationRegistry>,
}

/// Pool-side handle to one worker thread
pub(crate) struct WorkerHandle {
    id: usize,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker thread. The receiver reports whether the session
    /// could be created; the thread exits on its own if it could not.
    pub(crate) fn spawn<M: Model>(
        id: usize,
        model: Arc<M>,
        setup: WorkerSetup,
    ) -> Result<(Self, Receiver<Result<(), EngineError>>), Error> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Idle as u8),
        });
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("infer-worker-{id}"))
            .spawn(move || run(id, model, setup, thread_shared, ready_tx))
            .map_err(|e| Error::Initialization(format!("failed to spawn worker {id}: {e}")))?;

        Ok((
            Self {
                id,
                shared,
                thread: Some(thread),
            },
            ready_rx,
        ))
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// `None` once the thread has been joined
    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        self.thread.as_ref().map(|thread| thread.thread().id())
    }

    /// Push onto the private queue and wake the thread. Hands the request
    /// back if the worker is already shutting down.
    pub(crate) fn enqueue(&self, request: Request) -> Result<(), Request> {
        let mut queue = self.shared.queue.lock();
        if self.shared.stopping() {
            return Err(request);
        }
        queue.push_back(request);
        self.shared.wake.notify_one();
        Ok(())
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Ask the thread to stop after its current request
    pub(crate) fn signal_shutdown(&self) {
        let _queue = self.shared.queue.lock();
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }

    /// Wait for the thread to exit
    pub(crate) fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            // Shutdown requested from one of this worker's own callbacks; the
            // loop exits by itself once the callback returns.
            tracing::warn!("Worker {} shut down from its own thread; not joining", self.id);
            return;
        }
        if thread.join().is_err() {
            tracing::error!("Worker {} thread panicked", self.id);
        }
    }
}

fn run<M: Model>(
    id: usize,
    model: Arc<M>,
    setup: WorkerSetup,
    shared: Arc<Shared>,
    ready: SyncSender<Result<(), EngineError>>,
) {
    let span = tracing::info_span!("worker", id);
    let _enter = span.enter();

    let session = match model.new_session(&setup.params) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Worker {} failed to create its session: {}", id, e);
            shared
                .state
                .store(WorkerState::Terminated as u8, Ordering::Release);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    drop(ready);
    tracing::debug!("Worker {} ready", id);

    let mut worker = Worker {
        id,
        model: model.as_ref(),
        session,
        format: setup.format,
        registry: setup.registry,
        shared,
    };
    worker.run_loop();
}

struct Worker<'m, M: Model> {
    id: usize,
    model: &'m M,
    session: M::Session<'m>,
    format: Arc<PromptFormat>,
    registry: Arc<CancellationRegistry>,
    shared: Arc<Shared>,
}

impl<'m, M: Model> Worker<'m, M> {
    fn run_loop(&mut self) {
        while let Some(mut request) = self.next_request() {
            let id = request.id();
            // Resolved outside the unwind boundary
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.serve(&mut request)))
                .unwrap_or_else(|_| {
                    tracing::error!("Worker {} panicked while serving request {}", self.id, id);
                    Err(Error::Engine("worker panicked during generation".to_string()))
                });
            if panic::catch_unwind(AssertUnwindSafe(|| self.complete(request, outcome))).is_err() {
                tracing::error!("Terminal callback of request {} panicked", id);
            }
            self.registry.clear(id);
            self.set_state(WorkerState::Idle);
        }

        self.drain();
        self.set_state(WorkerState::Terminated);
        tracing::debug!("Worker {} terminated", self.id);
    }

    /// Block until a request arrives or shutdown is signalled
    fn next_request(&self) -> Option<Request> {
        let mut queue = self.shared.queue.lock();
        loop {
            if self.shared.stopping() {
                return None;
            }
            if let Some(request) = queue.pop_front() {
                self.set_state(WorkerState::Dequeued);
                return Some(request);
            }
            self.shared.wake.wait(&mut queue);
        }
    }

    fn serve(&mut self, request: &mut Request) -> Result<String, Error> {
        // Cancelled while queued: no engine work at all
        if self.should_stop(request) {
            return Err(Error::Cancelled);
        }

        self.set_state(WorkerState::Formatting);
        let input = self
            .format
            .format(self.model, &request.prompt, &request.context)?;

        self.set_state(WorkerState::Generating);
        self.generate(request, &input)
    }

    fn generate(&mut self, request: &mut Request, input: &str) -> Result<String, Error> {
        self.session.begin(input)?;

        let mut text = String::new();
        let mut produced = 0usize;
        while produced < request.max_tokens {
            if self.should_stop(request) {
                tracing::debug!(
                    "Request {} stopped after {} tokens",
                    request.id(),
                    produced
                );
                return Err(Error::Cancelled);
            }
            match self.session.next_token()? {
                Token::EndOfSequence => break,
                // Cancelled while decoding: the piece is discarded
                Token::Piece(_) if self.should_stop(request) => return Err(Error::Cancelled),
                Token::Piece(piece) => {
                    produced += 1;
                    text.push_str(&piece);
                    if !piece.is_empty() {
                        request.emit_token(&piece);
                    }
                }
            }
        }
        Ok(text)
    }

    fn complete(&self, request: Request, outcome: Result<String, Error>) {
        self.set_state(WorkerState::Completing);
        match &outcome {
            Ok(text) => tracing::debug!("Request {} complete ({} bytes)", request.id(), text.len()),
            Err(e) => tracing::debug!("Request {} failed: {}", request.id(), e),
        }
        request.finish(outcome);
    }

    /// Cancel everything still queued once shutdown is signalled
    fn drain(&self) {
        let pending: Vec<Request> = self.shared.queue.lock().drain(..).collect();
        if !pending.is_empty() {
            tracing::debug!("Worker {} cancelling {} queued requests", self.id, pending.len());
        }
        for request in pending {
            let id = request.id();
            request.finish(Err(Error::Cancelled));
            self.registry.clear(id);
        }
    }

    fn should_stop(&self, request: &Request) -> bool {
        request.is_cancelled() || self.shared.stopping()
    }

    fn set_state(&self, state: WorkerState) {
        self.shared.state.store(state as u8, Ordering::Release);
        tracing::trace!("Worker {} -> {}", self.id, state.as_str());
    }
}
