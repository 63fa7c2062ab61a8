//! Request definitions and the terminal-callback contract

use std::fmt;

use crate::error::Error;

use super::cancel::CancelFlag;

/// Identifier issued for every accepted request
///
/// Ids start at 1 and only grow. The raw value 0 is reserved for
/// [`RequestId::REJECTED`] and is never assigned to a real request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Returned when a submission is refused
    pub const REJECTED: RequestId = RequestId(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_rejected(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-token sink, invoked on the worker thread
pub type TokenSink = Box<dyn FnMut(&str) + Send + 'static>;
/// Success sink, receives the accumulated text
pub type CompleteSink = Box<dyn FnOnce(String) + Send + 'static>;
/// Failure sink
pub type ErrorSink = Box<dyn FnOnce(Error) + Send + 'static>;

/// Caller-supplied sinks for one request
///
/// Exactly one of `on_complete` / `on_error` fires per accepted request. All
/// of them run on a worker thread; shared state they touch must be
/// synchronized by the caller.
pub struct Callbacks {
    pub(crate) on_token: Option<TokenSink>,
    pub(crate) on_complete: CompleteSink,
    pub(crate) on_error: ErrorSink,
}

impl Callbacks {
    pub fn new<C, E>(on_complete: C, on_error: E) -> Self
    where
        C: FnOnce(String) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        Self {
            on_token: None,
            on_complete: Box::new(on_complete),
            on_error: Box::new(on_error),
        }
    }

    /// Also receive every decoded piece as it is produced
    pub fn on_token<T>(mut self, on_token: T) -> Self
    where
        T: FnMut(&str) + Send + 'static,
    {
        self.on_token = Some(Box::new(on_token));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_token", &self.on_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Terminal half of a request. Resolving consumes it; dropping it unresolved
/// reports an engine failure so no accepted request ever goes silent.
struct Completion {
    id: RequestId,
    sinks: Option<(CompleteSink, ErrorSink)>,
}

impl Completion {
    fn resolve(mut self, outcome: Result<String, Error>) {
        if let Some((on_complete, on_error)) = self.sinks.take() {
            match outcome {
                Ok(text) => on_complete(text),
                Err(err) => on_error(err),
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some((_, on_error)) = self.sinks.take() {
            tracing::error!("Request {} abandoned without a terminal callback", self.id);
            on_error(Error::Engine("request abandoned by worker".to_string()));
        }
    }
}

/// A generation request owned by exactly one worker at a time
pub(crate) struct Request {
    id: RequestId,
    pub(crate) prompt: String,
    pub(crate) context: String,
    pub(crate) max_tokens: usize,
    on_token: Option<TokenSink>,
    cancel: CancelFlag,
    completion: Completion,
}

impl Request {
    pub(crate) fn new(
        id: RequestId,
        prompt: String,
        context: String,
        max_tokens: usize,
        callbacks: Callbacks,
        cancel: CancelFlag,
    ) -> Self {
        let Callbacks {
            on_token,
            on_complete,
            on_error,
        } = callbacks;
        Self {
            id,
            prompt,
            context,
            max_tokens,
            on_token,
            cancel,
            completion: Completion {
                id,
                sinks: Some((on_complete, on_error)),
            },
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_set()
    }

    pub(crate) fn emit_token(&mut self, piece: &str) {
        if let Some(on_token) = self.on_token.as_mut() {
            on_token(piece);
        }
    }

    /// Fire the terminal callback
    pub(crate) fn finish(self, outcome: Result<String, Error>) {
        self.completion.resolve(outcome);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("prompt_len", &self.prompt.len())
            .field("context_len", &self.context.len())
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}
