//! Request scheduling
//!
//! - `request`: request ids, callbacks and the terminal-callback guard
//! - `cancel`: cancellation registry
//! - `prompt`: input formatting policy
//! - `worker`: per-thread processing loop
//! - `pool`: round-robin dispatch and shutdown

mod cancel;
mod pool;
mod prompt;
mod request;
mod worker;

pub use cancel::{CancelFlag, CancellationRegistry};
pub use prompt::{PromptFormat, DEFAULT_CONTEXT_SEPARATOR};
pub use request::{Callbacks, CompleteSink, ErrorSink, RequestId, TokenSink};
pub use worker::WorkerState;

pub(crate) use pool::WorkerPool;
pub(crate) use request::Request;
