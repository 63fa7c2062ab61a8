//! Error taxonomy for the scheduler
//!
//! Synchronous entry points return these directly. Asynchronous requests
//! receive them through their `on_error` sink, so the `Display` output of the
//! request-level variants is part of the public contract.

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced by the service and its workers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Model could not be loaded, a worker could not start, or the service
    /// was not in a state that allows initialization
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Request rejected at submission (service not ready, empty prompt, ...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Decode or sampling failure inside the inference engine
    #[error("engine failure: {0}")]
    Engine(String),

    /// Request was cancelled before or during generation
    #[error("cancelled")]
    Cancelled,

    /// Configured chat template could not be applied
    #[error("template failure: {0}")]
    Template(String),
}

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this error is the cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        Error::Engine(err.to_string())
    }
}
