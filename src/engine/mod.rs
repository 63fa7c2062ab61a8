//! Inference engine capability
//!
//! The scheduler never looks inside the engine. It relies on three seams:
//! - [`Engine`]: loads a model file into a shared, read-only [`Model`]
//! - [`Model`]: derives exclusive [`Session`]s and renders chat templates
//! - [`Session`]: per-worker context + sampler, decoding one token at a time
//!
//! Sessions borrow their model and are not required to be `Send`: each one is
//! created, used and dropped on a single worker thread.

#[cfg(feature = "llama")]
pub mod llama;
#[cfg(test)]
pub(crate) mod scripted;

use std::path::Path;

use thiserror::Error;

use crate::config::GenerationConfig;

/// Errors reported by engine implementations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("failed to create context: {0}")]
    Session(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("chat template error: {0}")]
    Template(String),
}

/// Outcome of a single decode step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Decoded text for one token (may be empty while a multi-byte
    /// character is still incomplete)
    Piece(String),
    /// End-of-sequence marker
    EndOfSequence,
}

/// One message handed to a chat template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Parameters for deriving a session from a model
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    /// Context window size in tokens
    pub context_size: u32,
    /// Sampling temperature (0 = greedy)
    pub temperature: f32,
    /// Top-k cutoff (0 = disabled)
    pub top_k: u32,
    /// Top-p nucleus threshold
    pub top_p: f32,
    /// Sampler seed (None = random)
    pub seed: Option<u32>,
}

impl SessionParams {
    pub fn new(context_size: u32, generation: &GenerationConfig) -> Self {
        Self {
            context_size,
            temperature: generation.temperature,
            top_k: generation.top_k,
            top_p: generation.top_p,
            seed: generation.seed,
        }
    }
}

/// Loads models from files
pub trait Engine: Send + Sync + 'static {
    type Model: Model;

    /// Load a model file. Called once per service lifetime.
    fn load_model(&self, path: &Path) -> Result<Self::Model, EngineError>;
}

/// Shared, immutable handle to a loaded model
///
/// Implementations must be safe to read concurrently from every worker
/// thread, and sessions derived from it must be independent of each other.
pub trait Model: Send + Sync + 'static {
    type Session<'m>: Session
    where
        Self: 'm;

    /// Derive an exclusive execution context and sampler
    fn new_session(&self, params: &SessionParams) -> Result<Self::Session<'_>, EngineError>;

    /// Render messages through a chat template source
    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessage],
    ) -> Result<String, EngineError>;
}

/// Exclusive per-worker inference state
pub trait Session {
    /// Reset state and prefill with the formatted input
    fn begin(&mut self, input: &str) -> Result<(), EngineError>;

    /// Sample and decode exactly one token
    fn next_token(&mut self) -> Result<Token, EngineError>;
}
