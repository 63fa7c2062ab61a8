//! infer-pool - Concurrent LLM inference scheduler
//!
//! infer-pool runs text generation over a fixed pool of worker threads that
//! share one loaded model. Each worker owns its own inference session, so
//! requests on different workers decode in parallel while the model weights
//! are held once.
//!
//! # Architecture
//!
//! - **engine**: traits the inference backend implements (model loading,
//!   per-worker sessions, token decoding) plus the llama.cpp backend
//! - **scheduler**: requests, cancellation, prompt formatting, workers and
//!   round-robin dispatch
//! - **service**: the public facade tying it together
//!
//! # Example
//!
//! ```ignore
//! use infer_pool::{Callbacks, Service, ServiceConfig};
//! use infer_pool::engine::llama::LlamaEngine;
//!
//! let service = Service::new(LlamaEngine::init()?);
//! service.initialize(ServiceConfig::new("models/qwen2-0.5b.gguf"))?;
//!
//! let id = service.generate_async(
//!     "Summarize the diff",
//!     "",
//!     Callbacks::new(|text| println!("{text}"), |err| eprintln!("{err}"))
//!         .on_token(|piece| print!("{piece}")),
//!     64,
//! );
//! ```

#[cfg(feature = "llama")]
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
#[cfg(feature = "llama")]
pub mod ffi;
pub mod scheduler;
pub mod service;

// Re-export key types
pub use config::{GenerationConfig, ServiceConfig};
pub use engine::{Engine, EngineError, Model, Session, SessionParams, Token};
pub use error::{Error, Result};
pub use scheduler::{Callbacks, RequestId, WorkerState};
pub use service::{Service, ServiceState, SENTINEL_BAD, SENTINEL_TIMEOUT};
