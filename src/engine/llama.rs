//! llama.cpp backend
//!
//! One `LlamaBackend` per process, shared by every engine. The model is
//! loaded once and shared; each worker session owns its own `LlamaContext`,
//! sampler chain and batch.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use parking_lot::Mutex;

use super::{ChatMessage, Engine, EngineError, Model, Session, SessionParams, Token};

/// llama.cpp refuses to initialize its backend twice
static BACKEND: Mutex<Option<Arc<LlamaBackend>>> = Mutex::new(None);

/// Temperatures below this use greedy sampling
const GREEDY_TEMPERATURE: f32 = 0.01;

/// Engine loading GGUF models through llama.cpp
#[derive(Clone)]
pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
    gpu_layers: u32,
}

impl LlamaEngine {
    /// Initialize (or reuse) the process-wide llama.cpp backend
    pub fn init() -> Result<Self, EngineError> {
        let mut slot = BACKEND.lock();
        let backend = match slot.as_ref() {
            Some(backend) => Arc::clone(backend),
            None => {
                let backend = Arc::new(
                    LlamaBackend::init().map_err(|e| EngineError::Load(e.to_string()))?,
                );
                tracing::info!("llama.cpp backend initialized");
                *slot = Some(Arc::clone(&backend));
                backend
            }
        };
        Ok(Self {
            backend,
            gpu_layers: 0,
        })
    }

    /// Offload this many layers to the GPU (0 = CPU only)
    pub fn with_gpu_layers(mut self, gpu_layers: u32) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }
}

impl Engine for LlamaEngine {
    type Model = LlamaModelHandle;

    fn load_model(&self, path: &Path) -> Result<LlamaModelHandle, EngineError> {
        let params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &params)
            .map_err(|e| EngineError::Load(format!("{}: {}", path.display(), e)))?;
        tracing::info!(
            "Loaded {} (trained context {}, vocab {})",
            path.display(),
            model.n_ctx_train(),
            model.n_vocab()
        );
        Ok(LlamaModelHandle {
            backend: Arc::clone(&self.backend),
            model,
        })
    }
}

/// Loaded llama.cpp model, shared read-only by all workers
pub struct LlamaModelHandle {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
}

impl Model for LlamaModelHandle {
    type Session<'m> = LlamaSession<'m>;

    fn new_session(&self, params: &SessionParams) -> Result<LlamaSession<'_>, EngineError> {
        let n_ctx = NonZeroU32::new(params.context_size)
            .ok_or_else(|| EngineError::Session("context size must be positive".to_string()))?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_ctx.get());
        let ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::Session(e.to_string()))?;

        let batch_size = n_ctx.get() as usize;
        Ok(LlamaSession {
            model: &self.model,
            ctx,
            sampler: build_sampler(params),
            batch: LlamaBatch::new(batch_size, 1),
            batch_size,
            n_ctx: n_ctx.get() as i32,
            n_past: 0,
            pending: Vec::new(),
        })
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessage],
    ) -> Result<String, EngineError> {
        let template =
            LlamaChatTemplate::new(template).map_err(|e| EngineError::Template(e.to_string()))?;
        let messages = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Template(e.to_string()))?;
        self.model
            .apply_chat_template(&template, &messages, true)
            .map_err(|e| EngineError::Template(e.to_string()))
    }
}

fn build_sampler(params: &SessionParams) -> LlamaSampler {
    if params.temperature < GREEDY_TEMPERATURE {
        return LlamaSampler::greedy();
    }
    let seed = params.seed.unwrap_or_else(rand_seed);
    LlamaSampler::chain_simple([
        LlamaSampler::top_k(params.top_k as i32),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(seed),
    ])
}

fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

/// Per-worker llama.cpp context. Never leaves the thread that created it.
pub struct LlamaSession<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    sampler: LlamaSampler,
    batch: LlamaBatch,
    batch_size: usize,
    n_ctx: i32,
    n_past: i32,
    /// Bytes of a multi-byte character split across tokens
    pending: Vec<u8>,
}

impl Session for LlamaSession<'_> {
    fn begin(&mut self, input: &str) -> Result<(), EngineError> {
        self.ctx.clear_kv_cache();
        self.sampler.reset();
        self.pending.clear();
        self.n_past = 0;

        let tokens = self
            .model
            .str_to_token(input, AddBos::Always)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        if tokens.is_empty() {
            return Err(EngineError::Tokenize("input produced no tokens".to_string()));
        }
        if tokens.len() >= self.n_ctx as usize {
            return Err(EngineError::Tokenize(format!(
                "input of {} tokens does not fit context size {}",
                tokens.len(),
                self.n_ctx
            )));
        }

        let last = tokens.len() - 1;
        for (chunk_index, chunk) in tokens.chunks(self.batch_size).enumerate() {
            self.batch.clear();
            let offset = chunk_index * self.batch_size;
            for (i, token) in chunk.iter().enumerate() {
                self.batch
                    .add(*token, (offset + i) as i32, &[0], offset + i == last)
                    .map_err(|e| EngineError::Decode(e.to_string()))?;
            }
            self.ctx
                .decode(&mut self.batch)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
        }
        self.n_past = tokens.len() as i32;
        tracing::trace!("Prefilled {} tokens", tokens.len());
        Ok(())
    }

    fn next_token(&mut self) -> Result<Token, EngineError> {
        if self.n_past >= self.n_ctx {
            tracing::debug!("Context window of {} tokens exhausted", self.n_ctx);
            return Ok(Token::EndOfSequence);
        }

        let token = self.sampler.sample(&self.ctx, self.batch.n_tokens() - 1);
        self.sampler.accept(token);
        if self.model.is_eog_token(token) {
            return Ok(Token::EndOfSequence);
        }

        let bytes = self
            .model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        self.pending.extend_from_slice(&bytes);
        let piece = take_utf8(&mut self.pending);

        self.batch.clear();
        self.batch
            .add(token, self.n_past, &[0], true)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        self.n_past += 1;

        Ok(Token::Piece(piece))
    }
}

/// Take the longest complete UTF-8 prefix, leaving an unfinished trailing
/// character in `pending`. Invalid sequences are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_utf8_complete() {
        let mut pending = "héllo".as_bytes().to_vec();
        assert_eq!(take_utf8(&mut pending), "héllo");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_take_utf8_keeps_partial_char() {
        let bytes = "你好".as_bytes();
        let mut pending = bytes[..4].to_vec();
        assert_eq!(take_utf8(&mut pending), "你");
        assert_eq!(pending, &bytes[3..4]);

        pending.extend_from_slice(&bytes[4..]);
        assert_eq!(take_utf8(&mut pending), "好");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_take_utf8_replaces_invalid() {
        let mut pending = vec![b'a', 0xff, b'b'];
        assert_eq!(take_utf8(&mut pending), "a\u{fffd}b");
        assert!(pending.is_empty());
    }
}
