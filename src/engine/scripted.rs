//! Deterministic in-process engine for tests
//!
//! Emits `<0>`, `<1>`, ... until `eos_after` tokens have been produced, then
//! end-of-sequence. Inputs containing `!fail` make decoding fail, `!panic`
//! makes it panic. A [`Gate`] can hold every session at a token boundary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::{ChatMessage, Engine, EngineError, Model, Session, SessionParams, Token};

/// Permit counter that blocks decode steps until released
#[derive(Debug, Default)]
pub(crate) struct Gate {
    permits: Mutex<Option<usize>>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn closed() -> Arc<Self> {
        Arc::new(Self {
            permits: Mutex::new(Some(0)),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn release(&self, n: usize) {
        let mut permits = self.permits.lock();
        if let Some(count) = permits.as_mut() {
            *count += n;
        }
        self.cv.notify_all();
    }

    pub(crate) fn open(&self) {
        *self.permits.lock() = None;
        self.cv.notify_all();
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock();
        loop {
            match permits.as_mut() {
                None => return,
                Some(count) if *count > 0 => {
                    *count -= 1;
                    return;
                }
                Some(_) => self.cv.wait(&mut permits),
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    decodes: Mutex<HashMap<String, usize>>,
    sessions_created: AtomicUsize,
    sessions_dropped: AtomicUsize,
    foreign_thread_uses: AtomicUsize,
    last_params: Mutex<Option<SessionParams>>,
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptedModel {
    eos_after: usize,
    session_limit: Option<usize>,
    gate: Option<Arc<Gate>>,
    counters: Arc<Counters>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            eos_after: 3,
            session_limit: None,
            gate: None,
            counters: Arc::default(),
        }
    }
}

impl ScriptedModel {
    pub(crate) fn with_eos_after(mut self, eos_after: usize) -> Self {
        self.eos_after = eos_after;
        self
    }

    /// Fail session creation once `limit` sessions exist
    pub(crate) fn with_session_limit(mut self, limit: usize) -> Self {
        self.session_limit = Some(limit);
        self
    }

    pub(crate) fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Decode steps performed for inputs containing `needle`
    pub(crate) fn decodes_for(&self, needle: &str) -> usize {
        self.counters
            .decodes
            .lock()
            .iter()
            .filter(|(input, _)| input.contains(needle))
            .map(|(_, n)| *n)
            .sum()
    }

    pub(crate) fn total_decodes(&self) -> usize {
        self.counters.decodes.lock().values().sum()
    }

    pub(crate) fn sessions_created(&self) -> usize {
        self.counters.sessions_created.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_dropped(&self) -> usize {
        self.counters.sessions_dropped.load(Ordering::SeqCst)
    }

    pub(crate) fn foreign_thread_uses(&self) -> usize {
        self.counters.foreign_thread_uses.load(Ordering::SeqCst)
    }

    pub(crate) fn last_params(&self) -> Option<SessionParams> {
        self.counters.last_params.lock().clone()
    }
}

impl Model for ScriptedModel {
    type Session<'m> = ScriptedSession<'m>;

    fn new_session(&self, params: &SessionParams) -> Result<ScriptedSession<'_>, EngineError> {
        let created = self.counters.sessions_created.fetch_add(1, Ordering::SeqCst);
        if self.session_limit.is_some_and(|limit| created >= limit) {
            self.counters.sessions_created.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Session("out of memory".to_string()));
        }
        *self.counters.last_params.lock() = Some(params.clone());
        Ok(ScriptedSession {
            model: self,
            owner: thread::current().id(),
            input: String::new(),
            produced: 0,
        })
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessage],
    ) -> Result<String, EngineError> {
        if template.contains("{%") && !template.contains("%}") {
            return Err(EngineError::Template("unclosed block tag".to_string()));
        }
        let mut out = format!("[{template}]");
        for message in messages {
            out.push_str(&format!("<{0}>{1}</{0}>", message.role, message.content));
        }
        Ok(out)
    }
}

pub(crate) struct ScriptedSession<'m> {
    model: &'m ScriptedModel,
    owner: ThreadId,
    input: String,
    produced: usize,
}

impl ScriptedSession<'_> {
    fn check_thread(&self) {
        if thread::current().id() != self.owner {
            self.model
                .counters
                .foreign_thread_uses
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Session for ScriptedSession<'_> {
    fn begin(&mut self, input: &str) -> Result<(), EngineError> {
        self.check_thread();
        self.input = input.to_string();
        self.produced = 0;
        Ok(())
    }

    fn next_token(&mut self) -> Result<Token, EngineError> {
        self.check_thread();
        if let Some(gate) = &self.model.gate {
            gate.acquire();
        }
        *self
            .model
            .counters
            .decodes
            .lock()
            .entry(self.input.clone())
            .or_default() += 1;

        if self.input.contains("!panic") {
            panic!("scripted engine panic");
        }
        if self.input.contains("!fail") {
            return Err(EngineError::Decode("scripted failure".to_string()));
        }
        if self.produced >= self.model.eos_after {
            return Ok(Token::EndOfSequence);
        }
        let piece = format!("<{}>", self.produced);
        self.produced += 1;
        Ok(Token::Piece(piece))
    }
}

impl Drop for ScriptedSession<'_> {
    fn drop(&mut self) {
        self.check_thread();
        self.model
            .counters
            .sessions_dropped
            .fetch_add(1, Ordering::SeqCst);
    }
}

/// Engine handing out clones of one scripted model
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedEngine {
    model: ScriptedModel,
}

impl ScriptedEngine {
    pub(crate) fn new(model: ScriptedModel) -> Self {
        Self { model }
    }

    /// The model every successful load returns (shares counters)
    pub(crate) fn model(&self) -> &ScriptedModel {
        &self.model
    }
}

impl Engine for ScriptedEngine {
    type Model = ScriptedModel;

    fn load_model(&self, path: &Path) -> Result<ScriptedModel, EngineError> {
        if path.to_string_lossy().contains("missing") {
            return Err(EngineError::Load(format!(
                "no such file: {}",
                path.display()
            )));
        }
        Ok(self.model.clone())
    }
}
