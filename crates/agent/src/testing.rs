//! Scripted completion backend for tests and local dry runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use ganglion_core::domain::conversation::Turn;

use crate::llm::{Completion, LlmClient, LlmError};

pub type Responder = Box<dyn Fn(&[Turn]) -> Result<String, LlmError> + Send + Sync>;

/// Replays queued replies in order, then falls back to a responder if one
/// was given. Every conversation it receives is recorded.
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<Vec<Turn>>>,
    probe_failures: AtomicUsize,
    probes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scripted = Self::new();
        for reply in replies {
            scripted.push_reply(reply);
        }
        scripted
    }

    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&[Turn]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self { responder: Some(Box::new(responder)), ..Self::default() }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.script).push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        lock(&self.script).push_back(Err(error));
    }

    pub fn push_unavailable(&self) {
        self.push_error(LlmError::Unavailable("scripted outage".to_string()));
    }

    /// The next `count` probes report the service as unavailable.
    pub fn fail_probes(&self, count: usize) {
        self.probe_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Vec<Turn>> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, turns: &[Turn]) -> Result<Completion, LlmError> {
        lock(&self.calls).push(turns.to_vec());
        let next = lock(&self.script).pop_front();
        let reply = match (next, &self.responder) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(turns),
            (None, None) => Err(LlmError::InvalidResponse("script exhausted".to_string())),
        };
        reply.map(Completion::new)
    }

    async fn probe(&self) -> Result<(), LlmError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .probe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            Err(LlmError::Unavailable("scripted probe failure".to_string()))
        } else {
            Ok(())
        }
    }
}
