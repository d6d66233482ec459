use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use ganglion_core::domain::session::{Session, SessionId};

use super::{assemble, ContextRecord, HistoryRecord, SessionStore, StoreError};

/// Same history/context split as the file store, kept in memory. Counts
/// writes so callers can check which kind of save happened.
#[derive(Default)]
pub struct InMemorySessionStore {
    histories: RwLock<HashMap<SessionId, HistoryRecord>>,
    contexts: RwLock<HashMap<SessionId, ContextRecord>>,
    archived: RwLock<Vec<Session>>,
    full_writes: AtomicUsize,
    context_writes: AtomicUsize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_writes(&self) -> usize {
        self.full_writes.load(Ordering::SeqCst)
    }

    pub fn context_writes(&self) -> usize {
        self.context_writes.load(Ordering::SeqCst)
    }

    pub async fn stored_history(&self, id: &SessionId) -> Option<HistoryRecord> {
        self.histories.read().await.get(id).cloned()
    }

    pub async fn archived(&self) -> Vec<Session> {
        self.archived.read().await.clone()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let Some(history) = self.histories.read().await.get(id).cloned() else {
            return Ok(None);
        };
        let context = self
            .contexts
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(|| ContextRecord::empty(id.clone(), history.last_modified));
        Ok(Some(assemble(history, context)))
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        // Lock order histories -> contexts everywhere.
        let mut histories = self.histories.write().await;
        let mut contexts = self.contexts.write().await;
        contexts.insert(session.id.clone(), ContextRecord::from_session(session));
        histories.insert(session.id.clone(), HistoryRecord::from_session(session));
        self.full_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_context_only(&self, session: &Session) -> Result<(), StoreError> {
        let mut contexts = self.contexts.write().await;
        contexts.insert(session.id.clone(), ContextRecord::from_session(session));
        self.context_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let mut histories = self.histories.write().await;
        let mut contexts = self.contexts.write().await;
        let had_history = histories.remove(id).is_some();
        let had_context = contexts.remove(id).is_some();
        Ok(had_history || had_context)
    }

    async fn archive(&self, id: &SessionId) -> Result<bool, StoreError> {
        let mut histories = self.histories.write().await;
        let mut contexts = self.contexts.write().await;
        let Some(history) = histories.remove(id) else {
            contexts.remove(id);
            return Ok(false);
        };
        let context = contexts
            .remove(id)
            .unwrap_or_else(|| ContextRecord::empty(id.clone(), history.last_modified));
        self.archived.write().await.push(assemble(history, context));
        Ok(true)
    }
}
