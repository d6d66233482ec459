use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ganglion_core::domain::conversation::Conversation;
use ganglion_core::domain::session::{ContextMap, Session, SessionId, SessionStatus};
use ganglion_core::errors::{ApplicationError, DomainError};

pub mod file;
pub mod memory;

pub use file::FileSessionStore;
pub use memory::InMemorySessionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at `{path}`: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("corrupt session record `{path}`: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("could not serialize session record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(error) => ApplicationError::Domain(error),
            other => ApplicationError::Persistence(other.to_string()),
        }
    }
}

/// Persistence for sessions. History and context are separate artifacts:
/// `save_context_only` must leave the stored history untouched.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` means no session was ever saved under this id.
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;
    async fn save(&self, session: &Session) -> Result<(), StoreError>;
    async fn save_context_only(&self, session: &Session) -> Result<(), StoreError>;
    /// Returns whether anything was removed.
    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError>;
    /// Moves the session out of the live set. Returns whether anything was archived.
    async fn archive(&self, id: &SessionId) -> Result<bool, StoreError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub turns: Conversation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub session_id: SessionId,
    pub updated_at: DateTime<Utc>,
    pub values: ContextMap,
}

impl HistoryRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            created_at: session.created_at,
            last_modified: session.last_modified,
            turns: session.history.clone(),
        }
    }
}

impl ContextRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            updated_at: Utc::now(),
            values: session.context.clone(),
        }
    }

    pub fn empty(session_id: SessionId, at: DateTime<Utc>) -> Self {
        Self { session_id, updated_at: at, values: ContextMap::new() }
    }
}

pub(crate) fn assemble(history: HistoryRecord, context: ContextRecord) -> Session {
    Session {
        id: history.session_id,
        status: history.status,
        history: history.turns,
        context: context.values,
        created_at: history.created_at,
        last_modified: history.last_modified.max(context.updated_at),
    }
}
