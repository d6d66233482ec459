use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::conversation::{Conversation, Turn};
use crate::errors::DomainError;

/// Agent-local scratch state. Kept apart from the history so it can be
/// rewritten on its own.
pub type ContextMap = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Session ids double as directory names, so they are restricted to
    /// `[A-Za-z0-9._-]` and may not start with a dot.
    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        let valid_chars = raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
        if raw.is_empty() || raw.starts_with('.') || !valid_chars {
            return Err(DomainError::InvalidSessionId(raw));
        }
        Ok(Self(raw))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Negotiating,
    Waiting,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Negotiating => "negotiating",
            Self::Waiting => "waiting",
            Self::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Negotiating)
                | (SessionStatus::Negotiating, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Waiting)
                | (SessionStatus::Negotiating, SessionStatus::Waiting)
                | (SessionStatus::Waiting, SessionStatus::Active)
                | (SessionStatus::Waiting, SessionStatus::Negotiating)
                | (SessionStatus::Active, SessionStatus::Terminated)
                | (SessionStatus::Negotiating, SessionStatus::Terminated)
                | (SessionStatus::Terminated, SessionStatus::Active)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub history: Conversation,
    pub context: ContextMap,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: SessionStatus::Active,
            history: Conversation::new(),
            context: ContextMap::new(),
            created_at: now,
            last_modified: now,
        }
    }

    /// Fresh session whose history opens with the persona and the task.
    pub fn start(id: SessionId, persona: impl Into<String>, task: impl Into<String>) -> Self {
        let mut session = Self::new(id);
        session.history.push(Turn::system(persona));
        session.history.push(Turn::user(task));
        session
    }

    pub fn append(&mut self, turn: Turn) {
        self.history.push(turn);
        self.touch();
    }

    pub fn transition_to(&mut self, next: SessionStatus) -> Result<(), DomainError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidSessionTransition { from: self.status, to: next });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionId, SessionStatus};
    use crate::domain::conversation::Role;
    use crate::errors::DomainError;

    #[test]
    fn session_id_rejects_path_like_values() {
        assert!(SessionId::parse("thread-42.a_b").is_ok());
        for raw in ["", "../escape", ".hidden", "a/b", "with space"] {
            assert!(
                matches!(SessionId::parse(raw), Err(DomainError::InvalidSessionId(_))),
                "`{raw}` should be rejected"
            );
        }
    }

    #[test]
    fn start_opens_with_persona_then_task() {
        let session = Session::start(SessionId::generate(), "you are a clerk", "file the report");
        let turns = session.history.turns();

        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[0].content, "you are a clerk");
        assert_eq!(turns[1].role, Role::User);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn waiting_resumes_into_the_interrupted_phase() {
        let mut session = Session::new(SessionId::generate());
        session.transition_to(SessionStatus::Negotiating).expect("active -> negotiating");
        session.transition_to(SessionStatus::Waiting).expect("negotiating -> waiting");
        session.transition_to(SessionStatus::Negotiating).expect("waiting -> negotiating");
        session.transition_to(SessionStatus::Terminated).expect("negotiating -> terminated");
    }

    #[test]
    fn terminated_session_cannot_wait() {
        let mut session = Session::new(SessionId::generate());
        session.transition_to(SessionStatus::Terminated).expect("active -> terminated");

        let error = session.transition_to(SessionStatus::Waiting).expect_err("illegal transition");
        assert_eq!(
            error,
            DomainError::InvalidSessionTransition {
                from: SessionStatus::Terminated,
                to: SessionStatus::Waiting,
            }
        );
    }
}
