use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ganglion_core::domain::conversation::Turn;

/// The two completion backends the engine talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    Reasoning,
    Negotiation,
}

impl ServiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Negotiation => "negotiation",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
}

impl Completion {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    /// Backend unreachable or overloaded. The only error that suspends an
    /// execution instead of failing it.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, turns: &[Turn]) -> Result<Completion, LlmError>;

    /// Cheap reachability check used by the availability monitor.
    async fn probe(&self) -> Result<(), LlmError> {
        self.complete(&[Turn::user("ping")]).await.map(|_| ())
    }
}
