use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::session::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Steps,
    WallTime,
}

impl BudgetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Steps => "steps",
            Self::WallTime => "wall_time",
        }
    }
}

/// Per-invocation limits. Checked cooperatively at the top of each iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Budgets {
    pub max_steps: u32,
    pub max_wall_time: Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        Self { max_steps: 25, max_wall_time: Duration::from_secs(600) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExecutionValue {
    /// Value carried by the terminal capability that ended the loop.
    Returned(serde_json::Value),
    /// The loop ran out of budget before a terminal capability was reached.
    BudgetExceeded(BudgetKind),
}

impl ExecutionValue {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, Self::BudgetExceeded(_))
    }

    pub fn returned(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Returned(value) => Some(value),
            Self::BudgetExceeded(_) => None,
        }
    }

    /// Text rendering used when the value crosses back into a caller's
    /// conversation or leaves through the mailbox.
    pub fn render(&self) -> String {
        match self {
            Self::Returned(serde_json::Value::String(text)) => text.clone(),
            Self::Returned(value) => value.to_string(),
            Self::BudgetExceeded(kind) => {
                format!("stopped before finishing: {} budget exhausted", kind.as_str())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub session_id: SessionId,
    pub value: ExecutionValue,
    pub last_capability: Option<String>,
    pub step_count: u32,
    pub elapsed: Duration,
}
