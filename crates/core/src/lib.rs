pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::conversation::{Conversation, Role, Turn};
pub use domain::execution::{BudgetKind, Budgets, ExecutionResult, ExecutionValue};
pub use domain::session::{ContextMap, Session, SessionId, SessionStatus};
pub use errors::{ApplicationError, DomainError, InterfaceError};
