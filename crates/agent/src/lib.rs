//! Agent execution runtime.
//!
//! The engine wraps a reasoning service in a deterministic loop:
//! 1. **Think** - send the session history to the reasoning service
//! 2. **Detect** (`detector`) - find which capabilities the reply means to run
//! 3. **Negotiate** (`negotiation`) - settle typed arguments with a cheaper service
//! 4. **Act** (`tools`) - invoke the capability, possibly nesting a fresh execution
//! 5. **Feed back** - append results as one turn and think again
//!
//! Outages suspend the affected session on the availability monitor
//! (`availability`) instead of failing it.

pub mod availability;
pub mod builtin;
pub mod detector;
pub mod http;
pub mod llm;
pub mod mailbox;
pub mod negotiation;
pub mod prompts;
pub mod retry;
pub mod runtime;
pub mod testing;
pub mod tools;

pub use availability::{MonitorError, MonitorSettings, ServiceAvailabilityMonitor};
pub use llm::{Completion, LlmClient, LlmError, ServiceId};
pub use mailbox::{InboundMessage, MailboxDispatcher, OutboundMessage};
pub use runtime::{EngineError, EngineSettings, ExecutionEngine, ExecutionRequest};
pub use tools::{Capability, CapabilityRegistry, CapabilitySpec, InvocationContext};
