use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ganglion_core::domain::execution::ExecutionValue;
use ganglion_core::domain::session::SessionId;
use ganglion_core::errors::ApplicationError;

use crate::runtime::{ExecutionEngine, ExecutionRequest};

/// One unit of inbound work. `thread_id` doubles as the session id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub thread_id: String,
    #[serde(default)]
    pub body: String,
    /// Ends the conversation: the session is archived and nothing runs.
    #[serde(default)]
    pub close: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub thread_id: String,
    pub body: String,
}

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

struct Shared {
    engine: Arc<ExecutionEngine>,
    persona: String,
    capabilities: Option<Vec<String>>,
    idle_timeout: Duration,
    outbound: mpsc::Sender<OutboundMessage>,
}

type Workers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>>;

/// Runs one engine invocation per inbound message. Messages of one thread
/// are handled in arrival order by that thread's worker; threads run
/// independently of each other. A worker retires after its thread is closed
/// or has been idle for the idle timeout; the next message starts a new one.
pub struct MailboxDispatcher {
    shared: Arc<Shared>,
    workers: Workers,
}

impl MailboxDispatcher {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        persona: impl Into<String>,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                persona: persona.into(),
                capabilities: None,
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
                outbound,
            }),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Dispatcher plus the receiving end of its outbound channel.
    pub fn channel(
        engine: Arc<ExecutionEngine>,
        persona: impl Into<String>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (outbound, replies) = mpsc::channel(buffer.max(1));
        (Self::new(engine, persona, outbound), replies)
    }

    /// Restricts every invocation to the named capabilities.
    pub fn with_capabilities(mut self, names: Vec<String>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.capabilities = Some(names);
        }
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.idle_timeout = idle;
        }
        self
    }

    pub fn dispatch(&self, message: InboundMessage) {
        let mut workers = lock(&self.workers);
        let message = match workers.get(&message.thread_id) {
            Some(queue) => match queue.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let thread_id = message.thread_id.clone();
        let (queue, inbox) = mpsc::unbounded_channel();
        if queue.send(message).is_ok() {
            workers.insert(thread_id.clone(), queue);
            tokio::spawn(run_worker(self.shared.clone(), self.workers.clone(), thread_id, inbox));
        }
    }

    pub fn active_threads(&self) -> usize {
        lock(&self.workers).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    workers: Workers,
    thread_id: String,
    mut inbox: mpsc::UnboundedReceiver<InboundMessage>,
) {
    debug!(event_name = "mailbox.worker.started", thread_id = %thread_id, "thread worker started");
    loop {
        let message = match timeout(shared.idle_timeout, inbox.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) if retire(&workers, &thread_id, &inbox) => break,
            Err(_) => continue,
        };

        let closing = message.close;
        let body = handle(&shared, &message).await;
        let reply = OutboundMessage { thread_id: message.thread_id, body };
        if shared.outbound.send(reply).await.is_err() {
            debug!(
                event_name = "mailbox.outbound.closed",
                thread_id = %thread_id,
                "outbound receiver dropped; reply discarded"
            );
        }
        if closing && retire(&workers, &thread_id, &inbox) {
            break;
        }
    }
    debug!(event_name = "mailbox.worker.stopped", thread_id = %thread_id, "thread worker stopped");
}

/// Unregisters the worker unless messages are still queued for it. Holding
/// the map lock keeps `dispatch` from enqueueing in between.
fn retire(
    workers: &Workers,
    thread_id: &str,
    inbox: &mpsc::UnboundedReceiver<InboundMessage>,
) -> bool {
    let mut workers = lock(workers);
    if !inbox.is_empty() {
        return false;
    }
    workers.remove(thread_id);
    true
}

async fn handle(shared: &Shared, message: &InboundMessage) -> String {
    let correlation_id = Uuid::new_v4().to_string();
    let session_id = match SessionId::parse(message.thread_id.clone()) {
        Ok(id) => id,
        Err(error) => {
            warn!(
                event_name = "mailbox.message.rejected",
                thread_id = %message.thread_id,
                correlation_id = %correlation_id,
                error = %error,
                "thread id is not a usable session id"
            );
            return ApplicationError::from(error)
                .into_interface(correlation_id)
                .user_message()
                .to_string();
        }
    };

    if message.close {
        return match shared.engine.store().archive(&session_id).await {
            Ok(true) => {
                info!(
                    event_name = "mailbox.thread.closed",
                    thread_id = %session_id,
                    correlation_id = %correlation_id,
                    "conversation archived"
                );
                "Conversation closed.".to_string()
            }
            Ok(false) => "Nothing to close for this conversation.".to_string(),
            Err(error) => {
                warn!(
                    event_name = "mailbox.thread.close_failed",
                    thread_id = %session_id,
                    correlation_id = %correlation_id,
                    error = %error,
                    "archiving the conversation failed"
                );
                ApplicationError::from(error).into_interface(correlation_id).user_message().to_string()
            }
        };
    }

    let mut request =
        ExecutionRequest::new(shared.persona.clone(), message.body.clone()).with_session(session_id);
    if let Some(names) = &shared.capabilities {
        request = request.with_capabilities(names.iter().cloned());
    }

    match shared.engine.execute(request).await {
        Ok(result) => match result.value {
            ExecutionValue::BudgetExceeded(kind) => format!(
                "I stopped after {} steps without finishing ({} budget exhausted). Reply to let \
                 me continue.",
                result.step_count,
                kind.as_str()
            ),
            value => value.render(),
        },
        Err(error) => {
            warn!(
                event_name = "mailbox.execution.failed",
                thread_id = %message.thread_id,
                correlation_id = %correlation_id,
                error = %error,
                "execution failed"
            );
            ApplicationError::from(error).into_interface(correlation_id).user_message().to_string()
        }
    }
}
