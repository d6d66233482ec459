//! The execution loop: think, detect, negotiate, act, feed back.
//!
//! Each iteration returns a [`LoopOutcome`]. `Suspend` parks the loop on the
//! availability monitor and then resumes the same [`IterationState`], so an
//! outage never repeats a think call or a capability that already ran.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ganglion_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use ganglion_core::config::{EngineConfig, NegotiationOutagePolicy};
use ganglion_core::domain::conversation::Turn;
use ganglion_core::domain::execution::{BudgetKind, Budgets, ExecutionResult, ExecutionValue};
use ganglion_core::domain::session::{Session, SessionId, SessionStatus};
use ganglion_core::errors::{ApplicationError, DomainError};
use ganglion_store::{KeyedMutex, SessionStore, StoreError};

use crate::availability::{MonitorError, ServiceAvailabilityMonitor};
use crate::detector::{ActionDetector, DetectError};
use crate::llm::{LlmClient, LlmError, ServiceId};
use crate::negotiation::{NegotiationEngine, NegotiationError, NegotiationOutcome};
use crate::prompts::{PromptError, PromptLibrary};
use crate::tools::{CapabilityRegistry, CapabilitySet, InvocationContext, RegistryError};

/// One unit of work for the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionRequest {
    pub persona: String,
    pub task: String,
    /// Visible capability names. `None` exposes the whole registry.
    pub capabilities: Option<Vec<String>>,
    pub budgets: Option<Budgets>,
    /// `None` runs an ephemeral session that is never persisted.
    pub session_id: Option<SessionId>,
}

impl ExecutionRequest {
    pub fn new(persona: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            task: task.into(),
            capabilities: None,
            budgets: None,
            session_id: None,
        }
    }

    pub fn with_capabilities<S>(mut self, names: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        self.capabilities = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = Some(budgets);
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub budgets: Budgets,
    pub detection_max_attempts: u32,
    pub negotiation_max_rounds: u32,
    pub negotiation_parse_attempts: u32,
    pub max_nesting_depth: u32,
    pub negotiation_outage_policy: NegotiationOutagePolicy,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            budgets: config.budgets(),
            detection_max_attempts: config.detection_max_attempts,
            negotiation_max_rounds: config.negotiation_max_rounds,
            negotiation_parse_attempts: config.negotiation_parse_attempts,
            max_nesting_depth: config.max_nesting_depth,
            negotiation_outage_policy: config.negotiation_outage_policy,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            budgets: Budgets::default(),
            detection_max_attempts: 3,
            negotiation_max_rounds: 5,
            negotiation_parse_attempts: 3,
            max_nesting_depth: 4,
            negotiation_outage_policy: NegotiationOutagePolicy::Wait,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),
    #[error("session persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("recovery wait failed: {0}")]
    Recovery(#[from] MonitorError),
    #[error("{service} service rejected the request: {source}")]
    Reasoning {
        service: ServiceId,
        #[source]
        source: LlmError,
    },
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("nesting depth {depth} exceeds the limit of {limit}")]
    NestingTooDeep { depth: u32, limit: u32 },
    #[error(transparent)]
    InvalidTransition(#[from] DomainError),
    #[error("capability registry is inconsistent: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for EngineError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownCapability(name) => Self::UnknownCapability(name),
            other => Self::Registry(other),
        }
    }
}

impl From<EngineError> for ApplicationError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::UnknownCapability(name) => ApplicationError::Domain(
                DomainError::InvariantViolation(format!("unknown capability `{name}`")),
            ),
            EngineError::Persistence(error) => error.into(),
            EngineError::Recovery(error) => ApplicationError::Unavailable(error.to_string()),
            EngineError::Reasoning { service, source } => {
                ApplicationError::Integration(format!("{service}: {source}"))
            }
            EngineError::Prompt(error) => ApplicationError::Configuration(error.to_string()),
            EngineError::NestingTooDeep { depth, limit } => {
                ApplicationError::Domain(DomainError::InvariantViolation(format!(
                    "nesting depth {depth} exceeds the limit of {limit}"
                )))
            }
            EngineError::InvalidTransition(error) => ApplicationError::Domain(error),
            EngineError::Registry(error) => ApplicationError::Configuration(error.to_string()),
        }
    }
}

/// What one iteration step decided.
#[derive(Clone, Debug, PartialEq)]
pub enum LoopOutcome {
    /// Feed this text back and think again.
    Continue(String),
    Terminate { value: Value, capability: String },
    /// Wait for the service to recover, then retry the same iteration.
    Suspend(ServiceId),
}

/// Progress through one iteration. Kept across a suspension.
#[derive(Debug, Default)]
struct IterationState {
    reply: Option<String>,
    batch: Option<Vec<String>>,
    cursor: usize,
    feedback: Vec<String>,
    context_dirty: bool,
}

impl IterationState {
    fn feedback_text(&self) -> String {
        self.feedback.join("\n\n")
    }
}

struct RunScope {
    session: Session,
    capabilities: CapabilitySet,
    depth: u32,
    lineage: Vec<SessionId>,
    persisted: bool,
    correlation_id: String,
}

/// Forwards audit events to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = %event.event_type,
            session_id = %event.session_id,
            correlation_id = %event.correlation_id,
            category = ?event.category,
            outcome = ?event.outcome,
            metadata = ?event.metadata,
            "audit"
        );
    }
}

pub type RunFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ExecutionResult, EngineError>> + Send + 'a>>;

pub struct ExecutionEngine {
    reasoning: Arc<dyn LlmClient>,
    negotiation: Arc<dyn LlmClient>,
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn SessionStore>,
    monitor: Arc<ServiceAvailabilityMonitor>,
    audit: Arc<dyn AuditSink>,
    prompts: Arc<PromptLibrary>,
    detector: ActionDetector,
    negotiator: NegotiationEngine,
    settings: EngineSettings,
    session_locks: KeyedMutex,
}

impl ExecutionEngine {
    pub fn new(
        reasoning: Arc<dyn LlmClient>,
        negotiation: Arc<dyn LlmClient>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn SessionStore>,
        monitor: Arc<ServiceAvailabilityMonitor>,
        settings: EngineSettings,
    ) -> Result<Self, PromptError> {
        let prompts = Arc::new(PromptLibrary::new()?);
        Ok(Self {
            reasoning,
            negotiation,
            registry,
            store,
            monitor,
            audit: Arc::new(TracingAuditSink),
            detector: ActionDetector::new(prompts.clone(), settings.detection_max_attempts),
            negotiator: NegotiationEngine::new(
                prompts.clone(),
                settings.negotiation_max_rounds,
                settings.negotiation_parse_attempts,
            ),
            prompts,
            settings,
            session_locks: KeyedMutex::new(),
        })
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &Arc<ServiceAvailabilityMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        self.run(request, 0, Vec::new()).await
    }

    /// Boxed so capability handlers can recurse into the engine.
    pub(crate) fn run<'a>(
        &'a self,
        request: ExecutionRequest,
        depth: u32,
        lineage: Vec<SessionId>,
    ) -> RunFuture<'a> {
        Box::pin(async move { self.run_to_completion(request, depth, lineage).await })
    }

    async fn run_to_completion(
        &self,
        request: ExecutionRequest,
        depth: u32,
        lineage: Vec<SessionId>,
    ) -> Result<ExecutionResult, EngineError> {
        if depth > self.settings.max_nesting_depth {
            return Err(EngineError::NestingTooDeep {
                depth,
                limit: self.settings.max_nesting_depth,
            });
        }
        if let Some(id) = &request.session_id {
            if lineage.contains(id) {
                return Err(EngineError::InvalidTransition(DomainError::InvariantViolation(
                    format!("session `{id}` is already executing further up the call stack"),
                )));
            }
        }

        let capabilities = match &request.capabilities {
            Some(names) => self.registry.select(names)?,
            None => self.registry.all(),
        };
        let budgets = request.budgets.unwrap_or(self.settings.budgets);

        let _session_guard = match &request.session_id {
            Some(id) => Some(self.session_locks.lock(id.as_str()).await),
            None => None,
        };

        let correlation_id = Uuid::new_v4().to_string();
        let session = self.open_session(&request, &capabilities, &correlation_id).await?;
        let mut scope = RunScope {
            persisted: request.session_id.is_some(),
            session,
            capabilities,
            depth,
            lineage,
            correlation_id,
        };

        info!(
            event_name = "engine.run.started",
            session_id = %scope.session.id,
            depth,
            max_steps = budgets.max_steps,
            capabilities = ?scope.capabilities.names(),
            "execution started"
        );

        let started = Instant::now();
        let mut steps: u32 = 0;
        loop {
            if steps >= budgets.max_steps {
                return self.finish_exhausted(&mut scope, BudgetKind::Steps, steps, started).await;
            }
            if started.elapsed() >= budgets.max_wall_time {
                return self
                    .finish_exhausted(&mut scope, BudgetKind::WallTime, steps, started)
                    .await;
            }
            steps += 1;

            let mut iteration = IterationState::default();
            let feedback = loop {
                match self.advance(&mut scope, &mut iteration, steps).await? {
                    LoopOutcome::Continue(feedback) => break feedback,
                    LoopOutcome::Terminate { value, capability } => {
                        if !iteration.feedback.is_empty() {
                            scope.session.append(Turn::user(iteration.feedback_text()));
                        }
                        return self
                            .finish_returned(&mut scope, value, capability, steps, started)
                            .await;
                    }
                    LoopOutcome::Suspend(service) => {
                        self.suspend(&mut scope, &iteration, service).await?
                    }
                }
            };

            scope.session.append(Turn::user(feedback));
            if scope.persisted && iteration.context_dirty {
                self.store.save_context_only(&scope.session).await?;
            }
        }
    }

    async fn open_session(
        &self,
        request: &ExecutionRequest,
        capabilities: &CapabilitySet,
        correlation_id: &str,
    ) -> Result<Session, EngineError> {
        let Some(id) = &request.session_id else {
            let system = self.prompts.catalogue(&request.persona, &capabilities.specs())?;
            return Ok(Session::start(SessionId::generate(), system, request.task.clone()));
        };

        match self.store.load(id).await? {
            None => {
                let system = self.prompts.catalogue(&request.persona, &capabilities.specs())?;
                let session = Session::start(id.clone(), system, request.task.clone());
                self.store.save(&session).await?;
                Ok(session)
            }
            Some(mut session) => {
                let previous = session.status;
                session.transition_to(SessionStatus::Active)?;
                if !request.task.trim().is_empty() {
                    session.append(Turn::user(request.task.clone()));
                }
                self.store.save(&session).await?;
                self.emit(
                    &session.id,
                    correlation_id,
                    "engine.resumed",
                    AuditCategory::Lifecycle,
                    AuditOutcome::Success,
                    &[("previous_status", previous.as_str().to_string())],
                );
                Ok(session)
            }
        }
    }

    /// Runs the current iteration as far as it can go.
    async fn advance(
        &self,
        scope: &mut RunScope,
        iteration: &mut IterationState,
        step: u32,
    ) -> Result<LoopOutcome, EngineError> {
        if iteration.reply.is_none() {
            let reply = match self.reasoning.complete(scope.session.history.turns()).await {
                Ok(reply) => reply,
                Err(error) if error.is_unavailable() => {
                    self.monitor.report_unavailable(ServiceId::Reasoning, &error.to_string());
                    return Ok(LoopOutcome::Suspend(ServiceId::Reasoning));
                }
                Err(source) => {
                    return Err(EngineError::Reasoning { service: ServiceId::Reasoning, source })
                }
            };
            self.monitor.report_available(ServiceId::Reasoning);
            scope.session.append(Turn::assistant(reply.content.clone()));
            debug!(
                event_name = "engine.think.completed",
                session_id = %scope.session.id,
                step,
                chars = reply.content.len(),
                "reasoning reply received"
            );
            self.emit_scoped(scope, "engine.think", AuditCategory::Think, AuditOutcome::Success, &[
                ("step", step.to_string()),
            ]);
            iteration.reply = Some(reply.content);
        }

        if iteration.batch.is_none() {
            let reply = iteration.reply.as_deref().unwrap_or_default();
            let available = scope.capabilities.names();
            let names = match self.detector.detect(self.reasoning.as_ref(), reply, &available).await
            {
                Ok(detection) => detection.names,
                Err(DetectError::Llm(error)) if error.is_unavailable() => {
                    self.monitor.report_unavailable(ServiceId::Reasoning, &error.to_string());
                    return Ok(LoopOutcome::Suspend(ServiceId::Reasoning));
                }
                Err(DetectError::Llm(source)) => {
                    return Err(EngineError::Reasoning { service: ServiceId::Reasoning, source })
                }
                Err(DetectError::Unresolved { attempts }) => {
                    warn!(
                        event_name = "engine.detect.unresolved",
                        session_id = %scope.session.id,
                        step,
                        attempts,
                        "capability selection never parsed; treating as no selection"
                    );
                    Vec::new()
                }
                Err(DetectError::Prompt(error)) => return Err(error.into()),
            };
            self.emit_scoped(scope, "engine.detect", AuditCategory::Detect, AuditOutcome::Success, &[
                ("step", step.to_string()),
                ("selected", names.join(",")),
            ]);

            if names.is_empty() {
                iteration.batch = Some(Vec::new());
                iteration.feedback.push(self.prompts.reprompt(&scope.capabilities.specs())?);
                return Ok(LoopOutcome::Continue(iteration.feedback_text()));
            }
            iteration.batch = Some(names);
        }

        let batch = iteration.batch.clone().unwrap_or_default();
        while let Some(name) = batch.get(iteration.cursor) {
            let Some(capability) = scope.capabilities.get(name).cloned() else {
                iteration.cursor += 1;
                iteration.feedback.push(format!("`{name}` is not available here."));
                continue;
            };
            let spec = capability.spec().clone();
            let intent = iteration.reply.as_deref().unwrap_or_default();

            scope.session.transition_to(SessionStatus::Negotiating)?;
            let (negotiator, negotiator_id) = self.negotiator_for(&scope.session.id);
            let negotiated = self
                .negotiator
                .negotiate(
                    negotiator,
                    negotiator_id,
                    self.reasoning.as_ref(),
                    &scope.session.history,
                    intent,
                    &spec,
                )
                .await;

            let args = match negotiated {
                Ok(negotiated) => {
                    self.monitor.report_available(negotiator_id);
                    scope.session.transition_to(SessionStatus::Active)?;
                    match negotiated.outcome {
                        NegotiationOutcome::Ready(args) => {
                            self.emit_scoped(
                                scope,
                                "engine.negotiate",
                                AuditCategory::Negotiate,
                                AuditOutcome::Success,
                                &[
                                    ("capability", spec.name.clone()),
                                    ("rounds", negotiated.rounds.to_string()),
                                ],
                            );
                            args
                        }
                        NegotiationOutcome::NotToRun { reason } => {
                            self.emit_scoped(
                                scope,
                                "engine.negotiate",
                                AuditCategory::Negotiate,
                                AuditOutcome::Rejected,
                                &[("capability", spec.name.clone()), ("reason", reason.clone())],
                            );
                            iteration.cursor += 1;
                            iteration.feedback.push(format!("Skipped `{}`: {reason}", spec.name));
                            continue;
                        }
                    }
                }
                Err(NegotiationError::Llm { service, source }) if source.is_unavailable() => {
                    self.monitor.report_unavailable(service, &source.to_string());
                    return Ok(LoopOutcome::Suspend(service));
                }
                Err(NegotiationError::Prompt(error)) => return Err(error.into()),
                Err(error) => {
                    scope.session.transition_to(SessionStatus::Active)?;
                    warn!(
                        event_name = "engine.negotiate.failed",
                        session_id = %scope.session.id,
                        capability = %spec.name,
                        error = %error,
                        "arguments could not be settled"
                    );
                    self.emit_scoped(
                        scope,
                        "engine.negotiate",
                        AuditCategory::Negotiate,
                        AuditOutcome::Failed,
                        &[("capability", spec.name.clone()), ("error", error.to_string())],
                    );
                    iteration.cursor += 1;
                    iteration
                        .feedback
                        .push(format!("Could not prepare `{}`: {error}. Nothing was run.", spec.name));
                    continue;
                }
            };

            iteration.cursor += 1;
            let mut ctx = InvocationContext::new(
                self,
                &scope.session.id,
                scope.depth,
                &scope.lineage,
                &mut scope.session.context,
            );
            let invoked = capability.invoke(args, &mut ctx).await;
            iteration.context_dirty |= ctx.is_dirty();

            match invoked {
                Ok(value) if spec.is_terminal() => {
                    self.emit_scoped(
                        scope,
                        "engine.capability",
                        AuditCategory::Capability,
                        AuditOutcome::Success,
                        &[("capability", spec.name.clone()), ("terminal", "true".to_string())],
                    );
                    return Ok(LoopOutcome::Terminate { value, capability: spec.name });
                }
                Ok(value) => {
                    debug!(
                        event_name = "engine.capability.completed",
                        session_id = %scope.session.id,
                        capability = %spec.name,
                        step,
                        "capability returned"
                    );
                    self.emit_scoped(
                        scope,
                        "engine.capability",
                        AuditCategory::Capability,
                        AuditOutcome::Success,
                        &[("capability", spec.name.clone())],
                    );
                    iteration.feedback.push(format!("`{}` returned: {}", spec.name, render(&value)));
                }
                Err(error) => {
                    warn!(
                        event_name = "engine.capability.failed",
                        session_id = %scope.session.id,
                        capability = %spec.name,
                        step,
                        error = %error,
                        "capability failed"
                    );
                    self.emit_scoped(
                        scope,
                        "engine.capability",
                        AuditCategory::Capability,
                        AuditOutcome::Failed,
                        &[("capability", spec.name.clone()), ("error", format!("{error:#}"))],
                    );
                    iteration.feedback.push(format!("`{}` failed: {error:#}", spec.name));
                }
            }
        }

        Ok(LoopOutcome::Continue(iteration.feedback_text()))
    }

    fn negotiator_for(&self, session_id: &SessionId) -> (&dyn LlmClient, ServiceId) {
        let fallback = self.settings.negotiation_outage_policy
            == NegotiationOutagePolicy::FallbackToReasoning
            && !self.monitor.is_available(ServiceId::Negotiation);
        if fallback {
            warn!(
                event_name = "engine.negotiate.fallback",
                session_id = %session_id,
                "negotiation service down; negotiating with the reasoning service"
            );
            (self.reasoning.as_ref(), ServiceId::Reasoning)
        } else {
            (self.negotiation.as_ref(), ServiceId::Negotiation)
        }
    }

    /// Checkpoints the session, waits for `service`, then restores the phase
    /// the iteration was in. The checkpoint carries feedback of capabilities
    /// that already ran; the live history only gets it once the iteration ends.
    async fn suspend(
        &self,
        scope: &mut RunScope,
        iteration: &IterationState,
        service: ServiceId,
    ) -> Result<(), EngineError> {
        let interrupted = scope.session.status;
        scope.session.transition_to(SessionStatus::Waiting)?;
        if scope.persisted {
            if iteration.feedback.is_empty() {
                self.store.save(&scope.session).await?;
            } else {
                let mut checkpoint = scope.session.clone();
                checkpoint.append(Turn::user(iteration.feedback_text()));
                self.store.save(&checkpoint).await?;
            }
        }
        info!(
            event_name = "engine.suspended",
            session_id = %scope.session.id,
            service = %service,
            "waiting for service recovery"
        );
        self.emit_scoped(scope, "engine.suspended", AuditCategory::Availability, AuditOutcome::Success, &[
            ("service", service.to_string()),
        ]);

        self.monitor.await_recovery(service).await?;

        scope.session.transition_to(interrupted)?;
        self.emit_scoped(scope, "engine.resumed", AuditCategory::Availability, AuditOutcome::Success, &[
            ("service", service.to_string()),
        ]);
        Ok(())
    }

    async fn finish_returned(
        &self,
        scope: &mut RunScope,
        value: Value,
        capability: String,
        steps: u32,
        started: Instant,
    ) -> Result<ExecutionResult, EngineError> {
        self.terminate(scope, ExecutionValue::Returned(value), Some(capability), steps, started).await
    }

    async fn finish_exhausted(
        &self,
        scope: &mut RunScope,
        kind: BudgetKind,
        steps: u32,
        started: Instant,
    ) -> Result<ExecutionResult, EngineError> {
        info!(
            event_name = "engine.budget.exhausted",
            session_id = %scope.session.id,
            budget = kind.as_str(),
            steps,
            "budget exhausted before a terminal capability ran"
        );
        self.terminate(scope, ExecutionValue::BudgetExceeded(kind), None, steps, started).await
    }

    async fn terminate(
        &self,
        scope: &mut RunScope,
        value: ExecutionValue,
        last_capability: Option<String>,
        steps: u32,
        started: Instant,
    ) -> Result<ExecutionResult, EngineError> {
        scope.session.transition_to(SessionStatus::Terminated)?;
        if scope.persisted {
            self.store.save(&scope.session).await?;
        }

        let outcome =
            if value.is_budget_exceeded() { AuditOutcome::Rejected } else { AuditOutcome::Success };
        self.emit_scoped(scope, "engine.terminated", AuditCategory::Lifecycle, outcome, &[
            ("steps", steps.to_string()),
            ("capability", last_capability.clone().unwrap_or_default()),
        ]);
        info!(
            event_name = "engine.run.completed",
            session_id = %scope.session.id,
            depth = scope.depth,
            steps,
            budget_exceeded = value.is_budget_exceeded(),
            "execution finished"
        );

        Ok(ExecutionResult {
            session_id: scope.session.id.clone(),
            value,
            last_capability,
            step_count: steps,
            elapsed: started.elapsed(),
        })
    }

    fn emit_scoped(
        &self,
        scope: &RunScope,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, String)],
    ) {
        self.emit(&scope.session.id, &scope.correlation_id, event_type, category, outcome, metadata);
    }

    fn emit(
        &self,
        session_id: &SessionId,
        correlation_id: &str,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, String)],
    ) {
        let event = metadata.iter().fold(
            AuditEvent::new(session_id.clone(), correlation_id, event_type, category, outcome),
            |event, (key, value)| event.with_metadata(*key, value.clone()),
        );
        self.audit.emit(event);
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
