use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use ganglion_agent::availability::{MonitorSettings, ServiceAvailabilityMonitor};
use ganglion_agent::builtin::{Delegate, Finish, Remember};
use ganglion_agent::llm::{Completion, LlmClient, LlmError, ServiceId};
use ganglion_agent::runtime::{EngineError, EngineSettings, ExecutionEngine, ExecutionRequest};
use ganglion_agent::testing::ScriptedLlm;
use ganglion_agent::tools::{
    Arguments, Capability, CapabilityRegistry, CapabilitySpec, InvocationContext, ParamKind,
    ParameterSpec,
};
use ganglion_core::audit::InMemoryAuditSink;
use ganglion_core::config::NegotiationOutagePolicy;
use ganglion_core::domain::conversation::{Role, Turn};
use ganglion_core::domain::execution::{BudgetKind, Budgets, ExecutionValue};
use ganglion_core::domain::session::{SessionId, SessionStatus};
use ganglion_store::{InMemorySessionStore, SessionStore};

/// Routine capability that records every argument set it was invoked with.
struct Recording {
    spec: CapabilitySpec,
    calls: Mutex<Vec<Arguments>>,
}

impl Recording {
    fn new(spec: CapabilitySpec) -> Arc<Self> {
        Arc::new(Self { spec, calls: Mutex::new(Vec::new()) })
    }

    fn search(name: &str) -> Arc<Self> {
        Self::new(
            CapabilitySpec::routine(name, "search the index")
                .with_parameter(ParameterSpec::required("query", "what to look for", ParamKind::String)),
        )
    }

    fn calls(&self) -> Vec<Arguments> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl Capability for Recording {
    fn spec(&self) -> &CapabilitySpec {
        &self.spec
    }

    async fn invoke(
        &self,
        args: Arguments,
        _ctx: &mut InvocationContext<'_>,
    ) -> anyhow::Result<Value> {
        self.calls.lock().expect("calls").push(args.clone());
        Ok(json!(format!("{} hits", self.spec.name)))
    }
}

/// Answers negotiation requests by looking at which capability is being negotiated.
fn negotiator() -> ScriptedLlm {
    ScriptedLlm::from_fn(|turns| {
        let system = turns.first().map(|turn| turn.content.as_str()).unwrap_or_default();
        let reply = if system.contains("capability `finish`") {
            "STATUS: READY\nPARAMS:\nresult: done"
        } else if system.contains("capability `search_deep`") {
            "STATUS: READY\nPARAMS:\nquery: archive"
        } else if system.contains("capability `search`") {
            "STATUS: READY\nPARAMS:\nquery: rust"
        } else if system.contains("capability `remember`") {
            "STATUS: READY\nPARAMS:\nkey: topic\nvalue: rust"
        } else if system.contains("capability `delegate`") {
            "STATUS: READY\nPARAMS:\ntask: summarise the notes"
        } else {
            "STATUS: NOT_TO_RUN\nREASON: not expected in this test"
        };
        Ok(reply.to_string())
    })
}

fn fast_monitor() -> MonitorSettings {
    MonitorSettings {
        probe_interval: Duration::ZERO,
        probe_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(5),
        log_every_polls: 10,
        max_outage: Some(Duration::from_secs(10)),
    }
}

struct Harness {
    engine: Arc<ExecutionEngine>,
    negotiation: Arc<ScriptedLlm>,
    store: Arc<InMemorySessionStore>,
    audit: InMemoryAuditSink,
}

fn harness(
    reasoning: Arc<dyn LlmClient>,
    negotiation: ScriptedLlm,
    capabilities: Vec<Arc<dyn Capability>>,
    settings: EngineSettings,
) -> Harness {
    let negotiation = Arc::new(negotiation);
    let (engine, store, audit) =
        assemble(reasoning, negotiation.clone(), capabilities, settings);
    Harness { engine, negotiation, store, audit }
}

fn assemble(
    reasoning: Arc<dyn LlmClient>,
    negotiation: Arc<dyn LlmClient>,
    capabilities: Vec<Arc<dyn Capability>>,
    settings: EngineSettings,
) -> (Arc<ExecutionEngine>, Arc<InMemorySessionStore>, InMemoryAuditSink) {
    let store = Arc::new(InMemorySessionStore::new());
    let audit = InMemoryAuditSink::default();
    let registry = capabilities
        .into_iter()
        .fold(CapabilityRegistry::builder(), |builder, capability| builder.register_arc(capability))
        .build()
        .expect("registry");
    let monitor = ServiceAvailabilityMonitor::new(fast_monitor())
        .with_probe(ServiceId::Reasoning, reasoning.clone())
        .with_probe(ServiceId::Negotiation, negotiation.clone());

    let engine = ExecutionEngine::new(
        reasoning,
        negotiation.clone(),
        Arc::new(registry),
        store.clone(),
        Arc::new(monitor),
        settings,
    )
    .expect("engine")
    .with_audit(Arc::new(audit.clone()));

    (Arc::new(engine), store, audit)
}

fn finish() -> Arc<dyn Capability> {
    Arc::new(Finish::new())
}

fn shared(recording: &Arc<Recording>) -> Arc<dyn Capability> {
    recording.clone()
}

fn boxed<C: Capability + 'static>(capability: C) -> Arc<dyn Capability> {
    Arc::new(capability)
}

#[tokio::test]
async fn single_terminal_mention_finishes_without_disambiguation() {
    let reasoning = Arc::new(ScriptedLlm::replies(["I have what I need, so I will finish."]));
    let search = Recording::search("search");
    let h = harness(reasoning.clone(), negotiator(), vec![shared(&search), finish()], EngineSettings::default());

    let result = h.engine.execute(ExecutionRequest::new("You research.", "find it")).await.expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    assert_eq!(result.last_capability.as_deref(), Some("finish"));
    assert_eq!(result.step_count, 1);
    assert_eq!(reasoning.call_count(), 1);
    assert!(search.calls().is_empty());

    let calls = reasoning.calls();

    let first_call = &calls[0];
    assert_eq!(first_call[0].role, Role::System);
    assert!(first_call[0].content.starts_with("You research."));
    assert_eq!(first_call[1], Turn::user("find it"));
}

#[tokio::test]
async fn overlapping_names_are_disambiguated_by_the_reasoning_service() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "A plain search found nothing earlier, so now I run search_deep on the archive.",
        "ACTIONS: search_deep",
        "That is enough, finish.",
    ]));
    let search = Recording::search("search");
    let search_deep = Recording::search("search_deep");
    let h = harness(
        reasoning.clone(),
        negotiator(),
        vec![shared(&search), shared(&search_deep), finish()],
        EngineSettings::default(),
    );

    let result = h.engine.execute(ExecutionRequest::new("persona", "dig")).await.expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    assert_eq!(search_deep.calls().len(), 1);
    assert_eq!(search_deep.calls()[0].str("query"), Some("archive"));
    assert!(search.calls().is_empty());
    assert_eq!(reasoning.call_count(), 3);
    assert!(reasoning.calls()[1][0].content.contains("search, search_deep"));

    let calls = reasoning.calls();

    let third_think = &calls[2];
    let feedback = third_think.last().expect("feedback turn");
    assert_eq!(feedback.role, Role::User);
    assert_eq!(feedback.content, "`search_deep` returned: search_deep hits");
}

#[tokio::test]
async fn missing_argument_is_clarified_through_the_reasoning_service() {
    let read_file = Recording::new(
        CapabilitySpec::routine("read_file", "read a file")
            .with_parameter(ParameterSpec::required("path", "file path", ParamKind::String)),
    );
    let reasoning = Arc::new(ScriptedLlm::replies([
        "I should read_file to check the config.",
        "The config lives at config/app.toml.",
        "Now I can finish.",
    ]));
    let negotiation = ScriptedLlm::replies([
        "STATUS: ASK\nQUESTION: Which file path should be read?",
        "STATUS: READY\nPARAMS:\npath: config/app.toml",
        "STATUS: READY\nPARAMS:\nresult: done",
    ]);
    let h = harness(reasoning.clone(), negotiation, vec![shared(&read_file), finish()], EngineSettings::default());

    h.engine.execute(ExecutionRequest::new("persona", "read the config")).await.expect("run");

    assert_eq!(read_file.calls().len(), 1);
    assert_eq!(read_file.calls()[0].str("path"), Some("config/app.toml"));
    let calls = reasoning.calls();
    let clarification = &calls[1];
    assert!(clarification.last().expect("question").content.contains("Which file path"));

    let negotiations = h.audit.events_of_type("engine.negotiate");
    assert_eq!(negotiations[0].metadata.get("capability").map(String::as_str), Some("read_file"));
    assert_eq!(negotiations[0].metadata.get("rounds").map(String::as_str), Some("2"));
    assert_eq!(h.negotiation.call_count(), 3);
}

/// Reasoning backend that is down for one task until switched back on.
struct GatedReasoning {
    down: AtomicBool,
    failures: AtomicUsize,
}

impl GatedReasoning {
    const FLAKY_TASK: &'static str = "the flaky task";
}

#[async_trait]
impl LlmClient for GatedReasoning {
    async fn complete(&self, turns: &[Turn]) -> Result<Completion, LlmError> {
        let flaky = turns.iter().any(|turn| turn.content == Self::FLAKY_TASK);
        if flaky && self.down.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(LlmError::Unavailable("connection refused".to_string()));
        }
        Ok(Completion::new("All done, finish."))
    }

    async fn probe(&self) -> Result<(), LlmError> {
        if self.down.load(Ordering::SeqCst) {
            Err(LlmError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outage_suspends_one_session_while_others_continue() {
    let reasoning =
        Arc::new(GatedReasoning { down: AtomicBool::new(true), failures: AtomicUsize::new(0) });
    let h = harness(reasoning.clone(), negotiator(), vec![finish()], EngineSettings::default());
    let flaky_id = SessionId::parse("flaky").expect("id");

    let engine = h.engine.clone();
    let request = ExecutionRequest::new("persona", GatedReasoning::FLAKY_TASK).with_session(flaky_id.clone());
    let flaky = tokio::spawn(async move { engine.execute(request).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.audit.events_of_type("engine.suspended").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flaky session suspended");

    let checkpoint = h.store.load(&flaky_id).await.expect("load").expect("checkpointed");
    assert_eq!(checkpoint.history.len(), 2);

    for name in ["steady-1", "steady-2"] {
        let request = ExecutionRequest::new("persona", format!("task for {name}"))
            .with_session(SessionId::parse(name).expect("id"));
        let result = h.engine.execute(request).await.expect("unaffected session");
        assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    }
    assert!(!flaky.is_finished());

    reasoning.down.store(false, Ordering::SeqCst);
    let result = tokio::time::timeout(Duration::from_secs(5), flaky)
        .await
        .expect("resumed in time")
        .expect("join")
        .expect("flaky run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    assert_eq!(result.step_count, 1);
    assert!(reasoning.failures.load(Ordering::SeqCst) >= 1);

    let stored = h.store.load(&flaky_id).await.expect("load").expect("stored");
    let turns = stored.history.turns();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[1], Turn::user(GatedReasoning::FLAKY_TASK));
    assert_eq!(turns[2], Turn::assistant("All done, finish."));
    assert!(!h.audit.events_of_type("engine.resumed").is_empty());
}

#[tokio::test]
async fn step_budget_ends_with_a_reportable_value() {
    let reasoning = Arc::new(ScriptedLlm::from_fn(|_| Ok("Let me think about this some more.".to_string())));
    let h = harness(reasoning.clone(), negotiator(), vec![finish()], EngineSettings::default());
    let budgets = Budgets { max_steps: 3, max_wall_time: Duration::from_secs(60) };

    let result = h
        .engine
        .execute(ExecutionRequest::new("persona", "ponder").with_budgets(budgets))
        .await
        .expect("budget exhaustion is not an error");

    assert_eq!(result.value, ExecutionValue::BudgetExceeded(BudgetKind::Steps));
    assert_eq!(result.step_count, 3);
    assert_eq!(reasoning.call_count(), 3);
    let reprompts = reasoning.calls()[2]
        .iter()
        .filter(|turn| turn.role == Role::User && turn.content.starts_with("No capability was selected"))
        .count();
    assert_eq!(reprompts, 2);
}

#[tokio::test]
async fn terminal_capability_cuts_the_batch_short() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "First search, then finish, then search again.",
        "ACTIONS: search, finish, search",
    ]));
    let search = Recording::search("search");
    let h = harness(reasoning, negotiator(), vec![shared(&search), finish()], EngineSettings::default());
    let id = SessionId::parse("batch-1").expect("id");

    let result = h
        .engine
        .execute(ExecutionRequest::new("persona", "look").with_session(id.clone()))
        .await
        .expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    assert_eq!(search.calls().len(), 1);
    let stored = h.store.load(&id).await.expect("load").expect("stored");
    assert_eq!(
        stored.history.last().map(|turn| turn.content.as_str()),
        Some("`search` returned: search hits")
    );
}

#[tokio::test]
async fn nested_execution_shares_only_its_result() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "This is a separate job, I'll delegate it.",
        "Summary ready, finish.",
        "The helper answered, finish.",
    ]));
    let h = harness(
        reasoning.clone(),
        negotiator(),
        vec![boxed(Delegate::new()), boxed(Remember::new()), finish()],
        EngineSettings::default(),
    );

    let result = h.engine.execute(ExecutionRequest::new("persona", "parent task")).await.expect("run");
    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));

    let calls = reasoning.calls();
    let nested = &calls[1];
    assert_eq!(nested.len(), 2);
    assert_eq!(nested[1], Turn::user("summarise the notes"));
    assert!(nested.iter().all(|turn| turn.content != "parent task"));

    let parent = &calls[2];
    assert!(parent.iter().all(|turn| turn.content != "Summary ready, finish."));
    assert_eq!(parent.last(), Some(&Turn::user("`delegate` returned: done")));
}

#[tokio::test]
async fn nesting_limit_failure_is_fed_back_not_raised() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "I'll delegate this to a helper.",
        "Fine, I will finish myself.",
    ]));
    let settings = EngineSettings { max_nesting_depth: 0, ..EngineSettings::default() };
    let h = harness(reasoning.clone(), negotiator(), vec![boxed(Delegate::new()), finish()], settings);

    let result = h.engine.execute(ExecutionRequest::new("persona", "task")).await.expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    let feedback = reasoning.calls()[1].last().cloned().expect("feedback");
    assert!(feedback.content.starts_with("`delegate` failed:"), "{}", feedback.content);
    assert!(feedback.content.contains("nesting depth 1 exceeds the limit of 0"));
}

#[tokio::test]
async fn scratch_context_changes_use_context_only_saves() {
    let reasoning = Arc::new(ScriptedLlm::replies(["I'll remember the topic.", "Now finish."]));
    let h = harness(
        reasoning,
        negotiator(),
        vec![boxed(Remember::new()), finish()],
        EngineSettings::default(),
    );
    let id = SessionId::parse("ctx-1").expect("id");

    h.engine
        .execute(ExecutionRequest::new("persona", "note it").with_session(id.clone()))
        .await
        .expect("run");

    assert_eq!(h.store.full_writes(), 2);
    assert_eq!(h.store.context_writes(), 1);
    let stored = h.store.load(&id).await.expect("load").expect("stored");
    assert_eq!(stored.context.get("topic"), Some(&json!("rust")));
}

#[tokio::test]
async fn negotiation_outage_can_fall_back_to_reasoning() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "Wrapping up, finish.",
        "STATUS: READY\nPARAMS:\nresult: via reasoning",
    ]));
    let settings = EngineSettings {
        negotiation_outage_policy: NegotiationOutagePolicy::FallbackToReasoning,
        ..EngineSettings::default()
    };
    let h = harness(reasoning, negotiator(), vec![finish()], settings);
    h.engine.monitor().report_unavailable(ServiceId::Negotiation, "refused");

    let result = h.engine.execute(ExecutionRequest::new("persona", "task")).await.expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("via reasoning")));
    assert_eq!(h.negotiation.call_count(), 0);
}

#[tokio::test]
async fn unknown_capability_names_are_rejected_up_front() {
    let reasoning = Arc::new(ScriptedLlm::new());
    let h = harness(reasoning.clone(), negotiator(), vec![finish()], EngineSettings::default());

    let error = h
        .engine
        .execute(ExecutionRequest::new("persona", "task").with_capabilities(["finish", "teleport"]))
        .await
        .expect_err("unknown capability");

    assert!(matches!(error, EngineError::UnknownCapability(name) if name == "teleport"));
    assert_eq!(reasoning.call_count(), 0);
}

#[tokio::test]
async fn resumed_session_continues_its_history() {
    let reasoning = Arc::new(ScriptedLlm::from_fn(|_| Ok("Answering now, finish.".to_string())));
    let h = harness(reasoning.clone(), negotiator(), vec![finish()], EngineSettings::default());
    let id = SessionId::parse("thread-9").expect("id");

    for task in ["first question", "second question"] {
        h.engine
            .execute(ExecutionRequest::new("persona", task).with_session(id.clone()))
            .await
            .expect("run");
    }

    let calls = reasoning.calls();

    let second = &calls[1];
    assert_eq!(second.len(), 4);
    assert_eq!(second[1], Turn::user("first question"));
    assert_eq!(second[3], Turn::user("second question"));
}

#[tokio::test]
async fn repeated_mentions_run_the_capability_once_per_mention() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "I will search for rust, then search for tokio.",
        "ACTIONS: search, search",
        "Both searches are in, finish.",
    ]));
    let search = Recording::search("search");
    let h = harness(reasoning.clone(), negotiator(), vec![shared(&search), finish()], EngineSettings::default());

    h.engine.execute(ExecutionRequest::new("persona", "compare")).await.expect("run");

    assert_eq!(search.calls().len(), 2);
    let calls = reasoning.calls();
    assert_eq!(
        calls[2].last().map(|turn| turn.content.as_str()),
        Some("`search` returned: search hits\n\n`search` returned: search hits")
    );
}

/// Reasoning backend that takes a while to answer.
struct SlowReasoning;

#[async_trait]
impl LlmClient for SlowReasoning {
    async fn complete(&self, _turns: &[Turn]) -> Result<Completion, LlmError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(Completion::new("Still thinking it over."))
    }
}

#[tokio::test]
async fn wall_clock_budget_stops_a_slow_loop() {
    let h = harness(Arc::new(SlowReasoning), negotiator(), vec![finish()], EngineSettings::default());
    let budgets = Budgets { max_steps: 1_000, max_wall_time: Duration::from_millis(50) };

    let result = h
        .engine
        .execute(ExecutionRequest::new("persona", "ponder").with_budgets(budgets))
        .await
        .expect("budget exhaustion is not an error");

    assert_eq!(result.value, ExecutionValue::BudgetExceeded(BudgetKind::WallTime));
    assert!(result.step_count >= 1 && result.step_count < 1_000, "{}", result.step_count);
    assert!(result.elapsed >= Duration::from_millis(50));
}

/// Negotiation backend that goes down for `finish` until switched back on.
struct GatedNegotiation {
    down: AtomicBool,
}

#[async_trait]
impl LlmClient for GatedNegotiation {
    async fn complete(&self, turns: &[Turn]) -> Result<Completion, LlmError> {
        let system = turns.first().map(|turn| turn.content.as_str()).unwrap_or_default();
        if system.contains("capability `search`") {
            return Ok(Completion::new("STATUS: READY\nPARAMS:\nquery: rust"));
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable("connection reset".to_string()));
        }
        Ok(Completion::new("STATUS: READY\nPARAMS:\nresult: done"))
    }

    async fn probe(&self) -> Result<(), LlmError> {
        if self.down.load(Ordering::SeqCst) {
            Err(LlmError::Unavailable("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negotiation_outage_mid_batch_resumes_without_rerunning_finished_work() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "First search, then finish.",
        "ACTIONS: search, finish",
    ]));
    let negotiation = Arc::new(GatedNegotiation { down: AtomicBool::new(true) });
    let search = Recording::search("search");
    let (engine, store, audit) = assemble(
        reasoning.clone(),
        negotiation.clone(),
        vec![shared(&search), finish()],
        EngineSettings::default(),
    );
    let id = SessionId::parse("mid-batch").expect("id");

    let running = engine.clone();
    let request = ExecutionRequest::new("persona", "look it up").with_session(id.clone());
    let run = tokio::spawn(async move { running.execute(request).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while audit.events_of_type("engine.suspended").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("suspended on the negotiation service");

    assert_eq!(search.calls().len(), 1);
    let checkpoint = store.load(&id).await.expect("load").expect("checkpointed");
    assert_eq!(checkpoint.status, SessionStatus::Waiting);
    assert_eq!(checkpoint.history.last(), Some(&Turn::user("`search` returned: search hits")));

    negotiation.down.store(false, Ordering::SeqCst);
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("resumed in time")
        .expect("join")
        .expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    assert_eq!(result.step_count, 1);
    assert_eq!(search.calls().len(), 1);
    assert_eq!(reasoning.call_count(), 2);

    let stored = store.load(&id).await.expect("load").expect("stored");
    let feedback_turns = stored
        .history
        .turns()
        .iter()
        .filter(|turn| turn.content == "`search` returned: search hits")
        .count();
    assert_eq!(feedback_turns, 1);
}

#[tokio::test]
async fn declined_and_unsettled_negotiations_are_fed_back() {
    let reasoning = Arc::new(ScriptedLlm::replies([
        "Let me search for it.",
        "Okay, read_file then.",
        "No idea which file.",
        "Giving up, finish.",
    ]));
    let negotiation = ScriptedLlm::from_fn(|turns| {
        let system = turns.first().map(|turn| turn.content.as_str()).unwrap_or_default();
        let reply = if system.contains("capability `search`") {
            "STATUS: NOT_TO_RUN\nREASON: the query is only hypothetical"
        } else if system.contains("capability `read_file`") {
            "STATUS: ASK\nQUESTION: Which file?"
        } else {
            "STATUS: READY\nPARAMS:\nresult: done"
        };
        Ok(reply.to_string())
    });
    let search = Recording::search("search");
    let read_file = Recording::new(
        CapabilitySpec::routine("read_file", "read a file")
            .with_parameter(ParameterSpec::required("path", "file path", ParamKind::String)),
    );
    let settings = EngineSettings { negotiation_max_rounds: 2, ..EngineSettings::default() };
    let h = harness(
        reasoning.clone(),
        negotiation,
        vec![shared(&search), shared(&read_file), finish()],
        settings,
    );

    let result = h.engine.execute(ExecutionRequest::new("persona", "find it")).await.expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    assert!(search.calls().is_empty());
    assert!(read_file.calls().is_empty());

    let calls = reasoning.calls();
    assert_eq!(
        calls[1].last(),
        Some(&Turn::user("Skipped `search`: the query is only hypothetical"))
    );
    let unsettled = calls[3].last().expect("feedback").content.clone();
    assert!(unsettled.starts_with("Could not prepare `read_file`"), "{unsettled}");
    assert!(unsettled.contains("not settled within 2 rounds"), "{unsettled}");
    assert!(unsettled.ends_with("Nothing was run."), "{unsettled}");
}

/// Capability whose handler always fails.
struct Broken {
    spec: CapabilitySpec,
}

#[async_trait]
impl Capability for Broken {
    fn spec(&self) -> &CapabilitySpec {
        &self.spec
    }

    async fn invoke(
        &self,
        _args: Arguments,
        _ctx: &mut InvocationContext<'_>,
    ) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("index offline"))
    }
}

#[tokio::test]
async fn handler_errors_become_feedback_and_the_loop_goes_on() {
    let reasoning = Arc::new(ScriptedLlm::replies(["Let me search first.", "It failed, finish."]));
    let broken = Broken {
        spec: CapabilitySpec::routine("search", "search the index")
            .with_parameter(ParameterSpec::required("query", "what to look for", ParamKind::String)),
    };
    let h = harness(reasoning.clone(), negotiator(), vec![boxed(broken), finish()], EngineSettings::default());

    let result = h.engine.execute(ExecutionRequest::new("persona", "find it")).await.expect("run");

    assert_eq!(result.value, ExecutionValue::Returned(json!("done")));
    assert_eq!(result.step_count, 2);
    let calls = reasoning.calls();
    assert_eq!(calls[1].last(), Some(&Turn::user("`search` failed: index offline")));
    let failures = h
        .audit
        .events_of_type("engine.capability")
        .into_iter()
        .filter(|event| event.metadata.get("error").is_some())
        .count();
    assert_eq!(failures, 1);
}
