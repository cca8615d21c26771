use fsmrig::config::EngineSettings;
use fsmrig::fsm::{
    action_fn, replay, ActionCall, ActionRegistry, AwaitOutcome, Context, Continuation,
    FsmDefinition, FsmError, FsmInstance, Trail, TrailRecord, INTERRUPTED_STATE,
};
use fsmrig::model::{ModelClient, ModelError, PromptMessage, PromptRole};
use fsmrig::schema::BasicSchemaValidator;
use fsmrig::shared::logging::engine_log_path;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

struct ScriptedModel {
    replies: Mutex<VecDeque<Result<Value, ModelError>>>,
    seen: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<Value, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().expect("seen").len()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, messages: &[PromptMessage]) -> Result<Value, ModelError> {
        self.seen.lock().expect("seen").push(messages.to_vec());
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ModelError::Network {
                    endpoint: "scripted".to_string(),
                    reason: "script exhausted".to_string(),
                })
            })
    }
}

fn malformed(raw: &str) -> Result<Value, ModelError> {
    Err(ModelError::Malformed {
        raw: raw.to_string(),
        reason: "not json".to_string(),
    })
}

fn definition(raw: Value) -> FsmDefinition {
    FsmDefinition::from_value(raw, &BasicSchemaValidator).expect("definition")
}

fn answer_fsm(extra: Value) -> FsmDefinition {
    let mut raw = json!({
        "id": "answer",
        "states": [{"id": "start"}, {"id": "llm", "action": "llm"}, {"id": "end"}, {"id": "error"}],
        "transitions": [
            {"id": ["start", "llm"], "schema": {"required": ["question"]}},
            {
                "id": ["llm", "end"],
                "schema": {"required": ["answer"], "properties": {"answer": {"type": "integer"}}}
            }
        ]
    });
    if let (Some(target), Some(source)) = (raw.as_object_mut(), extra.as_object()) {
        target.extend(source.clone());
    }
    definition(raw)
}

fn pairs(outcome: &AwaitOutcome) -> Vec<(String, String)> {
    outcome
        .trail()
        .expect("trail")
        .records()
        .iter()
        .filter_map(|record| match record {
            TrailRecord::Success { from, to, .. } => Some((from.to_string(), to.to_string())),
            TrailRecord::Failure { .. } => None,
        })
        .collect()
}

#[test]
fn echo_fsm_records_single_entry_transition() {
    let echo = definition(json!({
        "id": "echo",
        "states": [{"id": "start"}, {"id": "mc"}],
        "transitions": [{
            "id": ["start", "mc"],
            "schema": {"required": ["document"], "properties": {"document": {"const": "x"}}}
        }]
    }));
    let instance = FsmInstance::start(
        echo,
        Context::new(ActionRegistry::new(), EngineSettings::default()),
    )
    .expect("start");

    let outcome = instance
        .run(json!({"id": ["start", "mc"], "document": "x"}), WAIT)
        .expect("run");
    assert!(outcome.is_completed());
    assert_eq!(
        outcome.trail().expect("trail").records(),
        &[TrailRecord::Success {
            from: "start".to_string().try_into().expect("id"),
            to: "mc".to_string().try_into().expect("id"),
            event: json!({"id": ["start", "mc"], "document": "x"}),
        }]
    );

    let err = instance
        .submit(json!({"id": ["start", "mc"], "document": "y"}))
        .expect_err("schema rejects");
    assert!(matches!(err, FsmError::Rejected { .. }));
}

#[test]
fn model_output_is_retried_with_feedback_until_valid() {
    let model = ScriptedModel::new(vec![
        malformed("I think the answer is forty-two"),
        Ok(json!({"id": ["llm", "end"], "answer": "42"})),
        Ok(json!({"id": ["llm", "end"], "answer": 42})),
    ]);
    let context = Context::new(ActionRegistry::with_builtins(), EngineSettings::default())
        .with_model(model.clone());
    let instance = FsmInstance::start(answer_fsm(json!({})), context).expect("start");

    let outcome = instance
        .run(json!({"id": ["start", "llm"], "question": "6 * 7?"}), WAIT)
        .expect("run");
    assert!(outcome.is_completed(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.document().expect("document")["answer"], 42);
    assert_eq!(
        pairs(&outcome),
        vec![
            ("start".to_string(), "llm".to_string()),
            ("llm".to_string(), "end".to_string())
        ]
    );
    assert_eq!(model.calls(), 3);

    let seen = model.seen.lock().expect("seen");
    let last_prompt = &seen[2];
    let rejected: Vec<&PromptMessage> = last_prompt
        .iter()
        .filter(|m| m.role == PromptRole::User && m.content.contains("rejected"))
        .collect();
    assert_eq!(rejected.len(), 2);
    assert!(last_prompt
        .iter()
        .any(|m| m.role == PromptRole::Assistant && m.content == "I think the answer is forty-two"));
    assert!(outcome.context().expect("context").feedback.is_empty());
}

#[test]
fn retries_stop_at_the_bound_and_record_a_failure() {
    let model = ScriptedModel::new(vec![
        malformed("a"),
        malformed("b"),
        malformed("c"),
        malformed("d"),
    ]);
    let context = Context::new(ActionRegistry::with_builtins(), EngineSettings::default())
        .with_model(model.clone());
    let instance =
        FsmInstance::start(answer_fsm(json!({"max_retries": 2})), context).expect("start");

    let outcome = instance
        .run(json!({"id": ["start", "llm"], "question": "?"}), WAIT)
        .expect("run");
    match &outcome {
        AwaitOutcome::Failed { state, trail, .. } => {
            assert_eq!(state, "llm");
            let last = trail.last().expect("failure record");
            assert!(last.is_failure());
            assert_eq!(last.event(), &json!("c"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(model.calls(), 3);
}

#[test]
fn zero_retries_fails_on_first_invalid_output() {
    let model = ScriptedModel::new(vec![malformed("nope"), Ok(json!({"id": ["llm", "end"], "answer": 1}))]);
    let mut settings = EngineSettings::default();
    settings.max_retries = 0;
    let context =
        Context::new(ActionRegistry::with_builtins(), settings).with_model(model.clone());
    let instance = FsmInstance::start(answer_fsm(json!({})), context).expect("start");

    let outcome = instance
        .run(json!({"id": ["start", "llm"], "question": "?"}), WAIT)
        .expect("run");
    assert!(matches!(outcome, AwaitOutcome::Failed { .. }));
    assert_eq!(model.calls(), 1);
}

#[test]
fn exhausted_retries_route_to_error_state_when_declared() {
    let model = ScriptedModel::new(vec![malformed("x"), malformed("y")]);
    let raw = json!({
        "max_retries": 1,
        "error_state": "error",
        "transitions": [
            {"id": ["start", "llm"]},
            {"id": ["llm", "end"], "schema": {"required": ["answer"]}},
            {"id": ["llm", "error"]}
        ]
    });
    let context = Context::new(ActionRegistry::with_builtins(), EngineSettings::default())
        .with_model(model);
    let instance = FsmInstance::start(answer_fsm(raw), context).expect("start");

    let outcome = instance
        .run(json!({"id": ["start", "llm"]}), WAIT)
        .expect("run");
    assert!(outcome.is_completed(), "unexpected outcome: {outcome:?}");
    let document = outcome.document().expect("document");
    assert_eq!(document["id"], json!(["llm", "error"]));
    assert_eq!(document["failure"]["attempts"], 2);
    let trail = outcome.trail().expect("trail");
    assert!(trail.records()[1].is_failure());
    assert_eq!(pairs(&outcome).last().expect("last").1, "error");
}

#[test]
fn network_errors_fail_without_retry() {
    let model = ScriptedModel::new(vec![]);
    let context = Context::new(ActionRegistry::with_builtins(), EngineSettings::default())
        .with_model(model.clone());
    let instance = FsmInstance::start(answer_fsm(json!({})), context).expect("start");
    let outcome = instance
        .run(json!({"id": ["start", "llm"]}), WAIT)
        .expect("run");
    match outcome {
        AwaitOutcome::Failed { reason, .. } => assert!(reason.contains("script exhausted")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(model.calls(), 1);
}

#[test]
fn omitted_transitions_run_but_stay_out_of_the_trail() {
    let raw = json!({
        "id": "counter",
        "states": [{"id": "start"}, {"id": "count", "action": "count"}, {"id": "end"}],
        "transitions": [
            {"id": ["start", "count"]},
            {"id": ["count", "count"], "omit": true},
            {"id": ["count", "end"], "schema": {"required": ["n"]}}
        ]
    });
    let mut actions = ActionRegistry::new();
    actions.register(
        "count",
        action_fn(|call: ActionCall<'_>, continuation: Continuation| {
            let n = call.document.get("n").and_then(Value::as_u64).unwrap_or(0) + 1;
            let output = if n < 4 {
                json!({"id": ["count", "count"], "n": n})
            } else {
                json!({"id": ["count", "end"], "n": n})
            };
            continuation.resume(call.context, output);
        }),
    );
    let instance = FsmInstance::start(
        definition(raw),
        Context::new(actions, EngineSettings::default()),
    )
    .expect("start");

    let outcome = instance
        .run(json!({"id": ["start", "count"]}), WAIT)
        .expect("run");
    assert_eq!(outcome.document().expect("document")["n"], 4);
    assert_eq!(
        pairs(&outcome),
        vec![
            ("start".to_string(), "count".to_string()),
            ("count".to_string(), "end".to_string())
        ]
    );

    let first = instance.trail();
    let again = instance
        .run(json!({"id": ["start", "count"], "n": 1}), WAIT)
        .expect("second run");
    assert_eq!(first.len(), 2);
    assert_eq!(again.trail().expect("trail").len(), 2);
}

#[test]
fn interrupt_is_idempotent_and_runs_cleanup_once() {
    let raw = json!({
        "id": "blocking",
        "states": [{"id": "start"}, {"id": "work", "action": "block"}, {"id": "end"}],
        "transitions": [{"id": ["start", "work"]}, {"id": ["work", "end"]}]
    });
    let cleanups = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let counter = cleanups.clone();
    let mut actions = ActionRegistry::new();
    actions.register(
        "block",
        action_fn(move |call: ActionCall<'_>, continuation: Continuation| {
            let (wake_tx, wake_rx) = mpsc::channel::<()>();
            let counter = counter.clone();
            let composed = call.context.interrupt.compose(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = wake_tx.send(());
            });
            if composed.is_err() {
                continuation.resume(call.context, Value::Null);
                return;
            }
            let _ = started_tx.lock().expect("started").send(());
            let _ = wake_rx.recv();
            continuation.resume(call.context, json!({"id": ["work", "end"]}));
        }),
    );
    let instance = FsmInstance::start(
        definition(raw),
        Context::new(actions, EngineSettings::default()),
    )
    .expect("start");

    instance.submit(json!({"id": ["start", "work"]})).expect("submit");
    started_rx.recv_timeout(WAIT).expect("action started");
    assert!(instance.interrupt());
    assert!(!instance.interrupt());

    let outcome = instance.await_outcome(WAIT);
    assert!(matches!(outcome, AwaitOutcome::Interrupted { .. }));
    let trail = outcome.trail().expect("trail");
    assert_eq!(trail.len(), 2);
    match trail.last().expect("last") {
        TrailRecord::Success { from, to, .. } => {
            assert_eq!(from, "work");
            assert_eq!(to, INTERRUPTED_STATE);
        }
        other => panic!("unexpected record: {other:?}"),
    }
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    let err = instance
        .submit(json!({"id": ["start", "work"]}))
        .expect_err("interrupted instance");
    assert!(matches!(err, FsmError::Interrupted { .. }));
}

#[test]
fn await_outcome_times_out_while_a_run_is_in_flight() {
    let raw = json!({
        "id": "slow",
        "states": [{"id": "start"}, {"id": "work", "action": "hold"}, {"id": "end"}],
        "transitions": [{"id": ["start", "work"]}, {"id": ["work", "end"]}]
    });
    let held: Arc<Mutex<Vec<Continuation>>> = Arc::new(Mutex::new(Vec::new()));
    let holder = held.clone();
    let mut actions = ActionRegistry::new();
    actions.register(
        "hold",
        action_fn(move |_call: ActionCall<'_>, continuation: Continuation| {
            holder.lock().expect("held").push(continuation);
        }),
    );
    let instance = FsmInstance::start(
        definition(raw),
        Context::new(actions, EngineSettings::default()),
    )
    .expect("start");

    instance.submit(json!({"id": ["start", "work"]})).expect("submit");
    let outcome = instance.await_outcome(Duration::from_millis(100));
    assert!(matches!(outcome, AwaitOutcome::TimedOut));
    assert!(matches!(
        instance.submit(json!({"id": ["start", "work"]})),
        Err(FsmError::Busy { .. })
    ));

    let continuation = {
        let mut guard = held.lock().expect("held");
        loop {
            if let Some(continuation) = guard.pop() {
                break continuation;
            }
            drop(guard);
            std::thread::sleep(Duration::from_millis(10));
            guard = held.lock().expect("held");
        }
    };
    continuation.resume(instance.context().clone(), json!({"id": ["work", "end"]}));
    assert!(instance.await_outcome(WAIT).is_completed());
}

#[test]
fn engine_decisions_are_logged_as_json_lines() {
    let log_root = tempfile::tempdir().expect("tempdir");
    let mut settings = EngineSettings::default();
    settings.log_root = Some(log_root.path().to_path_buf());
    let model = ScriptedModel::new(vec![
        malformed("?"),
        Ok(json!({"id": ["llm", "end"], "answer": 1})),
    ]);
    let context = Context::new(ActionRegistry::with_builtins(), settings).with_model(model);
    let instance = FsmInstance::start(answer_fsm(json!({})), context).expect("start");
    let outcome = instance
        .run(json!({"id": ["start", "llm"]}), WAIT)
        .expect("run");
    assert!(outcome.is_completed());

    let raw = fs::read_to_string(engine_log_path(log_root.path())).expect("read log");
    let events: Vec<String> = raw
        .lines()
        .map(|line| {
            let value: Value = serde_json::from_str(line).expect("json line");
            value["event"].as_str().expect("event").to_string()
        })
        .collect();
    for expected in ["engine.start", "engine.submit", "engine.transition", "engine.retry"] {
        assert!(
            events.iter().any(|event| event == expected),
            "missing {expected} in {events:?}"
        );
    }
}

fn blocking_definition() -> FsmDefinition {
    definition(json!({
        "id": "blocking",
        "states": [{"id": "start"}, {"id": "work", "action": "block"}, {"id": "end"}],
        "transitions": [{"id": ["start", "work"]}, {"id": ["work", "end"]}]
    }))
}

/// `block` composes a cleanup that wakes it, reports the run values it saw
/// and waits for that wake-up.
fn blocking_actions(cleanups: Arc<AtomicUsize>, started: mpsc::Sender<Value>) -> ActionRegistry {
    let started = Mutex::new(started);
    let mut actions = ActionRegistry::new();
    actions.register(
        "block",
        action_fn(move |call: ActionCall<'_>, continuation: Continuation| {
            let (wake_tx, wake_rx) = mpsc::channel::<()>();
            let counter = cleanups.clone();
            let composed = call.context.interrupt.compose(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = wake_tx.send(());
            });
            if composed.is_err() {
                continuation.resume(call.context, Value::Null);
                return;
            }
            let seen = Value::Object(call.context.values.clone());
            let _ = started.lock().expect("started").send(seen);
            let _ = wake_rx.recv_timeout(WAIT);
            continuation.resume(call.context, json!({"id": ["work", "end"]}));
        }),
    );
    actions
}

fn completed_trail(outcome: &AwaitOutcome) -> Trail {
    outcome.trail().expect("trail").clone()
}

#[test]
fn trails_through_omitted_hops_replay_against_their_definition() {
    let hops = definition(json!({
        "id": "hops",
        "states": [
            {"id": "start"},
            {"id": "a", "action": "hop"},
            {"id": "b", "action": "hop"},
            {"id": "end"}
        ],
        "transitions": [
            {"id": ["start", "a"]},
            {"id": ["a", "b"], "omit": true},
            {"id": ["b", "end"], "schema": {"required": ["done"]}}
        ]
    }));
    let mut actions = ActionRegistry::new();
    actions.register(
        "hop",
        action_fn(|call: ActionCall<'_>, continuation: Continuation| {
            let output = if call.state.id == "a" {
                json!({"id": ["a", "b"]})
            } else {
                json!({"id": ["b", "end"], "done": true})
            };
            continuation.resume(call.context, output);
        }),
    );
    let instance = FsmInstance::start(
        hops.clone(),
        Context::new(actions, EngineSettings::default()),
    )
    .expect("start");

    let outcome = instance.run(json!({"id": ["start", "a"]}), WAIT).expect("run");
    assert!(outcome.is_completed(), "unexpected outcome: {outcome:?}");
    assert_eq!(
        pairs(&outcome),
        vec![
            ("start".to_string(), "a".to_string()),
            ("b".to_string(), "end".to_string())
        ]
    );
    replay(&hops, &BasicSchemaValidator, &completed_trail(&outcome)).expect("replay");
}

#[test]
fn interrupted_trails_replay_and_end_at_the_interrupt() {
    let blocking = blocking_definition();
    let (started_tx, started_rx) = mpsc::channel();
    let actions = blocking_actions(Arc::new(AtomicUsize::new(0)), started_tx);
    let instance = FsmInstance::start(
        blocking.clone(),
        Context::new(actions, EngineSettings::default()),
    )
    .expect("start");

    instance.submit(json!({"id": ["start", "work"]})).expect("submit");
    started_rx.recv_timeout(WAIT).expect("action started");
    assert!(instance.interrupt());
    let outcome = instance.await_outcome(WAIT);
    assert!(matches!(outcome, AwaitOutcome::Interrupted { .. }));

    let mut trail = completed_trail(&outcome);
    replay(&blocking, &BasicSchemaValidator, &trail).expect("replay");

    trail.append(TrailRecord::Success {
        from: "work".to_string().try_into().expect("id"),
        to: "end".to_string().try_into().expect("id"),
        event: json!({"id": ["work", "end"]}),
    });
    let err = replay(&blocking, &BasicSchemaValidator, &trail).expect_err("after interrupt");
    assert!(matches!(err, FsmError::Replay { index: 2, .. }));
}

fn failing_fsm(extra_transitions: Vec<Value>) -> FsmDefinition {
    let mut transitions = vec![json!({"id": ["start", "w"]}), json!({"id": ["w", "end"]})];
    transitions.extend(extra_transitions);
    definition(json!({
        "id": "failing",
        "error_state": "error",
        "states": [{"id": "start"}, {"id": "w", "action": "explode"}, {"id": "end"}, {"id": "error"}],
        "transitions": transitions
    }))
}

fn exploding_context() -> Context {
    let mut actions = ActionRegistry::new();
    actions.register(
        "explode",
        action_fn(|call: ActionCall<'_>, continuation: Continuation| {
            continuation.fail(call.context, "boom");
        }),
    );
    Context::new(actions, EngineSettings::default())
}

#[test]
fn error_state_trails_replay_against_their_definition() {
    let failing = failing_fsm(Vec::new());
    let instance = FsmInstance::start(failing.clone(), exploding_context()).expect("start");
    let outcome = instance.run(json!({"id": ["start", "w"]}), WAIT).expect("run");

    assert!(outcome.is_completed(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.document().expect("document")["failure"]["error"], "boom");
    assert_eq!(pairs(&outcome).last().expect("last").1, "error");
    replay(&failing, &BasicSchemaValidator, &completed_trail(&outcome)).expect("replay");
}

#[test]
fn declared_error_transitions_guard_the_failure_document() {
    let guarded = failing_fsm(vec![json!({
        "id": ["w", "error"],
        "schema": {"required": ["failure"], "properties": {"failure": {"required": ["code"]}}}
    })]);
    let instance = FsmInstance::start(guarded, exploding_context()).expect("start");
    match instance.run(json!({"id": ["start", "w"]}), WAIT).expect("run") {
        AwaitOutcome::Failed { state, reason, trail, .. } => {
            assert_eq!(state, "w");
            assert!(reason.contains("failure document rejected by [w, error]"), "{reason}");
            assert!(trail.last().expect("failure").is_failure());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let quiet = failing_fsm(vec![json!({"id": ["w", "error"], "omit": true})]);
    let instance = FsmInstance::start(quiet.clone(), exploding_context()).expect("start");
    let outcome = instance.run(json!({"id": ["start", "w"]}), WAIT).expect("run");
    assert!(outcome.is_completed(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.document().expect("document")["id"], json!(["w", "error"]));
    assert_eq!(pairs(&outcome), vec![("start".to_string(), "w".to_string())]);
    replay(&quiet, &BasicSchemaValidator, &completed_trail(&outcome)).expect("replay");
}

#[test]
fn submit_with_layers_caller_values_but_keeps_the_instance_interrupt() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel();
    let actions = blocking_actions(cleanups.clone(), started_tx);
    let instance = FsmInstance::start(
        blocking_definition(),
        Context::new(actions, EngineSettings::default()),
    )
    .expect("start");

    let mut caller = Context::new(ActionRegistry::new(), EngineSettings::default());
    caller
        .values
        .insert("ticket".to_string(), json!("T-7"));
    instance
        .submit_with(json!({"id": ["start", "work"]}), caller.clone())
        .expect("submit");
    let seen = started_rx.recv_timeout(WAIT).expect("action started");
    assert_eq!(seen["ticket"], "T-7");

    assert!(instance.interrupt());
    let outcome = instance.await_outcome(WAIT);
    assert!(matches!(outcome, AwaitOutcome::Interrupted { .. }));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(!caller.interrupt.is_interrupted());
}
