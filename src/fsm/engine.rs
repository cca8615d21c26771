use super::context::Context;
use super::definition::{Discriminator, FsmDefinition, StateDef, TransitionDef};
use super::trail::{Trail, TrailRecord};
use super::FsmError;
use crate::shared::ids::{new_instance_id, StateId};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pseudo-state recorded as the target when a run is interrupted.
pub const INTERRUPTED_STATE: &str = "interrupted";

/// How a submitted run ended, as observed by `await_outcome`.
#[derive(Debug, Clone)]
pub enum AwaitOutcome {
    /// A terminal state was reached. `document` is the event that entered it.
    Completed {
        context: Context,
        trail: Trail,
        document: Value,
    },
    /// Retries or the action itself failed and no error state is declared.
    Failed {
        context: Context,
        trail: Trail,
        state: StateId,
        reason: String,
    },
    Interrupted {
        context: Context,
        trail: Trail,
    },
    TimedOut,
}

impl AwaitOutcome {
    pub fn trail(&self) -> Option<&Trail> {
        match self {
            Self::Completed { trail, .. }
            | Self::Failed { trail, .. }
            | Self::Interrupted { trail, .. } => Some(trail),
            Self::TimedOut => None,
        }
    }

    pub fn context(&self) -> Option<&Context> {
        match self {
            Self::Completed { context, .. }
            | Self::Failed { context, .. }
            | Self::Interrupted { context, .. } => Some(context),
            Self::TimedOut => None,
        }
    }

    pub fn document(&self) -> Option<&Value> {
        match self {
            Self::Completed { document, .. } => Some(document),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

struct Delivery {
    generation: u64,
    transition: TransitionDef,
    document: Value,
    context: Context,
    attempt: u32,
}

enum InboxMessage {
    Deliver(Delivery),
    Stop,
}

struct RunState {
    generation: u64,
    active: bool,
    current: Option<StateId>,
    trail: Trail,
    context: Context,
    outcome: Option<AwaitOutcome>,
}

struct Runtime {
    instance_id: String,
    definition: Arc<FsmDefinition>,
    base_context: Context,
    max_retries: u32,
    inboxes: BTreeMap<StateId, Sender<InboxMessage>>,
    run: Mutex<RunState>,
    finished: Condvar,
}

/// A started FSM: one worker thread per active state, each servicing its own
/// inbox. Runs are submitted at an entry transition and awaited.
pub struct FsmInstance {
    runtime: Arc<Runtime>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for FsmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmInstance")
            .field("instance_id", &self.runtime.instance_id)
            .field("fsm_id", &self.runtime.definition.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl FsmInstance {
    pub fn start(
        definition: impl Into<Arc<FsmDefinition>>,
        context: Context,
    ) -> Result<Self, FsmError> {
        let definition = definition.into();
        definition.validate()?;
        for state in &definition.states {
            if let Some(action) = state.action.as_deref() {
                if !context.actions.contains(action) {
                    return Err(FsmError::UnknownAction {
                        state: state.id.to_string(),
                        action: action.to_string(),
                    });
                }
            }
        }

        let instance_id = new_instance_id();
        let max_retries = definition
            .max_retries
            .unwrap_or(context.settings.max_retries);
        let mut inboxes = BTreeMap::new();
        let mut receivers = Vec::new();
        for state in definition.states.iter().filter(|s| !s.is_passive()) {
            let (sender, receiver) = mpsc::channel();
            inboxes.insert(state.id.clone(), sender);
            receivers.push((state.clone(), receiver));
        }

        let runtime = Arc::new(Runtime {
            instance_id: instance_id.clone(),
            definition: definition.clone(),
            base_context: context.clone(),
            max_retries,
            inboxes,
            run: Mutex::new(RunState {
                generation: 0,
                active: false,
                current: None,
                trail: Trail::new(),
                context,
                outcome: None,
            }),
            finished: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(receivers.len());
        for (state, receiver) in receivers {
            let runtime = runtime.clone();
            let name = format!("fsm-{}-{}", definition.id, state.id);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(runtime, state, receiver))
                .map_err(|source| FsmError::Io {
                    path: format!("worker thread for fsm `{}`", definition.id),
                    source,
                })?;
            workers.push(handle);
        }

        runtime.base_context.log.info(
            "engine.start",
            &format!(
                "fsm={} instance={} workers={} max_retries={}",
                definition.id,
                instance_id,
                workers.len(),
                max_retries
            ),
        );
        Ok(Self {
            runtime,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.runtime.instance_id
    }

    pub fn definition(&self) -> &Arc<FsmDefinition> {
        &self.runtime.definition
    }

    pub fn context(&self) -> &Context {
        &self.runtime.base_context
    }

    /// Accepts `document` at an entry transition. Rejections are synchronous;
    /// everything after the first hop is observed through `await_outcome`.
    pub fn submit(&self, document: Value) -> Result<(), FsmError> {
        self.begin(document, Map::new(), Vec::new())
    }

    /// Like [`submit`](Self::submit) but layers the caller's `values` and
    /// `feedback` onto the instance context. Everything else, the interrupt
    /// cell included, stays the instance's own.
    pub fn submit_with(&self, document: Value, caller: Context) -> Result<(), FsmError> {
        self.begin(document, caller.values, caller.feedback)
    }

    fn begin(
        &self,
        document: Value,
        values: Map<String, Value>,
        feedback: Vec<Value>,
    ) -> Result<(), FsmError> {
        if self.is_stopped() {
            return Err(FsmError::Stopped {
                instance_id: self.runtime.instance_id.clone(),
            });
        }
        if self.runtime.base_context.interrupt.is_interrupted() {
            return Err(FsmError::Interrupted {
                instance_id: self.runtime.instance_id.clone(),
            });
        }

        let mut context = self.runtime.base_context.clone();
        context.values.extend(values);
        context.feedback.extend(feedback);

        let definition = &self.runtime.definition;
        let pair = Discriminator::of(&document).ok_or(FsmError::MissingDiscriminator)?;
        let transition = definition
            .transition(&pair)
            .ok_or_else(|| FsmError::UnknownTransition {
                from: pair.from.to_string(),
                to: pair.to.to_string(),
            })?;
        if !definition.is_entry(transition) {
            return Err(FsmError::NotEntryTransition {
                from: pair.from.to_string(),
                to: pair.to.to_string(),
            });
        }
        context
            .validator
            .validate(&definition.schemas, &transition.schema, &document)
            .map_err(|violation| FsmError::Rejected {
                from: pair.from.to_string(),
                to: pair.to.to_string(),
                violation,
            })?;

        let mut run = self.runtime.lock();
        if run.active {
            return Err(FsmError::Busy {
                instance_id: self.runtime.instance_id.clone(),
            });
        }
        run.generation = run.generation.wrapping_add(1);
        run.active = true;
        run.current = Some(pair.from.clone());
        run.trail = Trail::new();
        run.outcome = None;
        run.context = context.clone();
        self.runtime.base_context.log.info(
            "engine.submit",
            &format!(
                "instance={} generation={} transition={pair}",
                self.runtime.instance_id, run.generation
            ),
        );
        let generation = run.generation;
        self.runtime
            .take_transition(&mut run, generation, transition.clone(), document, context);
        Ok(())
    }

    /// Blocks until the current run ends or `timeout` elapses.
    pub fn await_outcome(&self, timeout: Duration) -> AwaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut run = self.runtime.lock();
        loop {
            if let Some(outcome) = run.outcome.as_ref() {
                return outcome.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return AwaitOutcome::TimedOut;
            }
            run = match self.runtime.finished.wait_timeout(run, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Submits and awaits in one call.
    pub fn run(&self, document: Value, timeout: Duration) -> Result<AwaitOutcome, FsmError> {
        self.submit(document)?;
        Ok(self.await_outcome(timeout))
    }

    /// Snapshot of the trail of the current or most recent run.
    pub fn trail(&self) -> Trail {
        self.runtime.lock().trail.clone()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().active
    }

    /// Requests cancellation. Only the first call has an effect; it runs the
    /// composed cleanup and records the run as interrupted.
    pub fn interrupt(&self) -> bool {
        if !self.runtime.base_context.interrupt.interrupt() {
            return false;
        }
        let mut run = self.runtime.lock();
        self.runtime.finish_interrupted(&mut run);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Interrupts any active run, joins the workers and releases owned
    /// children and bridges. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_running() {
            self.interrupt();
        }
        for inbox in self.runtime.inboxes.values() {
            let _ = inbox.send(InboxMessage::Stop);
        }
        let workers: Vec<_> = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        self.runtime.base_context.children.stop_all();
        self.runtime.base_context.bridges.close_all();
        self.runtime.base_context.log.info(
            "engine.stop",
            &format!("instance={}", self.runtime.instance_id),
        );
    }
}

impl Drop for FsmInstance {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(runtime: Arc<Runtime>, state: StateDef, inbox: Receiver<InboxMessage>) {
    while let Ok(message) = inbox.recv() {
        match message {
            InboxMessage::Stop => break,
            InboxMessage::Deliver(delivery) => runtime.dispatch(&state, delivery),
        }
    }
}

impl Runtime {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(run: &RunState, generation: u64) -> bool {
        run.generation == generation && run.outcome.is_none()
    }

    fn dispatch(self: &Arc<Self>, state: &StateDef, delivery: Delivery) {
        let trail = {
            let mut run = self.lock();
            if !Self::is_current(&run, delivery.generation) {
                return;
            }
            if delivery.context.interrupt.is_interrupted() {
                self.finish_interrupted(&mut run);
                return;
            }
            run.trail.records().to_vec()
        };

        let Some(action) = state
            .action
            .as_deref()
            .and_then(|name| delivery.context.actions.get(name))
        else {
            let mut run = self.lock();
            let reason = format!("state `{}` has no registered action", state.id);
            self.fail_locked(&mut run, &state.id, reason, delivery.context);
            return;
        };

        let continuation = Continuation {
            inner: Some(Pending {
                runtime: self.clone(),
                state: state.id.clone(),
                generation: delivery.generation,
                transition: delivery.transition.clone(),
                document: delivery.document.clone(),
                attempt: delivery.attempt,
            }),
        };
        let call = super::action::ActionCall {
            context: delivery.context,
            definition: &self.definition,
            transition: &delivery.transition,
            state,
            trail: &trail,
            document: &delivery.document,
        };
        action.invoke(call, continuation);
    }

    /// Appends the record and hands the document to the target's inbox under
    /// the run lock, so trail order and delivery order agree.
    fn take_transition(
        &self,
        run: &mut RunState,
        generation: u64,
        transition: TransitionDef,
        document: Value,
        context: Context,
    ) {
        if !transition.omit {
            run.trail.append(TrailRecord::Success {
                from: transition.from_state().clone(),
                to: transition.to_state().clone(),
                event: document.clone(),
            });
        }
        context.log.info(
            "engine.transition",
            &format!(
                "instance={} transition={} omit={}",
                self.instance_id, transition.id, transition.omit
            ),
        );
        let target = transition.to_state().clone();
        run.context = context.clone();

        if self.definition.is_terminal(target.as_str()) {
            run.current = Some(target);
            let outcome = AwaitOutcome::Completed {
                context,
                trail: run.trail.clone(),
                document,
            };
            self.complete(run, outcome);
            return;
        }

        let Some(inbox) = self.inboxes.get(&target) else {
            let reason = format!("state `{target}` is passive but not terminal");
            self.fail_locked(run, &target, reason, context);
            return;
        };
        run.current = Some(target.clone());
        let delivery = Delivery {
            generation,
            transition,
            document,
            context: context.clone(),
            attempt: 0,
        };
        if inbox.send(InboxMessage::Deliver(delivery)).is_err() {
            let reason = format!("worker for state `{target}` has stopped");
            self.fail_locked(run, &target, reason, context);
        }
    }

    fn accept_output(&self, pending: Pending, mut context: Context, output: Value) {
        let mut run = self.lock();
        if !Self::is_current(&run, pending.generation) {
            context.log.warn(
                "engine.stale_output",
                &format!(
                    "instance={} state={} dropped output from a finished run",
                    self.instance_id, pending.state
                ),
            );
            return;
        }
        if context.interrupt.is_interrupted() {
            self.finish_interrupted(&mut run);
            return;
        }

        match self.route(&pending.state, &output, &context) {
            Ok(transition) => {
                context.feedback.clear();
                self.take_transition(&mut run, pending.generation, transition, output, context);
            }
            Err(errors) if pending.attempt < self.max_retries => {
                context.log.warn(
                    "engine.retry",
                    &format!(
                        "instance={} state={} attempt={} errors={}",
                        self.instance_id,
                        pending.state,
                        pending.attempt + 1,
                        errors.join("; ")
                    ),
                );
                context.feedback.push(json!({
                    "request": pending.document,
                    "output": output,
                    "errors": errors,
                }));
                let Some(inbox) = self.inboxes.get(&pending.state) else {
                    return;
                };
                let retry = Delivery {
                    generation: pending.generation,
                    transition: pending.transition,
                    document: pending.document,
                    context: context.clone(),
                    attempt: pending.attempt + 1,
                };
                if inbox.send(InboxMessage::Deliver(retry)).is_err() {
                    let reason = format!("worker for state `{}` has stopped", pending.state);
                    self.fail_locked(&mut run, &pending.state, reason, context);
                }
            }
            Err(errors) => {
                let failure = json!({
                    "errors": errors,
                    "attempts": pending.attempt + 1,
                });
                run.trail.append(TrailRecord::Failure {
                    from: pending.state.clone(),
                    event: output,
                    failure: failure.clone(),
                });
                let reason = format!(
                    "output of state `{}` failed validation after {} attempts: {}",
                    pending.state,
                    pending.attempt + 1,
                    errors.join("; ")
                );
                self.route_failure(&mut run, &pending.state, reason, failure, context);
            }
        }
    }

    fn fail_action(&self, pending: Pending, context: Option<Context>, reason: String) {
        let mut run = self.lock();
        if !Self::is_current(&run, pending.generation) {
            return;
        }
        let context = context.unwrap_or_else(|| run.context.clone());
        if context.interrupt.is_interrupted() {
            self.finish_interrupted(&mut run);
            return;
        }
        let failure = json!({"error": reason});
        run.trail.append(TrailRecord::Failure {
            from: pending.state.clone(),
            event: pending.document,
            failure: failure.clone(),
        });
        self.route_failure(&mut run, &pending.state, reason, failure, context);
    }

    /// Picks the transition an action's output declares and validates it.
    /// Returns the accumulated errors otherwise.
    fn route(
        &self,
        state: &StateId,
        output: &Value,
        context: &Context,
    ) -> Result<TransitionDef, Vec<String>> {
        let allowed: Vec<String> = self
            .definition
            .outgoing(state.as_str())
            .map(|t| t.id.to_string())
            .collect();
        let Some(pair) = Discriminator::of(output) else {
            return Err(vec![format!(
                "output must declare `id: [from, to]`; allowed: {}",
                allowed.join(", ")
            )]);
        };
        if &pair.from != state {
            return Err(vec![format!(
                "output declares {pair} but the current state is `{state}`; allowed: {}",
                allowed.join(", ")
            )]);
        }
        let Some(transition) = self.definition.transition(&pair) else {
            return Err(vec![format!(
                "transition {pair} is not declared; allowed: {}",
                allowed.join(", ")
            )]);
        };
        context
            .validator
            .validate(&self.definition.schemas, &transition.schema, output)
            .map_err(|violation| violation.errors)?;
        Ok(transition.clone())
    }

    fn route_failure(
        &self,
        run: &mut RunState,
        state: &StateId,
        reason: String,
        failure: Value,
        context: Context,
    ) {
        context.log.error(
            "engine.failure",
            &format!("instance={} state={state} reason={reason}", self.instance_id),
        );
        match self.definition.error_state.clone() {
            Some(error_state) => {
                let document = json!({
                    "id": [state.as_str(), error_state.as_str()],
                    "failure": failure,
                });
                // A declared edge into the error state guards the failure
                // document like any other transition; otherwise the edge is
                // implicit and unguarded.
                let pair = Discriminator::new(state.clone(), error_state.clone());
                let declared = self.definition.transition(&pair);
                if let Some(transition) = declared {
                    if let Err(violation) =
                        context
                            .validator
                            .validate(&self.definition.schemas, &transition.schema, &document)
                    {
                        let reason =
                            format!("{reason}; failure document rejected by {pair}: {violation}");
                        self.fail_locked(run, state, reason, context);
                        return;
                    }
                }
                if !declared.is_some_and(|transition| transition.omit) {
                    run.trail.append(TrailRecord::Success {
                        from: state.clone(),
                        to: error_state.clone(),
                        event: document.clone(),
                    });
                }
                run.current = Some(error_state);
                run.context = context.clone();
                let outcome = AwaitOutcome::Completed {
                    context,
                    trail: run.trail.clone(),
                    document,
                };
                self.complete(run, outcome);
            }
            None => self.fail_locked(run, state, reason, context),
        }
    }

    fn fail_locked(&self, run: &mut RunState, state: &StateId, reason: String, context: Context) {
        run.context = context.clone();
        let outcome = AwaitOutcome::Failed {
            context,
            trail: run.trail.clone(),
            state: state.clone(),
            reason,
        };
        self.complete(run, outcome);
    }

    fn finish_interrupted(&self, run: &mut RunState) {
        if !run.active || run.outcome.is_some() {
            return;
        }
        let from = run
            .current
            .clone()
            .unwrap_or_else(|| StateId::from_static(INTERRUPTED_STATE));
        let to = StateId::from_static(INTERRUPTED_STATE);
        run.trail.append(TrailRecord::Success {
            from: from.clone(),
            to: to.clone(),
            event: json!({
                "id": [from.as_str(), to.as_str()],
                "reason": "interrupted",
            }),
        });
        run.context.log.warn(
            "engine.interrupted",
            &format!("instance={} state={from}", self.instance_id),
        );
        let outcome = AwaitOutcome::Interrupted {
            context: run.context.clone(),
            trail: run.trail.clone(),
        };
        run.current = Some(to);
        self.complete(run, outcome);
    }

    fn complete(&self, run: &mut RunState, outcome: AwaitOutcome) {
        run.outcome = Some(outcome);
        run.active = false;
        self.finished.notify_all();
    }
}

struct Pending {
    runtime: Arc<Runtime>,
    state: StateId,
    generation: u64,
    transition: TransitionDef,
    document: Value,
    attempt: u32,
}

/// Handed to an action with each invocation. Exactly one of `resume` or
/// `fail` takes effect; dropping it unused fails the run.
pub struct Continuation {
    inner: Option<Pending>,
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Continuation");
        if let Some(pending) = self.inner.as_ref() {
            debug
                .field("state", &pending.state)
                .field("attempt", &pending.attempt);
        }
        debug.finish()
    }
}

impl Continuation {
    /// Zero-based retry count for this invocation.
    pub fn attempt(&self) -> u32 {
        self.inner.as_ref().map_or(0, |pending| pending.attempt)
    }

    /// Routes `output` by its discriminator. Invalid output is retried with
    /// feedback until the retry bound is spent.
    pub fn resume(mut self, context: Context, output: Value) {
        if let Some(pending) = self.inner.take() {
            let runtime = pending.runtime.clone();
            runtime.accept_output(pending, context, output);
        }
    }

    /// Ends the run with an action failure. Failures are not retried.
    pub fn fail(mut self, context: Context, reason: impl Into<String>) {
        if let Some(pending) = self.inner.take() {
            let runtime = pending.runtime.clone();
            runtime.fail_action(pending, Some(context), reason.into());
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if let Some(pending) = self.inner.take() {
            let runtime = pending.runtime.clone();
            let reason = format!(
                "action for state `{}` returned without resuming",
                pending.state
            );
            runtime.fail_action(pending, None, reason);
        }
    }
}
