use crate::config::{DispatchMode, OrchestratorConfig};
use crate::planner::{DirectPlanner, PlanStep, Planner};
use crate::tracker::{CancelTarget, InvocationTracker, QueueEvent};
use larder_agents::{AgentContext, AgentInstance, AgentOverrides, AgentRegistry};
use larder_core::wire::check_payload;
use larder_core::{
    AgentInvocation, Envelope, ErrorDescriptor, ErrorKind, InvocationStatus, LarderError,
    LarderResult, Payload, SessionBus,
};
use larder_queue::TaskQueueAdapter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Invocation that ran the step.
    pub invocation_id: Uuid,
    /// Agent name as planned.
    pub agent: String,
    /// Terminal status.
    pub status: InvocationStatus,
    /// Output when the step succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Payload>,
    /// Error when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    /// Whether a failure could be skipped.
    pub best_effort: bool,
}

impl StepOutcome {
    fn from_invocation(invocation: &AgentInvocation, best_effort: bool) -> Self {
        Self {
            invocation_id: invocation.id,
            agent: invocation.agent.clone(),
            status: invocation.status,
            output: invocation.result.clone(),
            error: invocation.error.clone(),
            best_effort,
        }
    }

    /// Whether the step succeeded.
    pub fn succeeded(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }

    fn to_value(&self) -> Value {
        let mut step = json!({
            "invocation_id": self.invocation_id.to_string(),
            "agent": self.agent,
            "status": self.status.as_str(),
            "best_effort": self.best_effort,
        });
        if let Value::Object(map) = &mut step {
            if let Some(output) = &self.output {
                map.insert("output".into(), Value::Object(output.clone()));
            }
            if let Some(error) = &self.error {
                map.insert(
                    "error".into(),
                    json!({ "kind": error.kind, "message": error.message }),
                );
            }
        }
        step
    }
}

/// Aggregated outcome of one query.
///
/// `output` carries `final` (the last successful step output, absent when
/// no step succeeded) and `steps` (every executed step in order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    /// Session the query ran for.
    pub session_id: String,
    /// Terminal status.
    pub status: InvocationStatus,
    /// `final` and `steps`.
    pub output: Payload,
    /// Error when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    /// Executed steps in order.
    pub steps: Vec<StepOutcome>,
}

impl OrchestrationResult {
    fn from_steps(session_id: &str, steps: Vec<StepOutcome>) -> Self {
        let blocking = steps.iter().find(|s| !s.succeeded() && !s.best_effort);
        let (status, error) = match blocking {
            Some(step) => (step.status, step.error.clone()),
            None => (InvocationStatus::Succeeded, None),
        };

        let mut output = Payload::new();
        if let Some(last) = steps.iter().rev().find_map(|s| s.output.as_ref()) {
            output.insert("final".into(), Value::Object(last.clone()));
        }
        output.insert(
            "steps".into(),
            Value::Array(steps.iter().map(StepOutcome::to_value).collect()),
        );

        Self {
            session_id: session_id.to_string(),
            status,
            output,
            error,
            steps,
        }
    }

    /// The session was closed while the plan ran.
    fn abandoned(mut self) -> Self {
        if self.error.is_none() {
            self.status = InvocationStatus::Failed;
            self.error = Some(ErrorDescriptor::new(
                ErrorKind::Cancelled,
                format!("session {} was closed", self.session_id),
            ));
        }
        self
    }

    fn planning_failed(session_id: &str, error: ErrorDescriptor) -> Self {
        let mut output = Payload::new();
        output.insert("steps".into(), Value::Array(Vec::new()));
        Self {
            session_id: session_id.to_string(),
            status: InvocationStatus::Failed,
            output,
            error: Some(error),
            steps: Vec::new(),
        }
    }

    /// Whether the query succeeded.
    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }

    /// The `final` output, if any step succeeded.
    pub fn final_output(&self) -> Option<&Payload> {
        self.output.get("final").and_then(Value::as_object)
    }
}

/// Terminal invocation counts since startup, plus what is still running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationStats {
    /// Invocations that succeeded.
    pub succeeded: u64,
    /// Invocations that failed, other than cancellations.
    pub failed: u64,
    /// Invocations that timed out.
    pub timed_out: u64,
    /// Invocations cancelled.
    pub cancelled: u64,
    /// Invocations still running.
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, invocation: &AgentInvocation) {
        let counter = match invocation.status {
            InvocationStatus::Succeeded => &self.succeeded,
            InvocationStatus::TimedOut => &self.timed_out,
            _ if invocation
                .error
                .as_ref()
                .is_some_and(|e| e.error_kind() == ErrorKind::Cancelled) =>
            {
                &self.cancelled
            }
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum Dispatch {
    Inline(AgentInstance),
    Queued(Arc<TaskQueueAdapter>, Duration),
}

/// Turns queries into agent invocations and streams their lifecycle to the
/// query's session.
///
/// Every invocation emits `status: queued`, then `status: running` once it
/// starts, then exactly one `result` or `error`. Short agents run inline on
/// their own task; long-running agents go through the task queue when one is
/// attached. Events reach clients only through the [`SessionBus`].
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    bus: Arc<dyn SessionBus>,
    queue: Option<Arc<TaskQueueAdapter>>,
    direct: Option<DirectPlanner>,
    planner: Option<Arc<dyn Planner>>,
    config: OrchestratorConfig,
    tracker: Arc<InvocationTracker>,
    counters: Counters,
}

impl Orchestrator {
    /// Direct mode needs a default agent, either from `config` or from the
    /// registry.
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<dyn SessionBus>,
        config: OrchestratorConfig,
    ) -> LarderResult<Self> {
        let default = match &config.default_agent {
            Some(name) => Some(registry.resolve(name).map_err(|_| {
                LarderError::Configuration(format!("default agent '{name}' is not registered"))
            })?),
            None => registry.default_agent(),
        };
        if config.mode == DispatchMode::Direct && default.is_none() {
            return Err(LarderError::Configuration(
                "direct dispatch needs a default agent".into(),
            ));
        }

        Ok(Self {
            registry,
            bus,
            queue: None,
            direct: default.map(|d| DirectPlanner::new(d.name.clone())),
            planner: None,
            config,
            tracker: Arc::new(InvocationTracker::new()),
            counters: Counters::default(),
        })
    }

    /// Send long-running agents through `queue`.
    pub fn with_queue(mut self, queue: Arc<TaskQueueAdapter>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Planner used in [`DispatchMode::Planner`].
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Dispatch settings.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Attached task queue.
    pub fn queue(&self) -> Option<&Arc<TaskQueueAdapter>> {
        self.queue.as_ref()
    }

    /// In-flight invocations.
    pub fn tracker(&self) -> &InvocationTracker {
        &self.tracker
    }

    /// Run `query` for `session_id` to completion.
    ///
    /// Steps run in plan order. A failed step ends the plan unless it is
    /// best-effort. A planner failure emits one `error` event under a fresh
    /// planning id. Only a missing session id is returned as `Err`.
    pub async fn process_query(&self, query: &str, session_id: &str) -> LarderResult<OrchestrationResult> {
        if session_id.trim().is_empty() {
            return Err(LarderError::InvalidMessage("query has no session id".into()));
        }
        let run = self.tracker.begin_run(session_id);
        if self.bus.ensure_session(session_id) {
            debug!(session_id = %session_id, "Provisioned session for query");
        }

        let start = Instant::now();
        info!(session_id = %session_id, mode = ?self.config.mode, "Orchestration started");

        let steps = match self.plan(query, session_id).await {
            Ok(steps) => steps,
            Err(e) => {
                let planning_id = Uuid::new_v4();
                let descriptor = e.to_descriptor();
                warn!(
                    session_id = %session_id,
                    planning_id = %planning_id,
                    error = %e,
                    "Planning failed"
                );
                self.emit(session_id, Envelope::error(session_id, Some(planning_id), &descriptor))
                    .await;
                return Ok(OrchestrationResult::planning_failed(session_id, descriptor));
            }
        };
        info!(session_id = %session_id, steps = steps.len(), "Plan ready");

        let mut outcomes = Vec::with_capacity(steps.len());
        let mut previous: Option<Payload> = None;
        for (index, step) in steps.iter().enumerate() {
            if self.tracker.run_cancelled(run.id()) {
                info!(
                    session_id = %session_id,
                    skipped = steps.len() - index,
                    "Session closed, abandoning plan"
                );
                break;
            }
            let outcome = self
                .run_step(run.id(), query, session_id, step, previous.as_ref())
                .await;
            if let Some(output) = &outcome.output {
                previous = Some(output.clone());
            }
            let stop = !outcome.succeeded() && !step.best_effort;
            outcomes.push(outcome);
            if stop {
                info!(
                    session_id = %session_id,
                    step = index,
                    skipped = steps.len() - index - 1,
                    "Step failed, stopping plan"
                );
                break;
            }
        }

        let mut result = OrchestrationResult::from_steps(session_id, outcomes);
        if self.tracker.run_cancelled(run.id()) {
            result = result.abandoned();
        }
        info!(
            session_id = %session_id,
            status = %result.status,
            steps = result.steps.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Orchestration complete"
        );
        Ok(result)
    }

    /// Hand a queued invocation's terminal record to the step waiting on
    /// it. Returns `false` (and logs) when nothing is waiting.
    pub fn notify_terminal(&self, invocation: AgentInvocation) -> bool {
        self.tracker.notify_terminal(invocation)
    }

    /// Cancel everything in flight for `session_id`. Inline invocations are
    /// failed as cancelled right away; queued ones are cancelled through the
    /// queue. Returns how many were signalled.
    pub async fn cancel_session(&self, session_id: &str) -> usize {
        let targets = self.tracker.cancel_targets(session_id);
        let mut cancelled = 0;
        for (id, target) in targets {
            match target {
                CancelTarget::Inline(signal) => {
                    if signal.send(()).is_ok() {
                        cancelled += 1;
                    }
                }
                CancelTarget::Queued => {
                    let Some(queue) = &self.queue else { continue };
                    match queue.cancel(id).await {
                        Ok(true) => cancelled += 1,
                        Ok(false) => debug!(invocation_id = %id, "Queued job already finished"),
                        Err(e) => warn!(invocation_id = %id, error = %e, "Failed to cancel queued job"),
                    }
                }
            }
        }
        if cancelled > 0 {
            info!(session_id = %session_id, cancelled, "Cancelled in-flight invocations");
        }
        cancelled
    }

    /// Lifetime counters.
    pub fn stats(&self) -> InvocationStats {
        InvocationStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            in_flight: self.tracker.len(),
        }
    }

    async fn plan(&self, query: &str, session_id: &str) -> LarderResult<Vec<PlanStep>> {
        let steps = match (self.config.mode, &self.planner, &self.direct) {
            (DispatchMode::Planner, Some(planner), _) => planner.plan(query, session_id).await?,
            (_, _, Some(direct)) => direct.plan(query, session_id).await?,
            _ => {
                return Err(LarderError::Configuration(
                    "no planner and no default agent configured".into(),
                ))
            }
        };
        if steps.is_empty() {
            return Err(LarderError::Agent("planner produced no steps".into()));
        }
        Ok(steps)
    }

    async fn run_step(
        &self,
        run: Uuid,
        query: &str,
        session_id: &str,
        step: &PlanStep,
        previous: Option<&Payload>,
    ) -> StepOutcome {
        let mut input = step.input.clone();
        input
            .entry("text")
            .or_insert_with(|| Value::String(query.to_string()));
        if let Some(previous) = previous {
            input.insert("previous".into(), Value::Object(previous.clone()));
        }

        let invocation = AgentInvocation::new(step.agent.clone(), input).with_session(session_id);
        let id = invocation.id;
        debug!(invocation_id = %id, agent = %step.agent, "Invocation queued");
        self.emit(session_id, Envelope::status(session_id, id, InvocationStatus::Queued))
            .await;

        let finished = match self.prepare(&invocation) {
            Ok(Dispatch::Inline(instance)) => {
                self.run_inline(run, invocation, instance, session_id).await
            }
            Ok(Dispatch::Queued(queue, wait)) => {
                self.run_queued(run, invocation, &queue, wait, session_id).await
            }
            Err(e) => {
                warn!(invocation_id = %id, agent = %step.agent, error = %e, "Invocation not dispatched");
                let mut failed = invocation;
                failed.fail(e.to_descriptor());
                failed
            }
        };

        self.counters.record(&finished);
        self.emit_terminal(session_id, &finished).await;
        StepOutcome::from_invocation(&finished, step.best_effort)
    }

    fn prepare(&self, invocation: &AgentInvocation) -> LarderResult<Dispatch> {
        let descriptor = self.registry.resolve(&invocation.agent)?;
        check_payload(&invocation.input)?;
        if descriptor.defaults.long_running {
            if let Some(queue) = &self.queue {
                let wait = self.config.queue_wait(descriptor.defaults.timeout);
                return Ok(Dispatch::Queued(queue.clone(), wait));
            }
            debug!(agent = %descriptor.name, "No queue attached, running inline");
        }
        Ok(Dispatch::Inline(AgentInstance::construct(
            &descriptor,
            AgentOverrides::default(),
        )?))
    }

    async fn run_inline(
        &self,
        run: Uuid,
        mut invocation: AgentInvocation,
        instance: AgentInstance,
        session_id: &str,
    ) -> AgentInvocation {
        let id = invocation.id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if !self.tracker.track_inline(run, id, session_id, &invocation.agent, cancel_tx) {
            invocation.cancel(format!("session {session_id} was closed"));
            return invocation;
        }

        invocation.mark_running();
        self.emit(session_id, Envelope::status(session_id, id, InvocationStatus::Running))
            .await;

        let ctx = AgentContext::new(id).with_session(session_id);
        let input = invocation.input.clone();
        let mut task = tokio::spawn(async move { instance.execute(ctx, input).await });
        let outcome = tokio::select! {
            joined = &mut task => joined.unwrap_or_else(|e| {
                Err(LarderError::Agent(format!("agent task failed: {e}")))
            }),
            _ = cancel_rx => {
                task.abort();
                Err(LarderError::Cancelled(format!("session {session_id} was closed")))
            }
        };
        self.tracker.forget(id);

        match outcome.and_then(|output| check_payload(&output).map(|()| output)) {
            Ok(output) => {
                invocation.succeed(output);
            }
            Err(e) => {
                debug!(invocation_id = %id, error = %e, "Inline invocation failed");
                invocation.fail(e.to_descriptor());
            }
        }
        invocation
    }

    async fn run_queued(
        &self,
        run: Uuid,
        mut invocation: AgentInvocation,
        queue: &TaskQueueAdapter,
        wait: Duration,
        session_id: &str,
    ) -> AgentInvocation {
        let id = invocation.id;
        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.tracker.track_queued(run, id, session_id, &invocation.agent, tx) {
            invocation.cancel(format!("session {session_id} was closed"));
            return invocation;
        }

        if let Err(e) = queue.submit(invocation.clone()).await {
            self.tracker.forget(id);
            let mut failed = invocation;
            failed.fail(e.to_descriptor());
            return failed;
        }

        let tracker = self.tracker.clone();
        let started = queue.on_start(id, move |job| {
            tracker.notify_started(&job);
        });
        let tracker = self.tracker.clone();
        let finished = queue.subscribe(id, move |job| {
            tracker.notify_terminal(job);
        });
        if let Err(e) = started.and(finished) {
            warn!(invocation_id = %id, error = %e, "Lost track of queued job");
        }

        let deadline = tokio::time::Instant::now() + wait;
        let finished = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(QueueEvent::Started)) => {
                    self.emit(session_id, Envelope::status(session_id, id, InvocationStatus::Running))
                        .await;
                }
                Ok(Some(QueueEvent::Finished(job))) => break job,
                Ok(None) => break self.settle(queue, invocation, "queue stopped reporting"),
                Err(_) => {
                    let message = format!("no result within {}ms", wait.as_millis());
                    warn!(invocation_id = %id, wait_ms = wait.as_millis() as u64, "Queued job expired");
                    if let Err(e) = queue.expire(id, message.clone()).await {
                        debug!(invocation_id = %id, error = %e, "Expire found no job");
                    }
                    break self.settle(queue, invocation, &message);
                }
            }
        };
        self.tracker.forget(id);
        finished
    }

    /// The queue's terminal record for `invocation`, or a local timeout if
    /// the queue no longer has one.
    fn settle(&self, queue: &TaskQueueAdapter, invocation: AgentInvocation, reason: &str) -> AgentInvocation {
        match queue.poll(invocation.id) {
            Ok(job) if job.is_terminal() => job,
            _ => {
                let mut lost = invocation;
                lost.time_out(reason);
                lost
            }
        }
    }

    async fn emit_terminal(&self, session_id: &str, invocation: &AgentInvocation) {
        let event = match (&invocation.result, &invocation.error) {
            (Some(output), _) if invocation.status == InvocationStatus::Succeeded => {
                Envelope::result(session_id, invocation.id, output.clone())
            }
            (_, Some(error)) => Envelope::error(session_id, Some(invocation.id), error),
            _ => Envelope::error(
                session_id,
                Some(invocation.id),
                &ErrorDescriptor::new(
                    ErrorKind::Internal,
                    format!("invocation ended as {}", invocation.status),
                ),
            ),
        };
        self.emit(session_id, event).await;
    }

    async fn emit(&self, session_id: &str, event: Envelope) {
        let report = self.bus.deliver(session_id, event).await;
        if report.attempted() == 0 {
            debug!(session_id = %session_id, "No connections bound to session");
        }
    }
}
