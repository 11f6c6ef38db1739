use larder_core::AgentInvocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Progress of a queued invocation, forwarded from the queue's callbacks.
#[derive(Debug)]
pub(crate) enum QueueEvent {
    Started,
    Finished(AgentInvocation),
}

enum Route {
    Inline { cancel: Option<oneshot::Sender<()>> },
    Queued { events: mpsc::UnboundedSender<QueueEvent> },
}

struct Tracked {
    session_id: String,
    agent: String,
    route: Route,
}

/// One `process_query` call in progress.
struct Run {
    session_id: String,
    cancelled: bool,
}

#[derive(Default)]
struct Table {
    invocations: HashMap<Uuid, Tracked>,
    runs: HashMap<Uuid, Run>,
}

impl Table {
    fn admits(&self, run: Uuid) -> bool {
        !self.runs.get(&run).is_some_and(|r| r.cancelled)
    }
}

/// What has to happen to stop one in-flight invocation.
pub(crate) enum CancelTarget {
    Inline(oneshot::Sender<()>),
    Queued,
}

/// Keeps a query's run registered until it is dropped.
pub(crate) struct RunGuard {
    tracker: Arc<InvocationTracker>,
    id: Uuid,
}

impl RunGuard {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.tracker.inner.lock().runs.remove(&self.id);
    }
}

/// In-flight invocations, keyed by id and tagged with their session, plus
/// the queries that own them.
///
/// An invocation entry exists from dispatch until the orchestrator has seen
/// the terminal outcome. Notifications for ids not in the table are dropped.
/// Cancelling a session also marks its running queries, and a cancelled
/// query cannot track new invocations.
#[derive(Default)]
pub struct InvocationTracker {
    inner: Mutex<Table>,
}

impl InvocationTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_run(self: &Arc<Self>, session_id: &str) -> RunGuard {
        let id = Uuid::new_v4();
        self.inner.lock().runs.insert(
            id,
            Run {
                session_id: session_id.to_string(),
                cancelled: false,
            },
        );
        RunGuard {
            tracker: self.clone(),
            id,
        }
    }

    /// Whether the session owning `run` was cancelled since the run began.
    pub(crate) fn run_cancelled(&self, run: Uuid) -> bool {
        !self.inner.lock().admits(run)
    }

    /// Track an inline invocation. Returns `false`, tracking nothing, when
    /// `run` was cancelled.
    pub(crate) fn track_inline(
        &self,
        run: Uuid,
        id: Uuid,
        session_id: &str,
        agent: &str,
        cancel: oneshot::Sender<()>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if !inner.admits(run) {
            return false;
        }
        inner.invocations.insert(
            id,
            Tracked {
                session_id: session_id.to_string(),
                agent: agent.to_string(),
                route: Route::Inline { cancel: Some(cancel) },
            },
        );
        true
    }

    /// Track a queued invocation. Returns `false`, tracking nothing, when
    /// `run` was cancelled.
    pub(crate) fn track_queued(
        &self,
        run: Uuid,
        id: Uuid,
        session_id: &str,
        agent: &str,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if !inner.admits(run) {
            return false;
        }
        inner.invocations.insert(
            id,
            Tracked {
                session_id: session_id.to_string(),
                agent: agent.to_string(),
                route: Route::Queued { events },
            },
        );
        true
    }

    pub(crate) fn forget(&self, id: Uuid) {
        self.inner.lock().invocations.remove(&id);
    }

    /// Whether `id` is in flight.
    pub fn is_tracked(&self, id: Uuid) -> bool {
        self.inner.lock().invocations.contains_key(&id)
    }

    /// Invocations in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().invocations.len()
    }

    /// No invocation in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().invocations.is_empty()
    }

    /// Queries still running.
    pub fn active_runs(&self) -> usize {
        self.inner.lock().runs.len()
    }

    /// Ids in flight for `session_id`.
    pub fn in_session(&self, session_id: &str) -> Vec<Uuid> {
        self.inner
            .lock()
            .invocations
            .iter()
            .filter(|(_, t)| t.session_id == session_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Forward a queued invocation's start. Returns `false` if untracked.
    pub fn notify_started(&self, invocation: &AgentInvocation) -> bool {
        let inner = self.inner.lock();
        match inner.invocations.get(&invocation.id).map(|t| &t.route) {
            Some(Route::Queued { events }) => events.send(QueueEvent::Started).is_ok(),
            Some(Route::Inline { .. }) => false,
            None => {
                debug!(invocation_id = %invocation.id, "Start notification for untracked invocation");
                false
            }
        }
    }

    /// Forward a queued invocation's terminal record to the step waiting on
    /// it. Unknown ids are logged and discarded.
    pub fn notify_terminal(&self, invocation: AgentInvocation) -> bool {
        let inner = self.inner.lock();
        match inner.invocations.get(&invocation.id) {
            Some(Tracked {
                route: Route::Queued { events },
                ..
            }) => events.send(QueueEvent::Finished(invocation)).is_ok(),
            Some(tracked) => {
                warn!(
                    invocation_id = %invocation.id,
                    agent = %tracked.agent,
                    "Terminal notification for an inline invocation ignored"
                );
                false
            }
            None => {
                warn!(
                    invocation_id = %invocation.id,
                    agent = %invocation.agent,
                    status = %invocation.status,
                    "Discarding terminal notification for untracked invocation"
                );
                false
            }
        }
    }

    /// Mark every running query of `session_id` cancelled and collect what
    /// must be signalled to stop its invocations. Inline cancel signals are
    /// taken, so each fires once.
    pub(crate) fn cancel_targets(&self, session_id: &str) -> Vec<(Uuid, CancelTarget)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for run in inner.runs.values_mut().filter(|r| r.session_id == session_id) {
            run.cancelled = true;
        }
        inner
            .invocations
            .iter_mut()
            .filter(|(_, t)| t.session_id == session_id)
            .filter_map(|(id, t)| match &mut t.route {
                Route::Inline { cancel } => cancel.take().map(|tx| (*id, CancelTarget::Inline(tx))),
                Route::Queued { .. } => Some((*id, CancelTarget::Queued)),
            })
            .collect()
    }
}
