//! Run scheduler.
//!
//! Each run is walked by a spawned traversal task that executes nodes strictly
//! in sequence along the active path. A traversal *segment* ends when the run
//! reaches a decision node (the task returns; the run is parked in its ledger),
//! an End node, a failure, or cancellation. `resume` validates the choice and
//! spawns a new segment at the chosen edge's target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowsmith_core::config::EngineConfig;
use flowsmith_core::error::{DecisionError, FlowError, Result, ValidationError};
use flowsmith_core::event::EventBus;
use flowsmith_core::traits::PersistenceSink;
use flowsmith_core::types::{
    AgentConfig, AgentContext, Artifact, LogLevel, NodeStatus, RunEvent, RunId, RunMessage,
    RunState, RunStatus,
};

use crate::gate::DecisionGate;
use crate::graph::{validate, Node, NodeKind, WorkflowGraph};
use crate::ledger::{NodeFragments, RunLedger};
use crate::registry::AgentRegistry;
use crate::retry::{RetryCoordinator, RetryOutcome};
use crate::run_log::RunJournal;
use crate::store::RunStore;

/// How long a finished run waits for its journal to drain.
const JOURNAL_DRAIN: Duration = Duration::from_secs(5);

type RunMap = Arc<Mutex<HashMap<RunId, Arc<RunHandle>>>>;

/// One active (or parked) run.
struct RunHandle {
    graph: Arc<WorkflowGraph>,
    ledger: Arc<RunLedger>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Journal writer, alive from start until the run is terminal.
    journal: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    fn new(graph: WorkflowGraph, ledger: RunLedger, cancel: CancellationToken) -> Self {
        Self {
            graph: Arc::new(graph),
            ledger: Arc::new(ledger),
            cancel,
            task: Mutex::new(None),
            journal: Mutex::new(None),
        }
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn take_journal(&self) -> Option<JoinHandle<()>> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// The workflow engine: starts, observes, resumes and cancels runs.
///
/// Cheap to clone; clones share the same runs.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<AgentRegistry>,
    retry: Arc<RetryCoordinator>,
    config: Arc<EngineConfig>,
    events: Arc<EventBus>,
    sink: Option<Arc<dyn PersistenceSink>>,
    store: Option<Arc<RunStore>>,
    runs: RunMap,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            retry: Arc::new(RetryCoordinator::from_config(&config.engine)),
            events: Arc::new(EventBus::new(config.engine.event_capacity.max(1))),
            config: Arc::new(config),
            sink: None,
            store: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Notify `sink` of every artifact and message as nodes complete.
    pub fn with_persistence(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Snapshot runs into `store` on suspension and termination.
    ///
    /// With a store attached, finished runs are dropped from memory and
    /// served from the store afterwards.
    pub fn with_store(mut self, store: Arc<RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish run events on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive events from every run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    fn handle(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    fn insert(&self, handle: Arc<RunHandle>) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.ledger.run_id().clone(), handle);
    }

    /// Map finished runs are evicted from, when a store can serve them.
    fn evictable(&self) -> Option<RunMap> {
        self.store.as_ref().map(|_| self.runs.clone())
    }

    /// Start the run's journal. Subscribes before returning so no later event is missed.
    fn attach_journal(&self, handle: &RunHandle) {
        let Some(journal) = self
            .config
            .log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| RunJournal::new(l.dir(), l.level))
        else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(run_id = %handle.ledger.run_id(), "No runtime, run journal disabled");
            return;
        };
        let rx = self.events.subscribe();
        let task = runtime.spawn(journal.run(
            rx,
            handle.ledger.run_id().clone(),
            self.shutdown.clone(),
        ));
        *handle.journal.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Validate `graph` and start a run at its Start node.
    ///
    /// Validation errors are returned here and never create a run.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(&self, graph: WorkflowGraph, input: impl Into<String>) -> Result<RunId> {
        validate(&graph)?;
        let start = graph
            .start_node()
            .map(|n| n.id.clone())
            .ok_or(ValidationError::MissingStart)?;

        let run_id = RunId::new();
        let state = RunState::new(
            run_id.clone(),
            graph.id.clone(),
            graph.node_ids().map(str::to_string),
            input,
        );
        let handle = Arc::new(RunHandle::new(
            graph,
            RunLedger::new(state, self.events.clone()),
            self.shutdown.child_token(),
        ));

        info!(run_id = %run_id, graph_id = %handle.graph.id, "Starting run");
        self.attach_journal(&handle);
        self.insert(handle.clone());

        let task = self.spawn_segment(&handle, start);
        *handle.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(run_id)
    }

    /// Wait for the current traversal segment to end and return the run state.
    ///
    /// Returns once the run is terminal or parked on a decision. Runs already
    /// evicted are read back from the store.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunState> {
        let Some(handle) = self.handle(run_id) else {
            return self.get_run_state(run_id);
        };

        while let Some(task) = handle.take_task() {
            if let Err(e) = task.await {
                error!(run_id = %run_id, error = %e, "Traversal task failed");
                handle
                    .ledger
                    .log(None, LogLevel::Error, format!("traversal task failed: {}", e));
                handle
                    .ledger
                    .finish(RunStatus::Failed, Some(format!("traversal task failed: {}", e)));
            }
        }
        if handle.ledger.status().is_terminal() {
            retire(handle.clone(), self.evictable()).await;
        }
        Ok(handle.ledger.snapshot())
    }

    /// Answer the decision a run is parked on and continue along the chosen edge.
    ///
    /// A rejected resume leaves the run untouched.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn resume(&self, run_id: &RunId, node_id: &str, option: &str) -> std::result::Result<(), DecisionError> {
        let handle = self.handle(run_id).ok_or_else(|| DecisionError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

        // Hold the task slot so `wait` sees the new segment.
        let mut slot = handle.task.lock().unwrap_or_else(PoisonError::into_inner);
        let edge = DecisionGate::resume(&handle.ledger, &handle.graph, node_id, option)?;
        let target = edge.target.clone();
        *slot = Some(self.spawn_segment(&handle, target));
        Ok(())
    }

    /// Cancel a run.
    ///
    /// A parked run is cancelled immediately. A running one stops at the next
    /// safe point: before the next node, or between retry attempts. Cancelling
    /// a finished run is a no-op.
    pub fn cancel(&self, run_id: &RunId) -> Result<()> {
        let handle = self
            .handle(run_id)
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;

        if handle.ledger.status().is_terminal() {
            return Ok(());
        }
        handle.cancel.cancel();
        if handle.ledger.cancel_if_waiting() {
            handle
                .ledger
                .log(None, LogLevel::Info, "run cancelled while waiting on decision");
            checkpoint(self.store.as_deref(), &handle.ledger, &handle.graph);
            self.retire_parked(&handle);
        }
        info!(run_id = %run_id, "Run cancellation requested");
        Ok(())
    }

    /// Snapshot of a run: live runs first, then the run store.
    pub fn get_run_state(&self, run_id: &RunId) -> Result<RunState> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle.ledger.snapshot());
        }
        if let Some(ref store) = self.store {
            if let Some(stored) = store.load(run_id)? {
                return Ok(stored.state);
            }
        }
        Err(FlowError::RunNotFound(run_id.to_string()))
    }

    /// Retire a run cancelled while parked, after the segment that parked it.
    fn retire_parked(&self, handle: &Arc<RunHandle>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut slot = handle.task.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = slot.take();
        let retiring = retire(handle.clone(), self.evictable());
        *slot = Some(runtime.spawn(async move {
            if let Some(previous) = previous {
                previous.await.ok();
            }
            retiring.await;
        }));
    }

    /// Drop a run from memory, cancelling it if still active. Returns its final state.
    pub fn discard(&self, run_id: &RunId) -> Result<RunState> {
        let handle = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
        handle.cancel.cancel();
        handle.ledger.cancel_if_waiting();
        debug!(run_id = %run_id, "Run discarded");
        Ok(handle.ledger.snapshot())
    }

    /// Ids of runs that are running or waiting on a decision.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|h| !h.ledger.status().is_terminal())
            .map(|h| h.ledger.run_id().clone())
            .collect()
    }

    /// Rehydrate a persisted run.
    ///
    /// A run waiting on a decision can be resumed afterwards. A run persisted
    /// mid-traversal cannot be continued safely and is marked failed.
    /// With a store attached that failure is written back and the run is not
    /// kept in memory.
    pub fn restore(&self, graph: WorkflowGraph, state: RunState) -> Result<RunId> {
        validate(&graph)?;
        if state.graph_id != graph.id {
            return Err(FlowError::Config(format!(
                "run {} belongs to graph '{}', not '{}'",
                state.run_id, state.graph_id, graph.id
            )));
        }
        if let Some(ref pending) = state.pending_decision {
            if graph.node(&pending.node_id).is_none() {
                return Err(FlowError::Config(format!(
                    "run {} is waiting on unknown node '{}'",
                    state.run_id, pending.node_id
                )));
            }
        }

        let run_id = state.run_id.clone();
        let interrupted = state.status == RunStatus::Running;
        let handle = Arc::new(RunHandle::new(
            graph,
            RunLedger::new(state, self.events.clone()),
            self.shutdown.child_token(),
        ));

        if interrupted {
            warn!(run_id = %run_id, "Restored run was interrupted mid-traversal");
            handle
                .ledger
                .log(None, LogLevel::Error, "run interrupted before completion");
            handle
                .ledger
                .finish(RunStatus::Failed, Some("run interrupted before completion".into()));
            if checkpoint(self.store.as_deref(), &handle.ledger, &handle.graph) {
                info!(run_id = %run_id, "Interrupted run marked failed in store");
                return Ok(run_id);
            }
        } else if !handle.ledger.status().is_terminal() {
            self.attach_journal(&handle);
        }

        info!(run_id = %run_id, status = %handle.ledger.status(), "Run restored");
        self.insert(handle);
        Ok(run_id)
    }

    /// Restore every run the store holds as waiting on a decision.
    ///
    /// Runs already live in this engine are skipped. Returns the number restored.
    pub fn recover(&self) -> Result<usize> {
        let Some(ref store) = self.store else {
            return Ok(0);
        };
        let mut restored = 0;
        for stored in store.list_waiting()? {
            if self.handle(&stored.state.run_id).is_some() {
                continue;
            }
            self.restore(stored.graph, stored.state)?;
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "Recovered waiting runs");
        }
        Ok(restored)
    }

    /// Cancel every run this engine owns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn spawn_segment(&self, handle: &Arc<RunHandle>, from: String) -> JoinHandle<()> {
        let handle = handle.clone();
        let evict = self.evictable();
        let traversal = Traversal {
            registry: self.registry.clone(),
            retry: self.retry.clone(),
            sink: self.sink.clone(),
            store: self.store.clone(),
            graph: handle.graph.clone(),
            ledger: handle.ledger.clone(),
            cancel: handle.cancel.clone(),
        };

        tokio::spawn(async move {
            traversal.run_from(from).await;
            if handle.ledger.status().is_terminal() {
                retire(handle, evict).await;
            }
        })
    }
}

/// Let a terminal run's journal drain, then evict the run when a store holds it.
///
/// Safe to call more than once for the same run.
async fn retire(handle: Arc<RunHandle>, runs: Option<RunMap>) {
    let run_id = handle.ledger.run_id().clone();
    if let Some(journal) = handle.take_journal() {
        if tokio::time::timeout(JOURNAL_DRAIN, journal).await.is_err() {
            debug!(run_id = %run_id, "Run journal did not drain in time");
        }
    }
    if let Some(runs) = runs {
        let mut runs = runs.lock().unwrap_or_else(PoisonError::into_inner);
        if runs.get(&run_id).is_some_and(|h| Arc::ptr_eq(h, &handle)) {
            runs.remove(&run_id);
            debug!(run_id = %run_id, "Finished run evicted");
        }
    }
}

/// Result of executing one node.
enum Step {
    Continue,
    Halt,
}

/// Everything one traversal segment needs, owned by its task.
struct Traversal {
    registry: Arc<AgentRegistry>,
    retry: Arc<RetryCoordinator>,
    sink: Option<Arc<dyn PersistenceSink>>,
    store: Option<Arc<RunStore>>,
    graph: Arc<WorkflowGraph>,
    ledger: Arc<RunLedger>,
    cancel: CancellationToken,
}

impl Traversal {
    async fn run_from(&self, from: String) {
        let run_id = self.ledger.run_id().clone();
        let mut current = from;

        loop {
            if self.cancel.is_cancelled() {
                self.cancelled(&current);
                return;
            }

            let graph = self.graph.clone();
            let Some(node) = graph.node(&current) else {
                self.fail(None, format!("node '{}' not found in graph", current));
                return;
            };
            self.ledger.set_current(&node.id);

            let step = match &node.kind {
                NodeKind::Start => {
                    self.ledger.mark_started();
                    self.ledger.set_node_status(&node.id, NodeStatus::Completed);
                    Step::Continue
                }
                NodeKind::Agent { agent_id, config } => self.run_agent(node, agent_id, config).await,
                NodeKind::HumanDecision { prompt, options } => {
                    DecisionGate::suspend(&self.ledger, &node.id, prompt.clone(), options);
                    // A cancel that raced the suspension finds nothing parked yet.
                    if self.cancel.is_cancelled() && self.ledger.cancel_if_waiting() {
                        self.ledger.log(Some(&node.id), LogLevel::Info, "run cancelled");
                    }
                    checkpoint(self.store.as_deref(), &self.ledger, &self.graph);
                    Step::Halt
                }
                NodeKind::End => {
                    self.ledger.set_node_status(&node.id, NodeStatus::Completed);
                    self.ledger.log(Some(&node.id), LogLevel::Info, "run completed");
                    self.ledger.finish(RunStatus::Completed, None);
                    info!(run_id = %run_id, "Run completed");
                    checkpoint(self.store.as_deref(), &self.ledger, &self.graph);
                    Step::Halt
                }
            };

            if let Step::Halt = step {
                return;
            }

            match graph.successor(&node.id) {
                Some(edge) => {
                    debug!(run_id = %run_id, from = %edge.source, to = %edge.target, "Following edge");
                    current = edge.target.clone();
                }
                None => {
                    self.fail(
                        Some(&node.id),
                        format!("node '{}' has no outgoing edge", node.id),
                    );
                    return;
                }
            }
        }
    }

    async fn run_agent(&self, node: &Node, agent_id: &str, config: &AgentConfig) -> Step {
        let run_id = self.ledger.run_id().clone();

        let handler = match self.registry.resolve(agent_id) {
            Ok(h) => h,
            Err(e) => {
                self.ledger.set_node_status(&node.id, NodeStatus::Error);
                self.fail(Some(&node.id), e.to_string());
                return Step::Halt;
            }
        };

        self.ledger.set_node_status(&node.id, NodeStatus::Running);
        self.ledger.log(
            Some(&node.id),
            LogLevel::Info,
            format!("invoking agent '{}'", agent_id),
        );
        info!(run_id = %run_id, node_id = %node.id, agent = agent_id, "Running agent node");

        let snapshot = self.ledger.snapshot();
        let mut context = AgentContext::new(run_id.clone(), node.id.clone(), snapshot.input);
        context.messages = snapshot.messages;
        context.artifacts = snapshot.artifacts;
        context.fragments = Some(Arc::new(NodeFragments::new(self.ledger.clone(), node.id.clone())));

        let outcome = self
            .retry
            .run_with_retry(handler.as_ref(), context, config, &self.ledger, &self.cancel)
            .await;

        match outcome {
            RetryOutcome::Succeeded { output, attempts } => {
                let artifacts: Vec<Artifact> = output
                    .files
                    .into_iter()
                    .map(|f| Artifact {
                        path: f.path,
                        content: f.content,
                        produced_by_node_id: node.id.clone(),
                    })
                    .collect();
                let message = (!output.content.trim().is_empty()).then(|| RunMessage {
                    node_id: node.id.clone(),
                    agent_id: agent_id.to_string(),
                    content: output.content,
                    timestamp: Utc::now(),
                });

                self.ledger
                    .complete_node(&node.id, message.clone(), artifacts.clone());
                debug!(
                    run_id = %run_id,
                    node_id = %node.id,
                    attempts,
                    artifacts = artifacts.len(),
                    "Agent node completed"
                );
                self.persist(&node.id, &artifacts, message.as_ref()).await;
                Step::Continue
            }
            RetryOutcome::Failed(failure) => {
                let reason = format!(
                    "agent '{}' failed after {} attempt(s): {}",
                    agent_id,
                    failure.attempts,
                    failure.last_error.reason()
                );
                self.ledger.set_node_status(&node.id, NodeStatus::Error);
                self.fail(Some(&node.id), reason);
                Step::Halt
            }
            RetryOutcome::Cancelled { attempts } => {
                debug!(run_id = %run_id, node_id = %node.id, attempts, "Agent node cancelled");
                self.cancelled(&node.id);
                Step::Halt
            }
        }
    }

    /// Hand a completed node's output to the persistence sink. Failures are logged only.
    async fn persist(&self, node_id: &str, artifacts: &[Artifact], message: Option<&RunMessage>) {
        let Some(ref sink) = self.sink else {
            return;
        };
        let run_id = self.ledger.run_id();

        for artifact in artifacts {
            if let Err(e) = sink.save_artifact(run_id, artifact).await {
                warn!(run_id = %run_id, path = %artifact.path, error = %e, "Failed to persist artifact");
                self.ledger.log(
                    Some(node_id),
                    LogLevel::Warn,
                    format!("failed to persist artifact '{}': {}", artifact.path, e),
                );
            }
        }
        if let Some(message) = message {
            if let Err(e) = sink.save_message(run_id, message).await {
                warn!(run_id = %run_id, node_id, error = %e, "Failed to persist message");
                self.ledger.log(
                    Some(node_id),
                    LogLevel::Warn,
                    format!("failed to persist message: {}", e),
                );
            }
        }
    }

    fn fail(&self, node_id: Option<&str>, reason: String) {
        error!(run_id = %self.ledger.run_id(), node_id = ?node_id, reason = %reason, "Run failed");
        self.ledger.log(node_id, LogLevel::Error, reason.clone());
        self.ledger.finish(RunStatus::Failed, Some(reason));
        checkpoint(self.store.as_deref(), &self.ledger, &self.graph);
    }

    fn cancelled(&self, node_id: &str) {
        if self.ledger.node_status(node_id) == NodeStatus::Running {
            self.ledger.set_node_status(node_id, NodeStatus::Idle);
        }
        self.ledger.log(Some(node_id), LogLevel::Info, "run cancelled");
        self.ledger.finish(RunStatus::Cancelled, None);
        info!(run_id = %self.ledger.run_id(), node_id, "Run cancelled");
        checkpoint(self.store.as_deref(), &self.ledger, &self.graph);
    }
}

/// Save the run's current snapshot. Returns true once the store holds it.
fn checkpoint(store: Option<&RunStore>, ledger: &RunLedger, graph: &WorkflowGraph) -> bool {
    let Some(store) = store else {
        return false;
    };
    match store.save(&ledger.snapshot(), graph) {
        Ok(written) => {
            if !written {
                debug!(run_id = %ledger.run_id(), "Stale run snapshot skipped");
            }
            true
        }
        Err(e) => {
            warn!(run_id = %ledger.run_id(), error = %e, "Failed to save run snapshot");
            false
        }
    }
}
