use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use flowsmith_core::error::DecisionError;
use flowsmith_core::event::EventBus;
use flowsmith_core::traits::FragmentSink;
use flowsmith_core::types::{
    Artifact, LogEntry, LogLevel, NodeStatus, PendingDecision, RunEvent, RunId, RunMessage,
    RunState, RunStatus,
};

/// Per-run state owned by one run's scheduler.
///
/// Every mutation happens under a single write lock, so `snapshot()` never
/// observes a half-applied update and log sequence numbers are assigned in
/// strictly increasing order no matter which component appends. Events are
/// published while the lock is held, so subscribers see them in that order too.
pub struct RunLedger {
    run_id: RunId,
    state: RwLock<RunState>,
    events: Arc<EventBus>,
}

impl RunLedger {
    pub fn new(state: RunState, events: Arc<EventBus>) -> Self {
        Self {
            run_id: state.run_id.clone(),
            state: RwLock::new(state),
            events,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn read(&self) -> RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-only copy of the full run state.
    pub fn snapshot(&self) -> RunState {
        self.read().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.read().status
    }

    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.read().node_status(node_id)
    }

    /// Append a log entry and return its sequence number.
    pub fn append_log(
        &self,
        node_id: Option<&str>,
        level: LogLevel,
        message: impl Into<String>,
        attempt: Option<u32>,
    ) -> u64 {
        let mut state = self.write();
        let entry = LogEntry {
            sequence: state.next_sequence(),
            timestamp: Utc::now(),
            node_id: node_id.map(str::to_string),
            level,
            message: message.into(),
            attempt,
        };
        let sequence = entry.sequence;
        state.log.push(entry.clone());
        state.updated_at = entry.timestamp;
        self.events.publish(RunEvent::LogAppended {
            run_id: self.run_id.clone(),
            entry,
        });
        sequence
    }

    /// Shorthand for a run- or node-level entry that is not tied to an attempt.
    pub fn log(&self, node_id: Option<&str>, level: LogLevel, message: impl Into<String>) -> u64 {
        self.append_log(node_id, level, message, None)
    }

    /// Announce the run and record the first log entry.
    pub fn mark_started(&self) -> u64 {
        {
            let state = self.write();
            self.events.publish(RunEvent::RunStarted {
                run_id: self.run_id.clone(),
                graph_id: state.graph_id.clone(),
            });
        }
        self.log(None, LogLevel::Info, "run started")
    }

    pub fn set_node_status(&self, node_id: &str, status: NodeStatus) {
        let mut state = self.write();
        state.node_statuses.insert(node_id.to_string(), status);
        state.updated_at = Utc::now();
        self.events.publish(RunEvent::NodeStatusChanged {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            status,
        });
    }

    /// Record the node the scheduler is positioned at.
    pub fn set_current(&self, node_id: &str) {
        let mut state = self.write();
        state.current_node = Some(node_id.to_string());
        state.updated_at = Utc::now();
    }

    /// Attach an artifact, replacing any earlier one at the same path.
    pub fn add_artifact(&self, artifact: Artifact) {
        let mut state = self.write();
        let paths = vec![artifact.path.clone()];
        let node_id = artifact.produced_by_node_id.clone();
        upsert_artifact(&mut state.artifacts, artifact);
        state.updated_at = Utc::now();
        self.events.publish(RunEvent::ArtifactsMerged {
            run_id: self.run_id.clone(),
            node_id,
            paths,
        });
    }

    /// Mark a node completed and make its output visible in one step.
    pub fn complete_node(&self, node_id: &str, message: Option<RunMessage>, artifacts: Vec<Artifact>) {
        let mut state = self.write();
        let paths: Vec<String> = artifacts.iter().map(|a| a.path.clone()).collect();
        for artifact in artifacts {
            upsert_artifact(&mut state.artifacts, artifact);
        }
        if let Some(message) = message {
            state.messages.push(message);
        }
        state
            .node_statuses
            .insert(node_id.to_string(), NodeStatus::Completed);
        state.updated_at = Utc::now();

        self.events.publish(RunEvent::NodeStatusChanged {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            status: NodeStatus::Completed,
        });
        if !paths.is_empty() {
            self.events.publish(RunEvent::ArtifactsMerged {
                run_id: self.run_id.clone(),
                node_id: node_id.to_string(),
                paths,
            });
        }
    }

    /// Park the run on a decision node.
    pub fn suspend(&self, decision: PendingDecision) {
        let mut state = self.write();
        state
            .node_statuses
            .insert(decision.node_id.clone(), NodeStatus::Waiting);
        state.status = RunStatus::WaitingOnDecision;
        state.current_node = Some(decision.node_id.clone());
        state.pending_decision = Some(decision.clone());
        state.updated_at = Utc::now();

        self.events.publish(RunEvent::NodeStatusChanged {
            run_id: self.run_id.clone(),
            node_id: decision.node_id.clone(),
            status: NodeStatus::Waiting,
        });
        self.events.publish(RunEvent::RunStatusChanged {
            run_id: self.run_id.clone(),
            status: RunStatus::WaitingOnDecision,
            last_error: None,
        });
        self.events.publish(RunEvent::DecisionRequested {
            run_id: self.run_id.clone(),
            decision,
        });
    }

    /// Check that the run is parked on `node_id` and `option` is one of its choices.
    pub fn check_decision(&self, node_id: &str, option: &str) -> Result<(), DecisionError> {
        check_pending(&self.read(), node_id, option).map(|_| ())
    }

    /// Validate and clear the pending decision, returning the run to `running`.
    ///
    /// Validation and the transition happen under one lock, so of two
    /// concurrent resumes exactly one succeeds. On error nothing changes.
    pub fn take_decision(&self, node_id: &str, option: &str) -> Result<PendingDecision, DecisionError> {
        let mut state = self.write();
        check_pending(&state, node_id, option)?;
        let decision = state.pending_decision.take().ok_or_else(|| DecisionError::RunNotWaiting {
            run_id: self.run_id.to_string(),
            node_id: node_id.to_string(),
        })?;
        state
            .node_statuses
            .insert(node_id.to_string(), NodeStatus::Completed);
        state.status = RunStatus::Running;
        state.updated_at = Utc::now();

        self.events.publish(RunEvent::DecisionResolved {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            option: option.to_string(),
        });
        self.events.publish(RunEvent::NodeStatusChanged {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            status: NodeStatus::Completed,
        });
        self.events.publish(RunEvent::RunStatusChanged {
            run_id: self.run_id.clone(),
            status: RunStatus::Running,
            last_error: None,
        });
        Ok(decision)
    }

    /// Cancel a run parked on a decision. Returns false if it was not waiting.
    pub fn cancel_if_waiting(&self) -> bool {
        let mut state = self.write();
        if state.status != RunStatus::WaitingOnDecision {
            return false;
        }
        if let Some(decision) = state.pending_decision.take() {
            state.node_statuses.insert(decision.node_id, NodeStatus::Idle);
        }
        self.finish_locked(&mut state, RunStatus::Cancelled, None);
        true
    }

    /// Move the run to a terminal status. Ignored if it already is terminal.
    pub fn finish(&self, status: RunStatus, last_error: Option<String>) {
        let mut state = self.write();
        if state.status.is_terminal() {
            return;
        }
        self.finish_locked(&mut state, status, last_error);
    }

    fn finish_locked(&self, state: &mut RunState, status: RunStatus, last_error: Option<String>) {
        let now = Utc::now();
        state.status = status;
        state.pending_decision = None;
        if last_error.is_some() {
            state.last_error = last_error.clone();
        }
        state.updated_at = now;
        state.finished_at = Some(now);
        self.events.publish(RunEvent::RunStatusChanged {
            run_id: self.run_id.clone(),
            status,
            last_error,
        });
    }
}

fn check_pending<'a>(
    state: &'a RunState,
    node_id: &str,
    option: &str,
) -> Result<&'a PendingDecision, DecisionError> {
    let pending = match (&state.status, &state.pending_decision) {
        (RunStatus::WaitingOnDecision, Some(p)) if p.node_id == node_id => p,
        _ => {
            return Err(DecisionError::RunNotWaiting {
                run_id: state.run_id.to_string(),
                node_id: node_id.to_string(),
            })
        }
    };
    if !pending.options.iter().any(|o| o == option) {
        return Err(DecisionError::UnknownOption {
            option: option.to_string(),
            expected: pending.options.clone(),
        });
    }
    Ok(pending)
}

fn upsert_artifact(artifacts: &mut Vec<Artifact>, artifact: Artifact) {
    match artifacts.iter_mut().find(|a| a.path == artifact.path) {
        Some(existing) => *existing = artifact,
        None => artifacts.push(artifact),
    }
}

/// Turns streamed agent output into trace-level ledger entries as it arrives.
pub struct NodeFragments {
    ledger: Arc<RunLedger>,
    node_id: String,
}

impl NodeFragments {
    pub fn new(ledger: Arc<RunLedger>, node_id: impl Into<String>) -> Self {
        Self {
            ledger,
            node_id: node_id.into(),
        }
    }
}

impl FragmentSink for NodeFragments {
    fn push(&self, fragment: &str) {
        self.ledger
            .log(Some(&self.node_id), LogLevel::Trace, fragment);
    }
}
