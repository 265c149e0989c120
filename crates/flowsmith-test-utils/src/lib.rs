//! Stub agents, completion clients and persistence sinks for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;

use flowsmith_core::error::{AgentError, FlowError, Result};
use flowsmith_core::traits::{AgentHandler, CompletionClient, PersistenceSink};
use flowsmith_core::types::{
    AgentConfig, AgentContext, AgentOutput, AgentResult, Artifact, Completion, CompletionRequest,
    GeneratedFile, RunId, RunMessage, StreamChunk,
};

/// Shared record of which nodes were invoked, in order.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node_id: &str) {
        self.0.lock().unwrap().push(node_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Always succeeds with `"<id> done"` and an optional file.
pub struct StubAgent {
    id: String,
    log: CallLog,
    file: Option<GeneratedFile>,
}

impl StubAgent {
    pub fn new(id: &str, log: CallLog) -> Self {
        Self {
            id: id.to_string(),
            log,
            file: None,
        }
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.file = Some(GeneratedFile::new(path, content));
        self
    }
}

impl AgentHandler for StubAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(&self, context: AgentContext, _config: AgentConfig) -> BoxFuture<'_, AgentResult> {
        Box::pin(async move {
            self.log.record(&context.node_id);
            let mut output = AgentOutput::text(format!("{} done", self.id));
            if let Some(ref file) = self.file {
                output.files.push(file.clone());
            }
            Ok(output)
        })
    }
}

/// Plays back a fixed sequence of outcomes, one per invocation.
///
/// Once the script runs out every further call succeeds.
pub struct ScriptedAgent {
    id: String,
    script: Mutex<VecDeque<AgentResult>>,
    calls: AtomicU32,
    corrections: Mutex<Vec<Vec<String>>>,
    delay: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new(id: &str, script: Vec<AgentResult>) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            corrections: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// `failures` transient errors followed by success.
    pub fn failing(id: &str, failures: usize) -> Self {
        let mut script: Vec<AgentResult> = (0..failures)
            .map(|i| Err(AgentError::Transient(format!("malformed output #{}", i + 1))))
            .collect();
        script.push(Ok(AgentOutput::text("recovered")));
        Self::new(id, script)
    }

    /// Never succeeds.
    pub fn always_failing(id: &str) -> Self {
        Self::new(
            id,
            (0..64)
                .map(|_| Err(AgentError::Transient("still broken".into())))
                .collect(),
        )
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Corrections seen by each call, in call order.
    pub fn corrections(&self) -> Vec<Vec<String>> {
        self.corrections.lock().unwrap().clone()
    }
}

impl AgentHandler for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(&self, context: AgentContext, _config: AgentConfig) -> BoxFuture<'_, AgentResult> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.corrections
                .lock()
                .unwrap()
                .push(context.corrections.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(AgentOutput::text(format!("{} done", self.id))))
        })
    }
}

/// A canned reply from [`StubCompletionClient`].
#[derive(Debug, Clone)]
pub enum Reply {
    Full(String, Vec<GeneratedFile>),
    Stream(Vec<StreamChunk>),
    Error(AgentError),
}

/// Completion client that replays canned replies and records every request.
#[derive(Default)]
pub struct StubCompletionClient {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl StubCompletionClient {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CompletionClient for StubCompletionClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, std::result::Result<Completion, AgentError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Error(AgentError::Permanent("no scripted reply".into())));
            match reply {
                Reply::Full(content, files) => Ok(Completion::Full { content, files }),
                Reply::Stream(chunks) => Ok(Completion::Stream(
                    futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
                )),
                Reply::Error(e) => Err(e),
            }
        })
    }
}

/// Persistence sink that keeps everything in memory.
#[derive(Default)]
pub struct RecordingSink {
    artifacts: Mutex<Vec<(RunId, Artifact)>>,
    messages: Mutex<Vec<(RunId, RunMessage)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<(RunId, Artifact)> {
        self.artifacts.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<(RunId, RunMessage)> {
        self.messages.lock().unwrap().clone()
    }
}

impl PersistenceSink for RecordingSink {
    fn save_artifact(&self, run_id: &RunId, artifact: &Artifact) -> BoxFuture<'_, Result<()>> {
        let entry = (run_id.clone(), artifact.clone());
        Box::pin(async move {
            self.artifacts.lock().unwrap().push(entry);
            Ok(())
        })
    }

    fn save_message(&self, run_id: &RunId, message: &RunMessage) -> BoxFuture<'_, Result<()>> {
        let entry = (run_id.clone(), message.clone());
        Box::pin(async move {
            self.messages.lock().unwrap().push(entry);
            Ok(())
        })
    }
}

/// Persistence sink whose every call fails.
pub struct FailingSink;

impl PersistenceSink for FailingSink {
    fn save_artifact(&self, _run_id: &RunId, _artifact: &Artifact) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(FlowError::Database("sink offline".into())) })
    }

    fn save_message(&self, _run_id: &RunId, _message: &RunMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(FlowError::Database("sink offline".into())) })
    }
}
