//! LLM-backed agents.
//!
//! Every built-in role and every marketplace agent is an [`LlmAgent`]: a role
//! prompt plus default model settings, sent through a [`CompletionClient`].
//! Output checks that the agent can detect itself (empty response, missing
//! files, truncated stream) are reported as transient errors so the retry
//! coordinator can ask for a corrected answer.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::debug;

use flowsmith_core::config::ModelDefaults;
use flowsmith_core::error::AgentError;
use flowsmith_core::traits::{AgentHandler, CompletionClient};
use flowsmith_core::types::{
    AgentConfig, AgentContext, AgentOutput, AgentResult, ChatMessage, Completion,
    CompletionRequest, GeneratedFile, StreamChunk,
};

use crate::marketplace::AgentManifest;

/// The agents every engine ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinRole {
    Planner,
    Coder,
    Reviewer,
    Security,
    Executor,
}

impl BuiltinRole {
    pub const ALL: [BuiltinRole; 5] = [
        Self::Planner,
        Self::Coder,
        Self::Reviewer,
        Self::Security,
        Self::Executor,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Security => "security",
            Self::Executor => "executor",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Planner => "Breaks the request into an ordered implementation plan",
            Self::Coder => "Writes the source files for the plan",
            Self::Reviewer => "Reviews generated code for bugs and style",
            Self::Security => "Audits generated code for vulnerabilities",
            Self::Executor => "Describes how to build, run and verify the result",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Planner => {
                "You are a software architect. Turn the user's request into a short, \
                 numbered implementation plan listing the files to create."
            }
            Self::Coder => {
                "You are a senior engineer. Implement the request and the plan so far. \
                 Return every file you create or change as a generated file."
            }
            Self::Reviewer => {
                "You are a code reviewer. Read the generated files and report concrete \
                 defects with file and line references. Return corrected files when needed."
            }
            Self::Security => {
                "You are a security auditor. Check the generated files for injection, \
                 unsafe input handling and leaked secrets. List each finding with a fix."
            }
            Self::Executor => {
                "You are a build engineer. Explain the exact commands to install, build, \
                 test and run the generated project."
            }
        }
    }

    /// Roles whose output is only useful with at least one file.
    pub fn requires_files(&self) -> bool {
        matches!(self, Self::Coder)
    }
}

/// An agent that answers through a text-generation client.
pub struct LlmAgent {
    id: String,
    description: String,
    role_prompt: String,
    base_config: AgentConfig,
    requires_files: bool,
    client: Arc<dyn CompletionClient>,
    defaults: ModelDefaults,
}

impl LlmAgent {
    pub fn new(
        id: impl Into<String>,
        role_prompt: impl Into<String>,
        client: Arc<dyn CompletionClient>,
        defaults: ModelDefaults,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            role_prompt: role_prompt.into(),
            base_config: AgentConfig::default(),
            requires_files: false,
            client,
            defaults,
        }
    }

    pub fn builtin(role: BuiltinRole, client: Arc<dyn CompletionClient>, defaults: ModelDefaults) -> Self {
        Self::new(role.id(), role.system_prompt(), client, defaults)
            .with_description(role.description())
            .with_requires_files(role.requires_files())
    }

    pub fn from_manifest(
        manifest: &AgentManifest,
        client: Arc<dyn CompletionClient>,
        defaults: ModelDefaults,
    ) -> Self {
        Self::new(manifest.id.clone(), manifest.system_prompt.clone(), client, defaults)
            .with_description(manifest.description.clone())
            .with_base_config(manifest.agent_config())
            .with_requires_files(manifest.requires_files)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_base_config(mut self, config: AgentConfig) -> Self {
        self.base_config = config;
        self
    }

    pub fn with_requires_files(mut self, requires_files: bool) -> Self {
        self.requires_files = requires_files;
        self
    }

    /// Node settings win over the agent's own, which win over engine defaults.
    fn effective_config(&self, node: &AgentConfig) -> AgentConfig {
        let layered = AgentConfig {
            model: node.model.clone().or_else(|| self.base_config.model.clone()),
            temperature: node.temperature.or(self.base_config.temperature),
            max_tokens: node.max_tokens.or(self.base_config.max_tokens),
            streaming: node.streaming.or(self.base_config.streaming),
            system_prompt: node
                .system_prompt
                .clone()
                .or_else(|| self.base_config.system_prompt.clone()),
        };
        self.defaults.fill(&layered)
    }

    fn build_request(&self, context: &AgentContext, node: &AgentConfig) -> CompletionRequest {
        let config = self.effective_config(node);

        let system_prompt = match config.system_prompt.as_deref() {
            Some(extra) if !extra.trim().is_empty() => format!("{}\n\n{}", self.role_prompt, extra),
            _ => self.role_prompt.clone(),
        };

        let mut messages = vec![ChatMessage::user(context.input.clone())];
        for prior in &context.messages {
            messages.push(ChatMessage::assistant(format!(
                "[{} @ {}]\n{}",
                prior.agent_id, prior.node_id, prior.content
            )));
        }
        if !context.artifacts.is_empty() {
            let mut listing = String::from("Files produced so far:\n");
            for artifact in &context.artifacts {
                listing.push_str(&format!(
                    "\n--- {} (from {})\n{}\n",
                    artifact.path, artifact.produced_by_node_id, artifact.content
                ));
            }
            messages.push(ChatMessage::user(listing));
        }
        for correction in &context.corrections {
            messages.push(ChatMessage::user(correction.clone()));
        }

        CompletionRequest {
            system_prompt,
            messages,
            model: config.model.unwrap_or_else(|| self.defaults.model.clone()),
            temperature: config.temperature.unwrap_or(self.defaults.temperature),
            max_tokens: config.max_tokens.unwrap_or(self.defaults.max_tokens),
            streaming: config.streaming.unwrap_or(self.defaults.streaming),
        }
    }

    fn check_output(&self, output: &AgentOutput) -> Result<(), AgentError> {
        if output.content.trim().is_empty() && output.files.is_empty() {
            return Err(AgentError::Transient("empty response".into()));
        }
        if self.requires_files && output.files.is_empty() {
            return Err(AgentError::Transient(
                "invalid output: expected at least one generated file".into(),
            ));
        }
        if let Some(file) = output.files.iter().find(|f| f.path.trim().is_empty()) {
            return Err(AgentError::Transient(format!(
                "invalid output: generated file with empty path ({} bytes)",
                file.content.len()
            )));
        }
        Ok(())
    }
}

impl AgentHandler for LlmAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn invoke(&self, context: AgentContext, config: AgentConfig) -> BoxFuture<'_, AgentResult> {
        Box::pin(async move {
            let request = self.build_request(&context, &config);
            debug!(
                agent = %self.id,
                node_id = %context.node_id,
                model = %request.model,
                streaming = request.streaming,
                messages = request.messages.len(),
                "Sending completion request"
            );

            let output = match self.client.complete(request).await? {
                Completion::Full { content, files } => AgentOutput { content, files },
                Completion::Stream(mut stream) => {
                    let mut content = String::new();
                    let mut files: Vec<GeneratedFile> = Vec::new();
                    let mut done = false;
                    while let Some(chunk) = stream.next().await {
                        match chunk? {
                            StreamChunk::Delta(text) => {
                                context.emit_fragment(&text);
                                content.push_str(&text);
                            }
                            StreamChunk::File(file) => files.push(file),
                            StreamChunk::Done => {
                                done = true;
                                break;
                            }
                        }
                    }
                    if !done {
                        return Err(AgentError::Transient(
                            "stream ended before completion signal".into(),
                        ));
                    }
                    AgentOutput { content, files }
                }
            };

            self.check_output(&output)?;
            Ok(output)
        })
    }
}
