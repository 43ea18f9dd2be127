//! The local agent façade.
//!
//! Owns the configuration and the gateways, turns a prompt plus history into
//! a fresh conversation, and normalises every outcome into an
//! [`AgentRunPayload`] (or [`AgentError::Cancelled`]). Both async and
//! blocking entry points are provided; the blocking ones refuse to run inside
//! an existing tokio runtime.

use crate::context::{CONTEXT_SNAPSHOT_PREFIX, ContextBuilder, enrich_snapshots, is_context_snapshot};
use crate::loop_runner::{AgentLoopRunner, LoopLimits};
use crate::outcome::{AgentRunPayload, RunOutcome};
use crate::stream_event::{self, RunObserver};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use taskloop_config::{AgentSettings, DEFAULT_SYSTEM_PROMPT};
use taskloop_core::error::{ErrorCode, ErrorPayload, OperationCancelled};
use taskloop_core::event::{EventSink, TracingSink, names, preview};
use taskloop_core::message::{Conversation, Message};
use taskloop_core::provider::LlmGateway;
use taskloop_core::tool::ToolGateway;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Longest prompt preview in the `AGENT_START` event.
const PROMPT_PREVIEW_LIMIT: usize = 200;

/// Failures that do not resolve to a run payload.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Cancelled(#[from] OperationCancelled),

    #[error("blocking agent methods cannot run inside a tokio runtime; use the async variants")]
    NestedRuntime,

    #[error("failed to start runtime: {0}")]
    Runtime(String),
}

/// One user request plus everything that accompanies it.
#[derive(Clone)]
pub struct RunRequest {
    prompt: String,
    history: Vec<Message>,
    context: Vec<Message>,
    cancellation: CancellationToken,
    observer: Option<Arc<dyn RunObserver>>,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
            context: Vec::new(),
            cancellation: CancellationToken::new(),
            observer: None,
        }
    }

    /// Prior turns, taken as-is.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// Extra messages placed between the history and the prompt.
    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context.extend(context);
        self
    }

    /// A workspace snapshot; merged into the leading system message. Selected
    /// requirements without a summary line get one before the run starts.
    pub fn with_context_snapshot(mut self, snapshot: &str) -> Self {
        let content = if is_context_snapshot(snapshot) {
            snapshot.to_string()
        } else {
            format!("{CONTEXT_SNAPSHOT_PREFIX}\n{}", snapshot.trim())
        };
        self.context.push(Message::system(content));
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// High-level agent wiring an LLM gateway to a tool gateway.
pub struct LocalAgent {
    llm: Arc<dyn LlmGateway>,
    tools: Arc<dyn ToolGateway>,
    events: Arc<dyn EventSink>,
    limits: LoopLimits,
    context: ContextBuilder,
}

impl LocalAgent {
    pub fn new(llm: Arc<dyn LlmGateway>, tools: Arc<dyn ToolGateway>) -> Self {
        Self {
            llm,
            tools,
            events: Arc::new(TracingSink),
            limits: LoopLimits::default(),
            context: ContextBuilder::new(DEFAULT_SYSTEM_PROMPT, 0),
        }
    }

    /// Limits, system prompt and context budget come from `settings`.
    pub fn from_settings(llm: Arc<dyn LlmGateway>, tools: Arc<dyn ToolGateway>, settings: &AgentSettings) -> Self {
        Self {
            limits: LoopLimits::from_settings(settings),
            context: ContextBuilder::new(settings.system_prompt(), settings.context_token_budget()),
            ..Self::new(llm, tools)
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_limits(mut self, limits: LoopLimits) -> Self {
        self.limits = limits;
        self
    }

    /// `None` or `Some(0)` means unlimited.
    pub fn with_max_thought_steps(mut self, steps: Option<usize>) -> Self {
        self.limits.max_thought_steps = steps.filter(|s| *s > 0);
        self
    }

    /// `None` or `Some(0)` disables the cap.
    pub fn with_max_consecutive_tool_errors(mut self, errors: Option<usize>) -> Self {
        self.limits.max_consecutive_tool_errors = errors.filter(|e| *e > 0);
        self
    }

    pub fn with_context_builder(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    pub fn max_thought_steps(&self) -> Option<usize> {
        self.limits.max_thought_steps
    }

    pub fn max_consecutive_tool_errors(&self) -> Option<usize> {
        self.limits.max_consecutive_tool_errors
    }

    pub async fn check_llm_async(&self) -> Value {
        self.llm.check_health().await
    }

    pub async fn check_tools_async(&self) -> Value {
        self.tools.check_health().await
    }

    pub fn check_llm(&self) -> Result<Value, AgentError> {
        block_on(self.check_llm_async())
    }

    pub fn check_tools(&self) -> Result<Value, AgentError> {
        block_on(self.check_tools_async())
    }

    /// Blocking variant of [`LocalAgent::run_command_async`].
    pub fn run_command(&self, request: RunRequest) -> Result<AgentRunPayload, AgentError> {
        block_on(self.run_command_async(request))?
    }

    /// Drive one run. Every outcome except cancellation is a payload.
    pub async fn run_command_async(&self, request: RunRequest) -> Result<AgentRunPayload, AgentError> {
        let RunRequest {
            prompt,
            history,
            mut context,
            cancellation,
            observer,
        } = request;

        self.events.log_event(
            names::AGENT_START,
            json!({
                "history_count": history.len(),
                "prompt": preview(&prompt, PROMPT_PREVIEW_LIMIT),
            }),
        );
        info!(history = history.len(), context = context.len(), "Starting agent run");

        enrich_snapshots(&mut context, self.tools.as_ref()).await;
        let mut conversation = Conversation::seeded(history.into_iter().chain(context));
        let payload = match conversation.append_user(Message::user(prompt)) {
            Ok(()) => {
                let schemas = self.load_tool_schemas().await;
                let mut runner = AgentLoopRunner::new(self.llm.clone(), self.tools.clone(), conversation)
                    .with_events(self.events.clone())
                    .with_context_builder(self.context.clone())
                    .with_cancellation(cancellation)
                    .with_limits(self.limits)
                    .with_tool_schemas(schemas);
                if let Some(observer) = observer {
                    runner = runner.with_observer(observer);
                }
                match runner.run().await {
                    Ok(RunOutcome::Succeeded(payload)) | Ok(RunOutcome::Aborted(payload)) => payload,
                    Ok(RunOutcome::Cancelled) => {
                        self.events
                            .log_event(names::AGENT_CANCELLED, json!({"reason": "user-request"}));
                        return Err(OperationCancelled.into());
                    }
                    Err(err) => self.internal_failure(&err),
                }
            }
            Err(err) => self.internal_failure(&err),
        };

        self.events.log_event(
            names::AGENT_RESULT,
            json!({
                "ok": payload.ok,
                "status": payload.status,
                "result_preview": preview(payload.result_text(), stream_event::MESSAGE_PREVIEW_LIMIT),
                "tool_results": payload.tool_results.len(),
            }),
        );
        info!(ok = payload.ok, tool_results = payload.tool_results.len(), "Agent run complete");
        Ok(payload)
    }

    async fn load_tool_schemas(&self) -> BTreeMap<String, Value> {
        match self.tools.tool_schemas().await {
            Ok(schemas) => schemas,
            Err(err) => {
                warn!(error = %err, "Failed to load tool schemas");
                self.events
                    .log_event(names::MCP_SCHEMA_ERROR, json!({"error": err.to_payload().to_value()}));
                BTreeMap::new()
            }
        }
    }

    fn internal_failure(&self, err: &dyn std::error::Error) -> AgentRunPayload {
        let error = ErrorPayload::new(ErrorCode::INTERNAL, err.to_string())
            .with_detail("type", json!("ConversationError"));
        warn!(error = %err, "Agent run broke a conversation invariant");
        self.events
            .log_event(names::ERROR, json!({"error": error.to_value()}));
        AgentRunPayload::failure(err.to_string(), error)
    }
}

/// Run `future` to completion on a dedicated current-thread runtime.
fn block_on<F: Future>(future: F) -> Result<F::Output, AgentError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(AgentError::NestedRuntime);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AgentError::Runtime(e.to_string()))?;
    Ok(runtime.block_on(future))
}
