//! Agent-level streaming events.
//!
//! While a run is in flight the loop reports two kinds of progress to an
//! optional [`RunObserver`]: tool call snapshots (`running`, then a terminal
//! `completed`/`failed`) and one [`StepSummary`] per model step. The
//! [`ChannelObserver`] forwards both as [`AgentStreamEvent`]s over an mpsc
//! channel so a UI can consume them on another task.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::{AssertUnwindSafe, catch_unwind};
use taskloop_core::event::{EventSink, names, preview};
use taskloop_core::provider::LlmResponse;
use taskloop_core::reasoning;
use taskloop_core::tool::ToolResult;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Longest assistant-message preview in a step summary.
pub const MESSAGE_PREVIEW_LIMIT: usize = 400;

/// Longest reasoning preview in a step summary.
pub const REASONING_PREVIEW_LIMIT: usize = 200;

/// Events emitted by the agent during a run.
///
/// - `tool_result`: a tool call snapshot
/// - `step`: a model step finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    ToolResult(ToolResult),
    Step(StepSummary),
}

impl AgentStreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ToolResult(_) => "tool_result",
            Self::Step(_) => "step",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepToolCall {
    pub id: String,
    pub name: String,
    /// Sorted argument names; values are left out of the stream
    pub argument_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningPreview {
    #[serde(rename = "type")]
    pub kind: String,
    pub preview: String,
}

/// What observers learn about one model step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: usize,
    pub message_preview: String,
    pub tool_calls: Vec<StepToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning: Vec<ReasoningPreview>,
}

impl StepSummary {
    pub fn from_response(step: usize, response: &LlmResponse) -> Self {
        Self {
            step,
            message_preview: preview(&response.content, MESSAGE_PREVIEW_LIMIT),
            tool_calls: response
                .tool_calls
                .iter()
                .map(|call| {
                    let mut argument_keys: Vec<String> = call.arguments.keys().cloned().collect();
                    argument_keys.sort();
                    StepToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        argument_keys,
                    }
                })
                .collect(),
            reasoning: reasoning::normalise(&response.reasoning)
                .iter()
                .map(|segment| ReasoningPreview {
                    kind: segment.kind.clone(),
                    preview: preview(segment.text(), REASONING_PREVIEW_LIMIT),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

/// Receives run progress. Both callbacks run on the loop's task and must not
/// block; an error or a panic is logged and otherwise ignored.
pub trait RunObserver: Send + Sync {
    fn on_tool_result(&self, _result: &ToolResult) -> Result<(), ObserverError> {
        Ok(())
    }

    fn on_step(&self, _summary: &StepSummary) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Forwards progress as [`AgentStreamEvent`]s.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<AgentStreamEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<AgentStreamEvent>) -> Self {
        Self { sender }
    }

    /// An observer plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentStreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    fn send(&self, event: AgentStreamEvent) -> Result<(), ObserverError> {
        self.sender
            .send(event)
            .map_err(|_| ObserverError("stream receiver dropped".into()))
    }
}

impl RunObserver for ChannelObserver {
    fn on_tool_result(&self, result: &ToolResult) -> Result<(), ObserverError> {
        self.send(AgentStreamEvent::ToolResult(result.clone()))
    }

    fn on_step(&self, summary: &StepSummary) -> Result<(), ObserverError> {
        self.send(AgentStreamEvent::Step(summary.clone()))
    }
}

pub(crate) fn notify_tool_result(observer: Option<&dyn RunObserver>, events: &dyn EventSink, result: &ToolResult) {
    if let Some(observer) = observer {
        guard(events, names::AGENT_TOOL_STREAM_ERROR, || observer.on_tool_result(result));
    }
}

pub(crate) fn notify_step(observer: Option<&dyn RunObserver>, events: &dyn EventSink, summary: &StepSummary) {
    if let Some(observer) = observer {
        guard(events, names::AGENT_STEP_STREAM_ERROR, || observer.on_step(summary));
    }
}

fn guard(events: &dyn EventSink, event: &str, callback: impl FnOnce() -> Result<(), ObserverError>) {
    let (kind, message) = match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => ("ObserverError", err.0),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "observer panicked".into());
            ("Panic", message)
        }
    };
    warn!(event, %message, "Run observer failed");
    events.log_event(event, json!({"error": {"type": kind, "message": message}}));
}
