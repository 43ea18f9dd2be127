//! Run results: the payload every run resolves to, and the outcome enum the
//! loop runner returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use taskloop_core::error::ErrorPayload;
use taskloop_core::message::Message;
use taskloop_core::reasoning::ReasoningSegment;
use taskloop_core::tool::ToolResult;

/// Why a run stopped before the model finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StopReason {
    #[serde(rename = "max-steps")]
    MaxSteps {
        count: usize,
        max_thought_steps: usize,
    },

    #[serde(rename = "consecutive_tool_errors")]
    ConsecutiveToolErrors {
        count: usize,
        max_consecutive_tool_errors: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// A tool call as the model requested it, in trace form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedToolCall {
    pub id: String,
    pub name: String,
    /// The decoded mapping, or the raw text when it never decoded
    pub arguments: Value,
}

/// The model's side of one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<TracedToolCall>,
    #[serde(default)]
    pub reasoning: Vec<ReasoningSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStepRecord {
    pub step: usize,
    pub request_messages: Vec<Message>,
    pub response: StepResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequestRecord {
    pub step: usize,
    pub messages: Vec<Message>,
}

/// Replay data attached to a run result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDiagnostic {
    #[serde(default)]
    pub llm_requests: Vec<LlmRequestRecord>,
    #[serde(default)]
    pub llm_steps: Vec<LlmStepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_schemas: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl RunDiagnostic {
    pub fn is_empty(&self) -> bool {
        self.llm_requests.is_empty()
            && self.llm_steps.is_empty()
            && self.stop_reason.is_none()
            && self.tool_schemas.is_none()
            && self.error.is_none()
    }
}

/// The single result shape of a finished (not cancelled) run.
///
/// `ok` is `false` exactly when the run was aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunPayload {
    pub ok: bool,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    #[serde(default)]
    pub reasoning: Vec<ReasoningSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<RunDiagnostic>,
}

impl AgentRunPayload {
    /// A failed payload for an error that happened outside the loop proper.
    pub fn failure(message: impl Into<String>, error: ErrorPayload) -> Self {
        let message = message.into();
        Self {
            ok: false,
            status: RunStatus::Failed,
            error: Some(error.clone()),
            result: (!message.trim().is_empty()).then(|| message.trim().to_string()),
            tool_results: Vec::new(),
            reasoning: Vec::new(),
            agent_stop_reason: None,
            diagnostic: Some(RunDiagnostic {
                error: Some(error),
                ..RunDiagnostic::default()
            }),
        }
    }

    /// The final text, empty when the run produced none.
    pub fn result_text(&self) -> &str {
        self.result.as_deref().unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// How the loop runner finished.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The model answered without requesting tools.
    Succeeded(AgentRunPayload),
    /// A limit was hit or an unrecoverable error occurred.
    Aborted(AgentRunPayload),
    /// The cancellation token fired.
    Cancelled,
}

impl RunOutcome {
    pub fn payload(&self) -> Option<&AgentRunPayload> {
        match self {
            Self::Succeeded(payload) | Self::Aborted(payload) => Some(payload),
            Self::Cancelled => None,
        }
    }

    pub fn into_payload(self) -> Option<AgentRunPayload> {
        match self {
            Self::Succeeded(payload) | Self::Aborted(payload) => Some(payload),
            Self::Cancelled => None,
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.payload().and_then(|p| p.agent_stop_reason)
    }
}
