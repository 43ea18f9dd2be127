//! LLM gateway trait: the abstraction over language-model backends.
//!
//! A gateway knows how to send a conversation to a model and return either a
//! structured response or a typed failure. Wire formats, streaming and
//! retries are the adapter's business; the agent loop only sees this trait.

use crate::error::GatewayError;
use crate::message::Message;
use crate::reasoning::ReasoningSegment;
use crate::tool::ToolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A complete response from the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The generated text
    #[serde(default)]
    pub content: String,

    /// Validated tool calls, in the order the model requested them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Reasoning segments reported alongside the answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning: Vec<ReasoningSegment>,

    /// What the gateway actually sent (diagnostics only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_messages: Option<Vec<Message>>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_reasoning(mut self, reasoning: Vec<ReasoningSegment>) -> Self {
        self.reasoning = reasoning;
        self
    }
}

/// The model requested tool calls that could not be decoded or validated.
///
/// Carries the raw call fragments so the loop can reproduce the assistant
/// turn faithfully and answer every call with a validation failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ToolValidationError {
    pub message: String,

    /// Text content of the offending model response
    pub llm_message: String,

    /// Raw tool-call fragments, `{id, type, function: {name, arguments}}`
    pub tool_calls: Vec<serde_json::Value>,

    pub request_messages: Option<Vec<Message>>,

    pub reasoning: Vec<ReasoningSegment>,
}

impl ToolValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            llm_message: String::new(),
            tool_calls: Vec::new(),
            request_messages: None,
            reasoning: Vec::new(),
        }
    }

    pub fn with_llm_message(mut self, llm_message: impl Into<String>) -> Self {
        self.llm_message = llm_message.into();
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<serde_json::Value>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Failures of [`LlmGateway::respond`].
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("{0}")]
    ToolValidation(ToolValidationError),

    #[error(transparent)]
    Transport(#[from] GatewayError),

    #[error("LLM request cancelled")]
    Cancelled,
}

impl From<ToolValidationError> for LlmError {
    fn from(err: ToolValidationError) -> Self {
        Self::ToolValidation(err)
    }
}

/// Every LLM backend implements this trait.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Send the conversation and wait for one complete response.
    async fn respond(
        &self,
        messages: &[Message],
        cancellation: &CancellationToken,
    ) -> Result<LlmResponse, LlmError>;

    /// Report backend health as a status map.
    async fn check_health(&self) -> serde_json::Value;
}
