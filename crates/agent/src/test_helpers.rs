//! Shared scripted gateways for unit tests.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use taskloop_core::error::GatewayError;
use taskloop_core::message::Message;
use taskloop_core::provider::{LlmError, LlmGateway, LlmResponse};
use taskloop_core::tool::{ToolCall, ToolGateway};
use tokio_util::sync::CancellationToken;

/// An LLM gateway that returns a sequence of scripted results.
///
/// Panics if more calls are made than results provided.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every message list the loop sent, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmGateway for ScriptedLlm {
    async fn respond(
        &self,
        messages: &[Message],
        _cancellation: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(messages.to_vec());
            requests.len()
        };
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("ScriptedLlm: no more responses (call #{call})"))
    }

    async fn check_health(&self) -> Value {
        json!({"ok": true, "backend": "scripted"})
    }
}

/// A tool gateway answering from per-tool reply queues. The last reply of a
/// queue repeats; tools without replies succeed with an empty result.
#[derive(Default)]
pub struct ScriptedTools {
    replies: Mutex<HashMap<String, VecDeque<Result<Value, GatewayError>>>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
    ready_error: Option<GatewayError>,
    schemas: BTreeMap<String, Value>,
    schema_error: Option<GatewayError>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, tool: &str, reply: Result<Value, GatewayError>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(tool.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn with_ready_error(mut self, error: GatewayError) -> Self {
        self.ready_error = Some(error);
        self
    }

    pub fn with_schema(mut self, tool: &str, schema: Value) -> Self {
        self.schemas.insert(tool.to_string(), schema);
        self
    }

    pub fn with_schema_error(mut self, error: GatewayError) -> Self {
        self.schema_error = Some(error);
        self
    }

    /// Executed calls as `(tool, arguments)`.
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolGateway for ScriptedTools {
    async fn ensure_ready(&self) -> Result<(), GatewayError> {
        match &self.ready_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn call_tool(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(name) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Ok(json!({"ok": true, "result": {}})),
        }
    }

    async fn check_health(&self) -> Value {
        json!({"ok": true, "tools": self.schemas.len()})
    }

    async fn tool_schemas(&self) -> Result<BTreeMap<String, Value>, GatewayError> {
        match &self.schema_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.schemas.clone()),
        }
    }
}

pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments.as_object().cloned().unwrap_or_default())
}

pub fn tool_response(content: &str, calls: Vec<ToolCall>) -> Result<LlmResponse, LlmError> {
    Ok(LlmResponse::text(content).with_tool_calls(calls))
}
