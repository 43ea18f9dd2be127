//! Tool gateway trait, tool call records, and the in-process tool registry.
//!
//! The agent loop never executes tools itself: it hands each validated call
//! to a [`ToolGateway`]. The gateway is usually a remote tool server; the
//! [`ToolRegistry`] is an in-process implementation for embedding and tests.

use crate::error::{ErrorPayload, GatewayError, ToolError};
use crate::message::{Message, MessageToolCall};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// A validated request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Decoded arguments
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// The wire form placed into the assistant message.
    pub fn to_message_call(&self) -> MessageToolCall {
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: Value::Object(self.arguments.clone()).to_string(),
        }
    }
}

/// Lifecycle of one tool call inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
}

/// The record of one tool call, streamed to observers and kept in results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub tool_name: String,
    pub tool_call_id: String,
    #[serde(default)]
    pub tool_arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub agent_status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolResult {
    /// A snapshot for a call that has been dispatched but not answered.
    pub fn running(call: &ToolCall) -> Self {
        Self {
            ok: false,
            tool_name: call.name.clone(),
            tool_call_id: call.id.clone(),
            tool_arguments: call.arguments.clone(),
            result: None,
            error: None,
            agent_status: ToolStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// A failed record for a call that never reached the tool.
    pub fn rejected(call: &ToolCall, error: ErrorPayload) -> Self {
        let mut record = Self::running(call);
        record.started_at = None;
        record.fail(error)
    }

    pub fn complete(mut self, result: Value) -> Self {
        self.ok = true;
        self.result = Some(result);
        self.error = None;
        self.agent_status = ToolStatus::Completed;
        self.finish();
        self
    }

    pub fn fail(mut self, error: ErrorPayload) -> Self {
        self.ok = false;
        self.result = None;
        self.error = Some(error);
        self.agent_status = ToolStatus::Failed;
        self.finish();
        self
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }

    /// The tool message answering this call in the conversation.
    pub fn to_message(&self) -> Message {
        let mut body = Map::new();
        body.insert("ok".into(), json!(self.ok));
        match (&self.result, &self.error) {
            (_, Some(error)) => {
                body.insert("error".into(), error.to_value());
            }
            (Some(result), None) => {
                body.insert("result".into(), result.clone());
            }
            (None, None) => {}
        }
        body.insert("tool_name".into(), json!(self.tool_name));
        body.insert("tool_call_id".into(), json!(self.tool_call_id));
        body.insert(
            "tool_arguments".into(),
            Value::Object(self.tool_arguments.clone()),
        );
        Message::tool_result(
            self.tool_call_id.clone(),
            self.tool_name.clone(),
            Value::Object(body).to_string(),
        )
    }
}

/// The tool-execution backend driven by the agent loop.
///
/// `call_tool` returns the backend's raw envelope. A well-behaved backend
/// answers with an object carrying `ok` and either `result` or `error`;
/// the loop treats anything else as a protocol error.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Make sure the backend is reachable before a call is dispatched.
    async fn ensure_ready(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Execute one named tool call.
    async fn call_tool(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, GatewayError>;

    /// Report backend health as a status map.
    async fn check_health(&self) -> Value;

    /// Parameter schemas of the exposed tools, keyed by tool name.
    async fn tool_schemas(&self) -> Result<BTreeMap<String, Value>, GatewayError> {
        Ok(BTreeMap::new())
    }
}

/// Yes/no prompt consulted before a mutating tool runs.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// A tool implemented inside the process.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "get_requirement").
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Whether the tool changes state and therefore needs confirmation.
    fn is_mutating(&self) -> bool {
        false
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// A registry of in-process tools, usable as a [`ToolGateway`].
///
/// Tool failures are reported in-band as `{ok: false, error}` envelopes,
/// the same way a remote tool server answers.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    confirmer: Option<Arc<dyn Confirmer>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            confirmer: None,
        }
    }

    /// Require confirmation before mutating tools run.
    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Parameter schemas keyed by tool name.
    pub fn schemas(&self) -> BTreeMap<String, Value> {
        self.tools
            .values()
            .map(|t| (t.name().to_string(), t.parameters_schema()))
            .collect()
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    async fn execute(&self, tool: &dyn Tool, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        if tool.is_mutating() {
            if let Some(confirmer) = &self.confirmer {
                let prompt = format!("Allow {} to modify data?", tool.name());
                if !confirmer.confirm(&prompt).await {
                    info!(tool = %tool.name(), "Mutating tool declined");
                    return Err(ToolError::Declined(tool.name().to_string()));
                }
            }
        }
        tool.execute(arguments).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolGateway for ToolRegistry {
    async fn call_tool(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, GatewayError> {
        let tool = self
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("Unknown tool: {name}")))?;
        debug!(tool = %name, "Executing in-process tool");
        match self.execute(tool, arguments).await {
            Ok(result) => Ok(json!({"ok": true, "result": result})),
            Err(e) => Ok(json!({"ok": false, "error": e.to_payload().to_value()})),
        }
    }

    async fn check_health(&self) -> Value {
        let tools: Vec<Value> = self
            .names()
            .into_iter()
            .filter_map(|name| self.get(name))
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "mutating": tool.is_mutating(),
                })
            })
            .collect();
        json!({"ok": true, "tools": tools})
    }

    async fn tool_schemas(&self) -> Result<BTreeMap<String, Value>, GatewayError> {
        Ok(self.schemas())
    }
}
