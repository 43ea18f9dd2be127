//! Observability events: fire-and-forget notifications from the agent loop.
//!
//! Components report what happened through an [`EventSink`]. Sinks never
//! fail the caller: a sink that cannot deliver an event drops it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Names of the events emitted by the orchestration core.
pub mod names {
    pub const AGENT_START: &str = "AGENT_START";
    pub const AGENT_RESULT: &str = "AGENT_RESULT";
    pub const AGENT_CANCELLED: &str = "AGENT_CANCELLED";
    pub const AGENT_TOOL_CALL: &str = "AGENT_TOOL_CALL";
    pub const AGENT_STEP_DETAIL: &str = "AGENT_STEP_DETAIL";
    pub const AGENT_VALIDATION_ERROR: &str = "AGENT_VALIDATION_ERROR";
    pub const AGENT_TOOL_STREAM_ERROR: &str = "AGENT_TOOL_STREAM_ERROR";
    pub const AGENT_STEP_STREAM_ERROR: &str = "AGENT_STEP_STREAM_ERROR";
    pub const LLM_CONTEXT_TRIMMED: &str = "LLM_CONTEXT_TRIMMED";
    pub const LLM_TOOL_ARGUMENTS_RECOVERED: &str = "LLM_TOOL_ARGUMENTS_RECOVERED";
    pub const LLM_TOOL_ARGUMENTS_INVALID: &str = "LLM_TOOL_ARGUMENTS_INVALID";
    pub const MCP_SCHEMA_ERROR: &str = "MCP_SCHEMA_ERROR";
    pub const ERROR: &str = "ERROR";
}

/// Trimmed `text` cut to `limit` characters, the last one an ellipsis.
///
/// Every preview placed into an event payload goes through here.
pub fn preview(text: &str, limit: usize) -> String {
    let snippet = text.trim();
    if snippet.chars().count() <= limit {
        return snippet.to_string();
    }
    let mut cut: String = snippet.chars().take(limit.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

/// Receiver of observability events.
pub trait EventSink: Send + Sync {
    /// Record a named event.
    fn log_event(&self, name: &str, payload: Value);

    /// Record a bulky diagnostic payload (request snapshots and the like).
    fn log_debug_payload(&self, name: &str, payload: Value);
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub name: String,
    pub payload: Value,
    /// Whether this came through `log_debug_payload`
    #[serde(default)]
    pub debug: bool,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    fn new(name: &str, payload: Value, debug: bool) -> Self {
        Self {
            name: name.to_string(),
            payload,
            debug,
            timestamp: Utc::now(),
        }
    }
}

/// Forwards events to `tracing` under the `taskloop::events` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log_event(&self, name: &str, payload: Value) {
        tracing::info!(target: "taskloop::events", event = %name, payload = %payload);
    }

    fn log_debug_payload(&self, name: &str, payload: Value) {
        tracing::debug!(target: "taskloop::events", event = %name, payload = %payload);
    }
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Subscribers
/// that fall behind lose the oldest events.
pub struct EventBus {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn log_event(&self, name: &str, payload: Value) {
        self.publish(AgentEvent::new(name, payload, false));
    }

    fn log_debug_payload(&self, name: &str, payload: Value) {
        self.publish(AgentEvent::new(name, payload, true));
    }
}

/// Keeps every event in memory. Handy for tests and for embedding hosts
/// that render a run's event log after the fact.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AgentEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events with the given name, in emission order.
    pub fn named(&self, name: &str) -> Vec<AgentEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }

    fn push(&self, event: AgentEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl EventSink for MemorySink {
    fn log_event(&self, name: &str, payload: Value) {
        self.push(AgentEvent::new(name, payload, false));
    }

    fn log_debug_payload(&self, name: &str, payload: Value) {
        self.push(AgentEvent::new(name, payload, true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_trims_and_cuts_with_ellipsis() {
        assert_eq!(preview("  short \n", 10), "short");
        let cut = preview(&"é".repeat(50), 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with('…'));
        assert!(cut.starts_with("ééé"));
    }
    use serde_json::json;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.log_event(names::AGENT_TOOL_CALL, json!({"tool_name": "get_requirement"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, names::AGENT_TOOL_CALL);
        assert_eq!(event.payload["tool_name"], "get_requirement");
        assert!(!event.debug);
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.log_debug_payload(names::AGENT_STEP_DETAIL, json!({"step": 1}));
    }

    #[test]
    fn memory_sink_filters_by_name() {
        let sink = MemorySink::new();
        sink.log_event(names::AGENT_START, json!({}));
        sink.log_event(names::ERROR, json!({"code": "X"}));
        sink.log_debug_payload(names::AGENT_STEP_DETAIL, json!({}));

        assert_eq!(sink.events().len(), 3);
        let errors = sink.named(names::ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["code"], "X");
        assert!(sink.named(names::AGENT_STEP_DETAIL)[0].debug);
    }
}
