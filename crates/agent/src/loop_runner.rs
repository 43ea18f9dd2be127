//! The agent loop: alternate model steps and tool batches until the model
//! answers without tools, a limit is hit, or the run is cancelled.

use crate::calls::{SalvagedCall, dedupe_call_ids, placeholder_call, salvage_calls};
use crate::context::ContextBuilder;
use crate::outcome::{AgentRunPayload, RunOutcome, StepResponse, StopReason, TracedToolCall};
use crate::recorder::RunRecorder;
use crate::stream_event::{self, RunObserver, StepSummary};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use taskloop_config::{AgentSettings, DEFAULT_MAX_CONSECUTIVE_TOOL_ERRORS, DEFAULT_SYSTEM_PROMPT};
use taskloop_core::error::{ConversationError, ErrorCode, ErrorPayload, GatewayError};
use taskloop_core::event::{EventSink, TracingSink, names, preview};
use taskloop_core::message::{Conversation, Message};
use taskloop_core::provider::{LlmError, LlmGateway, LlmResponse, ToolValidationError};
use taskloop_core::reasoning;
use taskloop_core::tool::{ToolCall, ToolGateway, ToolResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard limits of one run. `None` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_thought_steps: Option<usize>,
    pub max_consecutive_tool_errors: Option<usize>,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_thought_steps: None,
            max_consecutive_tool_errors: Some(DEFAULT_MAX_CONSECUTIVE_TOOL_ERRORS),
        }
    }
}

impl LoopLimits {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            max_thought_steps: settings.thought_step_limit(),
            max_consecutive_tool_errors: settings.consecutive_tool_error_limit(),
        }
    }
}

/// Why the loop stopped before producing a payload.
enum Halt {
    Cancelled,
    Broken(ConversationError),
}

impl From<ConversationError> for Halt {
    fn from(err: ConversationError) -> Self {
        Self::Broken(err)
    }
}

enum StepResult {
    Finished(AgentRunPayload),
    Aborted(AgentRunPayload),
    /// A tool batch ran; carries the error that stopped it, if any.
    Batch(Option<ErrorPayload>),
}

/// Drives one run over an exclusively owned [`Conversation`].
pub struct AgentLoopRunner {
    llm: Arc<dyn LlmGateway>,
    tools: Arc<dyn ToolGateway>,
    events: Arc<dyn EventSink>,
    observer: Option<Arc<dyn RunObserver>>,
    context: ContextBuilder,
    cancellation: CancellationToken,
    limits: LoopLimits,
    conversation: Conversation,
    recorder: RunRecorder,
    step: usize,
    consecutive_tool_errors: usize,
    last_response: Option<LlmResponse>,
}

impl AgentLoopRunner {
    /// A runner over `conversation`, whose last message is the user turn.
    pub fn new(llm: Arc<dyn LlmGateway>, tools: Arc<dyn ToolGateway>, conversation: Conversation) -> Self {
        Self {
            llm,
            tools,
            events: Arc::new(TracingSink),
            observer: None,
            context: ContextBuilder::new(DEFAULT_SYSTEM_PROMPT, 0),
            cancellation: CancellationToken::new(),
            limits: LoopLimits::default(),
            conversation,
            recorder: RunRecorder::default(),
            step: 0,
            consecutive_tool_errors: 0,
            last_response: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_context_builder(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_limits(mut self, limits: LoopLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Tool schemas to attach to the run diagnostic.
    pub fn with_tool_schemas(mut self, schemas: BTreeMap<String, Value>) -> Self {
        self.recorder = RunRecorder::new(schemas);
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Completed model steps.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Run to completion. A conversation invariant violation is a bug in
    /// the caller's seed history or in the loop and is returned as `Err`.
    pub async fn run(&mut self) -> Result<RunOutcome, ConversationError> {
        match self.run_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(Halt::Cancelled) => {
                info!(step = self.step, "Agent run cancelled");
                Ok(RunOutcome::Cancelled)
            }
            Err(Halt::Broken(err)) => Err(err),
        }
    }

    async fn run_inner(&mut self) -> Result<RunOutcome, Halt> {
        loop {
            self.check_cancelled()?;
            if self.reached_step_limit() {
                return Ok(RunOutcome::Aborted(self.abort_due_to_step_limit()));
            }

            match self.step_once().await? {
                StepResult::Finished(payload) => return Ok(RunOutcome::Succeeded(payload)),
                StepResult::Aborted(payload) => return Ok(RunOutcome::Aborted(payload)),
                StepResult::Batch(None) => self.consecutive_tool_errors = 0,
                StepResult::Batch(Some(error)) => {
                    self.consecutive_tool_errors += 1;
                    debug!(
                        consecutive = self.consecutive_tool_errors,
                        code = %error.code,
                        "Tool batch failed"
                    );
                    if let Some(limit) = self.limits.max_consecutive_tool_errors
                        && self.consecutive_tool_errors >= limit
                    {
                        return Ok(RunOutcome::Aborted(self.abort_due_to_tool_errors(limit, error)));
                    }
                }
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), Halt> {
        if self.cancellation.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn reached_step_limit(&self) -> bool {
        self.limits
            .max_thought_steps
            .is_some_and(|limit| self.step >= limit)
    }

    async fn step_once(&mut self) -> Result<StepResult, Halt> {
        let built = self.context.build(self.conversation.messages(), self.events.as_ref());
        debug!(step = self.step + 1, messages = built.messages.len(), "Requesting LLM step");

        match self.llm.respond(&built.messages, &self.cancellation).await {
            Ok(mut response) => {
                if response.request_messages.is_none() {
                    response.request_messages = Some(built.messages);
                }
                self.handle_response(response).await
            }
            Err(LlmError::ToolValidation(err)) => self.handle_validation_error(err, built.messages),
            Err(LlmError::Cancelled) => Err(Halt::Cancelled),
            Err(LlmError::Transport(err)) => Ok(StepResult::Aborted(self.abort_due_to_transport(err))),
        }
    }

    async fn handle_response(&mut self, mut response: LlmResponse) -> Result<StepResult, Halt> {
        dedupe_call_ids(response.tool_calls.iter_mut().map(|call| &mut call.id));
        let traced = response
            .tool_calls
            .iter()
            .map(|call| TracedToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: Value::Object(call.arguments.clone()),
            })
            .collect();
        self.register_response(&response, traced);

        let assistant = Message::assistant(response.content.clone())
            .with_tool_calls(response.tool_calls.iter().map(ToolCall::to_message_call).collect())
            .with_reasoning(reasoning::normalise(&response.reasoning));
        self.conversation.append_assistant(assistant)?;
        self.advance_step(&response);

        if response.tool_calls.is_empty() {
            info!(steps = self.step, "Agent run finished");
            return Ok(StepResult::Finished(self.recorder.finalise_success(&response.content)));
        }

        let mut batch_error = None;
        for call in &response.tool_calls {
            self.check_cancelled()?;
            let (message, error) = self.run_tool_call(call).await;
            self.conversation.append_tool(message)?;
            if error.is_some() {
                batch_error = error;
                break;
            }
            self.check_cancelled()?;
        }

        let skipped = self.conversation.close_batch();
        if !skipped.is_empty() {
            debug!(skipped = ?skipped, "Tool batch stopped early");
        }
        Ok(StepResult::Batch(batch_error))
    }

    /// Execute one call and return its tool message plus the error, if it
    /// failed.
    async fn run_tool_call(&mut self, call: &ToolCall) -> (Message, Option<ErrorPayload>) {
        let snapshot = self.recorder.begin_tool(call);
        self.notify_tool(&snapshot);
        self.events.log_event(
            names::AGENT_TOOL_CALL,
            json!({
                "call_id": call.id,
                "tool_name": call.name,
                "arguments": call.arguments,
            }),
        );
        info!(tool = %call.name, call_id = %call.id, "Executing tool call");

        if let Err(err) = self.tools.ensure_ready().await {
            return self.fail_tool(call, err.to_payload(), false);
        }

        match self.tools.call_tool(&call.name, &call.arguments).await {
            Err(err) => self.fail_tool(call, err.to_payload(), true),
            Ok(Value::Object(reply)) => {
                if reply.get("ok") == Some(&Value::Bool(true)) {
                    let result = reply.get("result").cloned().unwrap_or(Value::Null);
                    let snapshot = self.recorder.mark_succeeded(call, result);
                    self.notify_tool(&snapshot);
                    debug!(tool = %call.name, duration_ms = ?snapshot.duration_ms, "Tool call completed");
                    (snapshot.to_message(), None)
                } else {
                    let error = ErrorPayload::from_value(reply.get("error").unwrap_or(&Value::Null));
                    self.fail_tool(call, error, true)
                }
            }
            Ok(other) => {
                let error = ErrorPayload::new(
                    ErrorCode::PROTOCOL_ERROR,
                    format!("Tool {} returned a non-object result", call.name),
                )
                .with_detail("type", json!("ProtocolError"))
                .with_detail("result", other);
                self.fail_tool(call, error, true)
            }
        }
    }

    fn fail_tool(&mut self, call: &ToolCall, error: ErrorPayload, include_in_results: bool) -> (Message, Option<ErrorPayload>) {
        warn!(tool = %call.name, call_id = %call.id, code = %error.code, "Tool call failed: {}", error.message);
        let snapshot = self.recorder.mark_failed(call, error.clone(), include_in_results);
        self.notify_tool(&snapshot);
        self.log_error(&error);
        (snapshot.to_message(), Some(error))
    }

    /// Answer every call of a rejected response with a validation failure,
    /// so the model sees its own turn and the reason it was refused.
    fn handle_validation_error(&mut self, err: ToolValidationError, sent: Vec<Message>) -> Result<StepResult, Halt> {
        let mut salvaged = salvage_calls(&err.tool_calls);
        if salvaged.is_empty() {
            salvaged.push(placeholder_call(self.step + 1));
        }
        let request_messages = err.request_messages.clone().unwrap_or(sent);
        let reasoning = reasoning::normalise(&err.reasoning);
        warn!(step = self.step + 1, calls = salvaged.len(), "LLM tool calls rejected: {}", err.message);
        self.events.log_debug_payload(
            names::AGENT_VALIDATION_ERROR,
            json!({
                "message": err.message,
                "llm_message": err.llm_message,
                "tool_calls": salvaged.iter().map(wire_fragment).collect::<Vec<_>>(),
                "request_messages": request_messages
                    .iter()
                    .map(|m| {
                        let mut value = serde_json::to_value(m).unwrap_or(Value::Null);
                        value["content"] = json!(preview(&m.content, stream_event::MESSAGE_PREVIEW_LIMIT));
                        value
                    })
                    .collect::<Vec<_>>(),
                "reasoning": reasoning
                    .iter()
                    .map(|s| json!({
                        "type": s.kind,
                        "text": preview(s.text(), stream_event::REASONING_PREVIEW_LIMIT),
                    }))
                    .collect::<Vec<_>>(),
            }),
        );

        let response = LlmResponse {
            content: err.llm_message.clone(),
            tool_calls: salvaged.iter().map(|s| s.call.clone()).collect(),
            reasoning: reasoning.clone(),
            request_messages: Some(request_messages),
        };
        let traced = salvaged
            .iter()
            .map(|s| TracedToolCall {
                id: s.wire.id.clone(),
                name: s.wire.name.clone(),
                arguments: Value::String(s.wire.arguments.clone()),
            })
            .collect();
        self.register_response(&response, traced);

        let mut error = ErrorPayload::new(ErrorCode::VALIDATION_ERROR, err.message.clone())
            .with_detail("type", json!("ToolValidationError"));
        if !err.llm_message.is_empty() {
            error = error.with_detail("llm_message", json!(err.llm_message));
        }
        self.log_error(&error);

        let assistant = Message::assistant(err.llm_message.clone())
            .with_tool_calls(salvaged.iter().map(|s| s.wire.clone()).collect())
            .with_reasoning(reasoning);
        self.conversation.append_assistant(assistant)?;
        for SalvagedCall { call, .. } in &salvaged {
            let running = self.recorder.begin_tool(call);
            self.notify_tool(&running);
            let failed = self.recorder.mark_failed(call, error.clone(), true);
            self.notify_tool(&failed);
            self.conversation.append_tool(failed.to_message())?;
        }
        self.advance_step(&response);
        Ok(StepResult::Batch(Some(error)))
    }

    fn register_response(&mut self, response: &LlmResponse, tool_calls: Vec<TracedToolCall>) {
        let step = self.step + 1;
        let request_messages = response
            .request_messages
            .clone()
            .unwrap_or_else(|| self.conversation.messages().to_vec());
        let step_response = StepResponse {
            content: response.content.clone(),
            tool_calls,
            reasoning: reasoning::normalise(&response.reasoning),
        };
        self.recorder
            .record_llm_step(step, request_messages, step_response);
        if let Some(record) = self.recorder.llm_steps().last() {
            self.events.log_debug_payload(
                names::AGENT_STEP_DETAIL,
                serde_json::to_value(record).unwrap_or(Value::Null),
            );
        }
        self.recorder.extend_reasoning(&response.reasoning);
        self.last_response = Some(response.clone());
    }

    fn advance_step(&mut self, response: &LlmResponse) {
        self.step += 1;
        let summary = StepSummary::from_response(self.step, response);
        stream_event::notify_step(self.observer.as_deref(), self.events.as_ref(), &summary);
    }

    fn notify_tool(&self, snapshot: &ToolResult) {
        stream_event::notify_tool_result(self.observer.as_deref(), self.events.as_ref(), snapshot);
    }

    fn log_error(&self, error: &ErrorPayload) {
        self.events
            .log_event(names::ERROR, json!({"error": error.to_value()}));
    }

    fn abort_due_to_step_limit(&self) -> AgentRunPayload {
        let limit = self.limits.max_thought_steps.unwrap_or(self.step);
        let last_calls: Vec<&ToolCall> = self
            .last_response
            .as_ref()
            .map(|r| r.tool_calls.iter().collect())
            .unwrap_or_default();

        let last_call = match last_calls.last() {
            Some(call) => Some((call.name.clone(), Value::Object(call.arguments.clone()).to_string())),
            None => self
                .recorder
                .last_tool()
                .map(|tool| (tool.tool_name.clone(), Value::Object(tool.tool_arguments.clone()).to_string())),
        };
        let message = match last_call {
            Some((name, arguments)) => format!(
                "LLM did not finish interaction within allowed steps ({limit}); last tool call {name} with arguments {arguments}"
            ),
            None => format!("LLM did not finish interaction within allowed steps ({limit})"),
        };
        warn!(steps = self.step, limit, "Step limit reached");

        let mut error = ErrorPayload::new(ErrorCode::VALIDATION_ERROR, message.clone())
            .with_detail("type", json!("ToolValidationError"));
        if let Some(content) = self.last_response.as_ref().map(|r| &r.content).filter(|c| !c.is_empty()) {
            error = error.with_detail("llm_message", json!(content));
        }
        if !last_calls.is_empty() {
            let calls: Vec<Value> = last_calls
                .iter()
                .map(|c| json!({"id": c.id, "name": c.name, "arguments": c.arguments}))
                .collect();
            error = error.with_detail("llm_tool_calls", Value::Array(calls));
        }
        let tool_results = self.recorder.tool_results();
        if !tool_results.is_empty() {
            error = error.with_detail(
                "tool_results",
                serde_json::to_value(&tool_results).unwrap_or(Value::Null),
            );
        }
        self.log_error(&error);

        let stop = StopReason::MaxSteps {
            count: self.step,
            max_thought_steps: limit,
        };
        self.recorder.finalise_failure(&message, error, Some(stop))
    }

    fn abort_due_to_tool_errors(&self, limit: usize, error: ErrorPayload) -> AgentRunPayload {
        warn!(count = self.consecutive_tool_errors, limit, "Too many consecutive tool errors");
        let stop = StopReason::ConsecutiveToolErrors {
            count: self.consecutive_tool_errors,
            max_consecutive_tool_errors: limit,
        };
        self.recorder.finalise_failure("", error, Some(stop))
    }

    fn abort_due_to_transport(&self, err: GatewayError) -> AgentRunPayload {
        warn!(error = %err, "LLM request failed");
        let error = err.to_payload();
        self.log_error(&error);
        self.recorder.finalise_failure(&err.to_string(), error, None)
    }
}

fn wire_fragment(salvaged: &SalvagedCall) -> Value {
    json!({
        "id": salvaged.wire.id,
        "type": "function",
        "function": {"name": salvaged.wire.name, "arguments": salvaged.wire.arguments},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_event::{AgentStreamEvent, ChannelObserver};
    use crate::test_helpers::{ScriptedLlm, ScriptedTools, call, tool_response};
    use taskloop_core::event::MemorySink;
    use taskloop_core::message::Role;
    use taskloop_core::tool::ToolStatus;

    struct Harness {
        llm: Arc<ScriptedLlm>,
        tools: Arc<ScriptedTools>,
        sink: Arc<MemorySink>,
    }

    impl Harness {
        fn new(responses: Vec<Result<LlmResponse, LlmError>>, tools: ScriptedTools) -> Self {
            Self {
                llm: Arc::new(ScriptedLlm::new(responses)),
                tools: Arc::new(tools),
                sink: Arc::new(MemorySink::new()),
            }
        }

        fn runner(&self, limits: LoopLimits) -> AgentLoopRunner {
            let mut conversation = Conversation::new();
            conversation.append_user(Message::user("do the thing")).unwrap();
            AgentLoopRunner::new(self.llm.clone(), self.tools.clone(), conversation)
                .with_events(self.sink.clone())
                .with_limits(limits)
        }
    }

    fn limits(steps: Option<usize>, errors: Option<usize>) -> LoopLimits {
        LoopLimits {
            max_thought_steps: steps,
            max_consecutive_tool_errors: errors,
        }
    }

    #[tokio::test]
    async fn text_response_finishes_the_run() {
        let harness = Harness::new(vec![Ok(LlmResponse::text("  done \n"))], ScriptedTools::new());
        let mut runner = harness.runner(LoopLimits::default());
        let outcome = runner.run().await.unwrap();

        let RunOutcome::Succeeded(payload) = outcome else {
            panic!("expected success");
        };
        assert!(payload.ok);
        assert_eq!(payload.result_text(), "done");
        assert!(payload.tool_results.is_empty());
        assert_eq!(runner.step(), 1);
        assert_eq!(runner.conversation().len(), 2);
        assert_eq!(runner.conversation().last().unwrap().role, Role::Assistant);

        let diagnostic = payload.diagnostic.unwrap();
        assert_eq!(diagnostic.llm_steps.len(), 1);
        assert_eq!(diagnostic.llm_requests[0].step, 1);
        // system prompt + user turn
        assert_eq!(diagnostic.llm_requests[0].messages.len(), 2);
        assert_eq!(harness.sink.named(names::AGENT_STEP_DETAIL).len(), 1);
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_step() {
        let tools = ScriptedTools::new().with_reply(
            "get_requirement",
            Ok(json!({"ok": true, "result": {"rid": "SYS1", "title": "Telemetry"}})),
        );
        let harness = Harness::new(
            vec![
                tool_response("", vec![call("c1", "get_requirement", json!({"rid": "SYS1"}))]),
                Ok(LlmResponse::text("SYS1 is Telemetry")),
            ],
            tools,
        );
        let mut runner = harness.runner(LoopLimits::default());
        let payload = runner.run().await.unwrap().into_payload().unwrap();

        assert!(payload.ok);
        assert_eq!(payload.tool_results.len(), 1);
        assert_eq!(payload.tool_results[0].agent_status, ToolStatus::Completed);
        assert_eq!(payload.tool_results[0].result, Some(json!({"rid": "SYS1", "title": "Telemetry"})));

        let second_request = &harness.llm.requests()[1];
        let tool_message = second_request.last().unwrap();
        assert_eq!(tool_message.role, Role::Tool);
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
        let body: Value = serde_json::from_str(&tool_message.content).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["result"]["title"], "Telemetry");
        assert_eq!(body["tool_arguments"]["rid"], "SYS1");

        let tool_calls = harness.sink.named(names::AGENT_TOOL_CALL);
        assert_eq!(tool_calls[0].payload["tool_name"], "get_requirement");
    }

    #[tokio::test]
    async fn repeated_call_ids_are_renamed() {
        let tools = ScriptedTools::new()
            .with_reply("get_requirement", Ok(json!({"ok": true, "result": {"rid": "SYS1"}})))
            .with_reply("list", Ok(json!({"ok": true, "result": {"items": []}})));
        let harness = Harness::new(
            vec![
                tool_response(
                    "",
                    vec![
                        call("call_0", "get_requirement", json!({"rid": "SYS1"})),
                        call("call_0", "list", json!({})),
                    ],
                ),
                Ok(LlmResponse::text("both done")),
            ],
            tools,
        );
        let mut runner = harness.runner(LoopLimits::default());
        let payload = runner.run().await.unwrap().into_payload().unwrap();

        assert!(payload.ok);
        assert_eq!(payload.result_text(), "both done");
        assert_eq!(harness.tools.calls().len(), 2);
        assert_eq!(harness.llm.call_count(), 2);
        let ids: Vec<_> = payload.tool_results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, ["call_0", "call_0_1"]);

        let second_request = &harness.llm.requests()[1];
        let assistant = &second_request[second_request.len() - 3];
        let wire_ids: Vec<_> = assistant.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(wire_ids, ["call_0", "call_0_1"]);
        assert_eq!(second_request.last().unwrap().tool_call_id.as_deref(), Some("call_0_1"));
    }

    #[tokio::test]
    async fn batch_stops_at_first_failure() {
        let tools = ScriptedTools::new().with_reply(
            "update",
            Ok(json!({"ok": false, "error": {"code": "CONFLICT", "message": "stale revision"}})),
        );
        let harness = Harness::new(
            vec![
                tool_response(
                    "",
                    vec![
                        call("c1", "update", json!({})),
                        call("c2", "get_requirement", json!({})),
                    ],
                ),
                Ok(LlmResponse::text("gave up")),
            ],
            tools,
        );
        let mut runner = harness.runner(LoopLimits::default());
        let payload = runner.run().await.unwrap().into_payload().unwrap();

        assert!(payload.ok);
        assert!(payload.tool_results.is_empty());
        assert_eq!(harness.tools.calls().len(), 1);
        let roles: Vec<_> = runner.conversation().messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        let errors = harness.sink.named(names::ERROR);
        assert_eq!(errors[0].payload["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn failure_without_error_object_is_unknown() {
        let tools = ScriptedTools::new().with_reply("list", Ok(json!({"ok": false})));
        let harness = Harness::new(
            vec![tool_response("", vec![call("c1", "list", json!({}))])],
            tools,
        );
        let mut runner = harness.runner(limits(None, Some(1)));
        let payload = runner.run().await.unwrap().into_payload().unwrap();
        let error = payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::UNKNOWN);
        assert_eq!(error.message, "Tool returned failure without error payload");
    }

    #[tokio::test]
    async fn non_object_result_is_protocol_error() {
        let tools = ScriptedTools::new().with_reply("list", Ok(json!(["a", "b"])));
        let harness = Harness::new(
            vec![tool_response("", vec![call("c1", "list", json!({}))])],
            tools,
        );
        let mut runner = harness.runner(limits(None, Some(1)));
        let payload = runner.run().await.unwrap().into_payload().unwrap();
        assert_eq!(payload.error.unwrap().code, ErrorCode::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn ready_failure_is_kept_out_of_results() {
        let tools = ScriptedTools::new().with_ready_error(GatewayError::NotReady("server starting".into()));
        let harness = Harness::new(
            vec![tool_response("", vec![call("c1", "list", json!({}))])],
            tools,
        );
        let mut runner = harness.runner(limits(None, Some(1)));
        let outcome = runner.run().await.unwrap();

        let RunOutcome::Aborted(payload) = outcome else {
            panic!("expected abort");
        };
        assert!(payload.tool_results.is_empty());
        assert!(harness.tools.calls().is_empty());
        assert_eq!(
            payload.agent_stop_reason,
            Some(StopReason::ConsecutiveToolErrors {
                count: 1,
                max_consecutive_tool_errors: 1
            })
        );
        assert_eq!(runner.conversation().last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn raised_tool_error_is_structured() {
        let tools = ScriptedTools::new().with_reply("get", Err(GatewayError::NotFound("SYS9".into())));
        let harness = Harness::new(
            vec![tool_response("", vec![call("c1", "get", json!({"rid": "SYS9"}))])],
            tools,
        );
        let mut runner = harness.runner(limits(None, Some(1)));
        let payload = runner.run().await.unwrap().into_payload().unwrap();

        assert_eq!(payload.tool_results.len(), 1);
        let record = &payload.tool_results[0];
        assert_eq!(record.agent_status, ToolStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().code, ErrorCode::NOT_FOUND);
        assert_eq!(payload.error.unwrap().message, "SYS9");
    }

    #[tokio::test]
    async fn successful_batch_resets_error_count() {
        let tools = ScriptedTools::new()
            .with_reply("flaky", Err(GatewayError::Network("reset".into())))
            .with_reply("flaky", Ok(json!({"ok": true, "result": 1})))
            .with_reply("flaky", Err(GatewayError::Network("reset".into())));
        let harness = Harness::new(
            vec![
                tool_response("", vec![call("c1", "flaky", json!({}))]),
                tool_response("", vec![call("c2", "flaky", json!({}))]),
                tool_response("", vec![call("c3", "flaky", json!({}))]),
                Ok(LlmResponse::text("finished")),
            ],
            tools,
        );
        let mut runner = harness.runner(limits(None, Some(2)));
        let payload = runner.run().await.unwrap().into_payload().unwrap();
        assert!(payload.ok);
        assert_eq!(payload.result_text(), "finished");
        assert_eq!(payload.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn step_limit_message_names_last_call() {
        let harness = Harness::new(
            vec![
                tool_response("Looking", vec![call("c1", "get", json!({"rid": "SYS1"}))]),
                tool_response("Looking again", vec![call("c2", "get", json!({"rid": "SYS2"}))]),
            ],
            ScriptedTools::new(),
        );
        let mut runner = harness.runner(limits(Some(2), None));
        let outcome = runner.run().await.unwrap();

        let RunOutcome::Aborted(payload) = outcome else {
            panic!("expected abort");
        };
        assert_eq!(harness.llm.call_count(), 2);
        assert_eq!(
            payload.result_text(),
            r#"LLM did not finish interaction within allowed steps (2); last tool call get with arguments {"rid":"SYS2"}"#
        );
        let error = payload.error.clone().unwrap();
        assert_eq!(error.code, ErrorCode::VALIDATION_ERROR);
        let details = error.details.unwrap();
        assert_eq!(details["type"], "ToolValidationError");
        assert_eq!(details["llm_message"], "Looking again");
        assert_eq!(details["llm_tool_calls"][0]["id"], "c2");
        assert_eq!(details["tool_results"].as_array().unwrap().len(), 2);
        assert_eq!(
            payload.agent_stop_reason,
            Some(StopReason::MaxSteps {
                count: 2,
                max_thought_steps: 2
            })
        );
    }

    #[tokio::test]
    async fn validation_error_is_answered_in_place() {
        let err = ToolValidationError::new("Invalid arguments for update: value: 5 is not of type \"string\"")
            .with_llm_message("Updating")
            .with_tool_calls(vec![json!({
                "id": "c1",
                "type": "function",
                "function": {"name": "update", "arguments": "{\"value\": 5}"}
            })]);
        let harness = Harness::new(
            vec![Err(err.into()), Ok(LlmResponse::text("fixed"))],
            ScriptedTools::new(),
        );
        let mut runner = harness.runner(LoopLimits::default());
        let payload = runner.run().await.unwrap().into_payload().unwrap();
        assert!(payload.ok);
        assert!(harness.tools.calls().is_empty());

        let messages = runner.conversation().messages();
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Updating");
        assert_eq!(messages[1].tool_calls[0].arguments, "{\"value\": 5}");
        assert_eq!(messages[2].role, Role::Tool);
        let body: Value = serde_json::from_str(&messages[2].content).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"]["type"], "ToolValidationError");
        assert_eq!(body["error"]["details"]["llm_message"], "Updating");
        assert_eq!(body["tool_arguments"]["value"], 5);

        let diagnostic = payload.diagnostic.unwrap();
        assert_eq!(diagnostic.llm_steps[0].response.tool_calls[0].arguments, json!("{\"value\": 5}"));
        assert_eq!(harness.sink.named(names::AGENT_VALIDATION_ERROR).len(), 1);
    }

    #[tokio::test]
    async fn validation_error_without_fragments_uses_placeholder() {
        let err = ToolValidationError::new("LLM response did not include a tool name");
        let harness = Harness::new(vec![Err(err.into())], ScriptedTools::new());
        let mut runner = harness.runner(limits(None, Some(1)));
        let payload = runner.run().await.unwrap().into_payload().unwrap();

        assert!(!payload.ok);
        assert_eq!(payload.tool_results[0].tool_call_id, "validation_error_step_1");
        assert_eq!(payload.tool_results[0].tool_name, crate::calls::PLACEHOLDER_TOOL_NAME);
        assert_eq!(runner.conversation().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_after_tool_call_stops_the_run() {
        struct CancelOnResult(CancellationToken);
        impl RunObserver for CancelOnResult {
            fn on_tool_result(&self, result: &ToolResult) -> Result<(), crate::stream_event::ObserverError> {
                if result.agent_status == ToolStatus::Completed {
                    self.0.cancel();
                }
                Ok(())
            }
        }

        let token = CancellationToken::new();
        let harness = Harness::new(
            vec![tool_response(
                "",
                vec![call("c1", "list", json!({})), call("c2", "list", json!({}))],
            )],
            ScriptedTools::new(),
        );
        let mut runner = harness
            .runner(LoopLimits::default())
            .with_cancellation(token.clone())
            .with_observer(Arc::new(CancelOnResult(token)));
        let outcome = runner.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert_eq!(harness.tools.calls().len(), 1);
    }

    #[tokio::test]
    async fn observer_sees_snapshots_and_steps() {
        let (observer, mut rx) = ChannelObserver::channel();
        let harness = Harness::new(
            vec![
                tool_response("", vec![call("c1", "list", json!({"page": 1}))]),
                Ok(LlmResponse::text("done")),
            ],
            ScriptedTools::new(),
        );
        let mut runner = harness
            .runner(LoopLimits::default())
            .with_observer(Arc::new(observer));
        runner.run().await.unwrap();
        drop(runner);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                AgentStreamEvent::ToolResult(r) => {
                    format!("tool:{}", serde_json::to_value(r.agent_status).unwrap().as_str().unwrap())
                }
                AgentStreamEvent::Step(s) => format!("step:{}", s.step),
            });
        }
        assert_eq!(kinds, vec!["step:1", "tool:running", "tool:completed", "step:2"]);
    }

    #[tokio::test]
    async fn transport_error_aborts_without_retry() {
        let harness = Harness::new(
            vec![Err(GatewayError::Unauthorized("bad key".into()).into())],
            ScriptedTools::new(),
        );
        let mut runner = harness.runner(LoopLimits::default());
        let outcome = runner.run().await.unwrap();
        let RunOutcome::Aborted(payload) = outcome else {
            panic!("expected abort");
        };
        assert_eq!(payload.error.unwrap().code, ErrorCode::UNAUTHORIZED);
        assert_eq!(harness.llm.call_count(), 1);
        assert_eq!(runner.step(), 0);
    }
}
