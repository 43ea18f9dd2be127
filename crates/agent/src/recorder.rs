//! Collects the deterministic artefacts of one run: tool call records,
//! reasoning, and the per-step LLM trace.

use crate::outcome::{
    AgentRunPayload, LlmRequestRecord, LlmStepRecord, RunDiagnostic, RunStatus, StepResponse,
    StopReason,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use taskloop_core::error::ErrorPayload;
use taskloop_core::message::Message;
use taskloop_core::reasoning::{self, ReasoningSegment};
use taskloop_core::tool::{ToolCall, ToolResult, ToolStatus};

/// Per-run bookkeeping owned by the loop runner.
///
/// Every `begin_tool` opens a new record, so a call id the model reuses in a
/// later step gets a record of its own. Marking always targets the newest
/// record for an id.
#[derive(Debug, Default)]
pub struct RunRecorder {
    records: Vec<ToolResult>,
    latest: HashMap<String, usize>,
    excluded: HashSet<usize>,
    last_tool: Option<usize>,
    reasoning: Vec<ReasoningSegment>,
    llm_steps: Vec<LlmStepRecord>,
    llm_requests: Vec<LlmRequestRecord>,
    tool_schemas: BTreeMap<String, Value>,
}

impl RunRecorder {
    pub fn new(tool_schemas: BTreeMap<String, Value>) -> Self {
        Self {
            tool_schemas,
            ..Self::default()
        }
    }

    pub fn record_llm_step(&mut self, step: usize, request_messages: Vec<Message>, response: StepResponse) {
        self.llm_requests.push(LlmRequestRecord {
            step,
            messages: request_messages.clone(),
        });
        self.llm_steps.push(LlmStepRecord {
            step,
            request_messages,
            response,
        });
    }

    pub fn llm_steps(&self) -> &[LlmStepRecord] {
        &self.llm_steps
    }

    /// Append one response's reasoning, normalised.
    pub fn extend_reasoning(&mut self, segments: &[ReasoningSegment]) {
        self.reasoning.extend(reasoning::normalise(segments));
    }

    pub fn reasoning(&self) -> &[ReasoningSegment] {
        &self.reasoning
    }

    /// Open a `running` record and return a snapshot of it.
    pub fn begin_tool(&mut self, call: &ToolCall) -> ToolResult {
        let record = ToolResult::running(call);
        self.records.push(record.clone());
        self.latest.insert(call.id.clone(), self.records.len() - 1);
        record
    }

    pub fn mark_succeeded(&mut self, call: &ToolCall, result: Value) -> ToolResult {
        let index = self.index_for(call);
        self.excluded.remove(&index);
        self.finish(index, |record| record.complete(result))
    }

    /// `include_in_results` is false for calls that never reached the tool
    /// because the gateway was not ready.
    pub fn mark_failed(&mut self, call: &ToolCall, error: ErrorPayload, include_in_results: bool) -> ToolResult {
        let index = self.index_for(call);
        if include_in_results {
            self.excluded.remove(&index);
        } else {
            self.excluded.insert(index);
        }
        self.finish(index, |record| record.fail(error))
    }

    /// The most recently finished tool record.
    pub fn last_tool(&self) -> Option<&ToolResult> {
        self.last_tool.and_then(|index| self.records.get(index))
    }

    /// Records in call order, without the excluded ones.
    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.records
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.excluded.contains(index))
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Payload for a run the model finished. Only completed calls are listed.
    pub fn finalise_success(&self, result_text: &str) -> AgentRunPayload {
        AgentRunPayload {
            ok: true,
            status: RunStatus::Succeeded,
            error: None,
            result: Some(result_text.trim().to_string()),
            tool_results: self
                .tool_results()
                .into_iter()
                .filter(|record| record.agent_status == ToolStatus::Completed)
                .collect(),
            reasoning: self.reasoning.clone(),
            agent_stop_reason: None,
            diagnostic: self.diagnostic(None, None),
        }
    }

    /// Payload for an aborted run. Every recorded call is listed.
    pub fn finalise_failure(
        &self,
        message: &str,
        error: ErrorPayload,
        stop_reason: Option<StopReason>,
    ) -> AgentRunPayload {
        let message = message.trim();
        AgentRunPayload {
            ok: false,
            status: RunStatus::Failed,
            error: Some(error.clone()),
            result: (!message.is_empty()).then(|| message.to_string()),
            tool_results: self.tool_results(),
            reasoning: self.reasoning.clone(),
            agent_stop_reason: stop_reason,
            diagnostic: self.diagnostic(stop_reason, Some(error)),
        }
    }

    fn diagnostic(&self, stop_reason: Option<StopReason>, error: Option<ErrorPayload>) -> Option<RunDiagnostic> {
        let diagnostic = RunDiagnostic {
            llm_requests: self.llm_requests.clone(),
            llm_steps: self.llm_steps.clone(),
            stop_reason,
            tool_schemas: (!self.tool_schemas.is_empty()).then(|| self.tool_schemas.clone()),
            error,
        };
        (!diagnostic.is_empty()).then_some(diagnostic)
    }

    fn index_for(&mut self, call: &ToolCall) -> usize {
        if let Some(index) = self.latest.get(&call.id).copied() {
            return index;
        }
        self.begin_tool(call);
        self.records.len() - 1
    }

    fn finish(&mut self, index: usize, apply: impl FnOnce(ToolResult) -> ToolResult) -> ToolResult {
        let record = apply(self.records[index].clone());
        self.records[index] = record.clone();
        self.last_tool = Some(index);
        record
    }
}
