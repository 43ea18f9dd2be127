//! Response parsing: raw tool-call fragments to validated [`ToolCall`]s.
//!
//! Fragments follow the OpenAI wire shape
//! `{"id": ..., "function": {"name": ..., "arguments": "<json text>"}}`.
//! Gateway adapters hand the fragments of one response to
//! [`ToolCallParser::parse_response`]; any decode or validation failure turns
//! the whole response into a [`ToolValidationError`] that still carries every
//! fragment, so the loop can replay the model's turn faithfully.

use super::arguments::{self, InvalidArguments, RecoveryOutcome};
use super::validation::SchemaRegistry;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use taskloop_core::event::{EventSink, names, preview};
use taskloop_core::message::MessageToolCall;
use taskloop_core::provider::{LlmResponse, ToolValidationError};
use taskloop_core::reasoning::ReasoningSegment;
use taskloop_core::tool::ToolCall;
use tracing::{debug, warn};

/// Name of the synthetic call standing in for a response whose fragments
/// could not be salvaged.
pub const PLACEHOLDER_TOOL_NAME: &str = "__tool_validation_error__";

/// Decodes and validates the tool calls of one model response.
pub struct ToolCallParser<'a> {
    schemas: &'a SchemaRegistry,
    events: &'a dyn EventSink,
}

impl<'a> ToolCallParser<'a> {
    /// An empty schema registry disables validation; arguments are still
    /// decoded.
    pub fn new(schemas: &'a SchemaRegistry, events: &'a dyn EventSink) -> Self {
        Self { schemas, events }
    }

    /// Build the structured response for `content` and its raw fragments.
    pub fn parse_response(
        &self,
        content: &str,
        fragments: &[Value],
        reasoning: Vec<ReasoningSegment>,
    ) -> Result<LlmResponse, ToolValidationError> {
        match self.parse(fragments) {
            Ok(tool_calls) => Ok(LlmResponse::text(content)
                .with_tool_calls(tool_calls)
                .with_reasoning(reasoning)),
            Err(mut err) => {
                err.llm_message = content.to_string();
                err.reasoning = reasoning;
                Err(err)
            }
        }
    }

    /// Parse every fragment in order. The first failure aborts the parse.
    pub fn parse(&self, fragments: &[Value]) -> Result<Vec<ToolCall>, ToolValidationError> {
        let mut calls = Vec::with_capacity(fragments.len());
        for (index, fragment) in fragments.iter().enumerate() {
            match self.parse_one(index, fragment) {
                Ok(call) => calls.push(call),
                Err(message) => {
                    warn!(index, %message, "Rejected tool call from LLM response");
                    return Err(ToolValidationError::new(message).with_tool_calls(fragments.to_vec()));
                }
            }
        }
        Ok(calls)
    }

    fn parse_one(&self, index: usize, fragment: &Value) -> Result<ToolCall, String> {
        let function = fragment.get("function").and_then(Value::as_object);
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| "LLM response did not include a tool name".to_string())?;
        let call_id = fragment_id(fragment, index);

        let arguments = match function.and_then(|f| f.get("arguments")) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(Value::String(text)) => self.decode(text, &call_id, name)?,
            Some(other) => {
                return Err(format!(
                    "LLM returned invalid JSON for tool arguments: expected a JSON object, got {other}"
                ));
            }
        };

        let arguments = if self.schemas.is_empty() {
            arguments
        } else {
            self.schemas
                .validate(name, arguments)
                .map_err(|failure| failure.to_string())?
        };
        Ok(ToolCall::new(call_id, name, arguments))
    }

    fn decode(&self, text: &str, call_id: &str, tool_name: &str) -> Result<Map<String, Value>, String> {
        match arguments::decode(text) {
            Ok(decoded) => {
                if let RecoveryOutcome::Recovered {
                    fragments,
                    empty_fragment_count,
                    error,
                } = &decoded.outcome
                {
                    debug!(call_id, tool_name, fragments, "Recovered concatenated tool arguments");
                    let mut keys: Vec<&String> = decoded.arguments.keys().collect();
                    keys.sort();
                    let payload = json!({
                        "call_id": call_id,
                        "tool_name": tool_name,
                        "length": text.len(),
                        "classification": decoded.outcome.classification(),
                        "fragments": fragments,
                        "empty_fragments": empty_fragment_count,
                        "preview": preview(text, arguments::PREVIEW_LIMIT),
                        "error": {"message": error},
                        "recovered_keys": keys,
                    });
                    self.events
                        .log_event(names::LLM_TOOL_ARGUMENTS_RECOVERED, payload.clone());
                    let mut detail = payload;
                    detail["arguments_text"] = json!(text);
                    detail["recovered_arguments"] = Value::Object(decoded.arguments.clone());
                    self.events
                        .log_debug_payload(names::LLM_TOOL_ARGUMENTS_RECOVERED, detail);
                }
                Ok(decoded.arguments)
            }
            Err(err) => {
                self.report_invalid(text, call_id, tool_name, &err);
                Err(err.to_string())
            }
        }
    }

    fn report_invalid(&self, text: &str, call_id: &str, tool_name: &str, err: &InvalidArguments) {
        let payload = json!({
            "call_id": call_id,
            "tool_name": tool_name,
            "length": err.length,
            "classification": err.classification.as_str(),
            "preview": err.preview,
            "error": {"message": err.message},
        });
        self.events
            .log_event(names::LLM_TOOL_ARGUMENTS_INVALID, payload.clone());
        let mut detail = payload;
        detail["arguments_text"] = json!(text);
        detail["line"] = json!(err.line);
        detail["column"] = json!(err.column);
        detail["offset"] = json!(err.offset);
        self.events
            .log_debug_payload(names::LLM_TOOL_ARGUMENTS_INVALID, detail);
    }
}

/// A call rebuilt from the fragments of a rejected response.
#[derive(Debug, Clone, PartialEq)]
pub struct SalvagedCall {
    pub call: ToolCall,
    /// The fragment as it goes back into the assistant message, with the
    /// argument text kept as the model sent it.
    pub wire: MessageToolCall,
}

/// Rebuild what can be rebuilt from rejected fragments. Fragments that are
/// not objects or have no function name are skipped. Arguments that do not
/// decode to one object leave the call with an empty mapping. Repeated ids
/// are renamed.
pub fn salvage_calls(fragments: &[Value]) -> Vec<SalvagedCall> {
    let mut salvaged = fragments
        .iter()
        .enumerate()
        .filter_map(|(index, fragment)| {
            let function = fragment.as_object()?.get("function")?.as_object()?;
            let name = function.get("name")?.as_str().filter(|n| !n.is_empty())?;
            let text = match function.get("arguments") {
                None | Some(Value::Null) => "{}".to_string(),
                Some(Value::String(raw)) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() { "{}".to_string() } else { trimmed.to_string() }
                }
                Some(other) => other.to_string(),
            };
            let arguments = arguments::decode(&text)
                .map(|decoded| decoded.arguments)
                .unwrap_or_default();
            let id = fragment_id(fragment, index);
            Some(SalvagedCall {
                wire: MessageToolCall {
                    id: id.clone(),
                    name: name.to_string(),
                    arguments: text,
                },
                call: ToolCall::new(id, name, arguments),
            })
        })
        .collect::<Vec<_>>();
    dedupe_call_ids(salvaged.iter_mut().map(|s| &mut s.call.id));
    for s in &mut salvaged {
        s.wire.id.clone_from(&s.call.id);
    }
    salvaged
}

/// Rename repeated call ids so every result can be matched to its call.
/// A repeat of `id` at position `index` becomes `{id}_{index}`, with the
/// suffix bumped while that name is still taken.
pub fn dedupe_call_ids<'a>(ids: impl IntoIterator<Item = &'a mut String>) {
    let mut ids: Vec<&mut String> = ids.into_iter().collect();
    let mut taken: HashSet<String> = ids.iter().map(|id| id.to_string()).collect();
    let mut seen = HashSet::new();
    for (index, id) in ids.iter_mut().enumerate() {
        if seen.insert(id.to_string()) {
            continue;
        }
        let mut suffix = index;
        let mut renamed = format!("{id}_{suffix}");
        while taken.contains(&renamed) {
            suffix += 1;
            renamed = format!("{id}_{suffix}");
        }
        debug!(call_id = %id, renamed = %renamed, "Renamed repeated tool call id");
        taken.insert(renamed.clone());
        seen.insert(renamed.clone());
        **id = renamed;
    }
}

/// The stand-in call used when nothing could be salvaged. `step` is the
/// number of the step being recorded.
pub fn placeholder_call(step: usize) -> SalvagedCall {
    let call = ToolCall::new(
        format!("validation_error_step_{step}"),
        PLACEHOLDER_TOOL_NAME,
        Map::new(),
    );
    SalvagedCall {
        wire: MessageToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: "{}".into(),
        },
        call,
    }
}

fn fragment_id(fragment: &Value, index: usize) -> String {
    ["id", "tool_call_id"]
        .iter()
        .filter_map(|key| fragment.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("tool_call_{index}"))
}
