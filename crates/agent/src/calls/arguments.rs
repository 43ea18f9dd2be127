//! Tool-argument decoding with recovery for concatenated JSON.
//!
//! Some models emit `{"a":1}{"b":2}` instead of one object. When the strict
//! parse fails, the text is read as a sequence of top-level JSON values and
//! the object fragments are shallow-merged in order (later keys win).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskloop_core::event::preview;
use thiserror::Error;

/// Longest argument preview kept in events and errors.
pub const PREVIEW_LIMIT: usize = 200;

/// Why an argument payload could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ConcatenatedJson,
    TrailingGarbage,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConcatenatedJson => "concatenated_json",
            Self::TrailingGarbage => "trailing_garbage",
            Self::Unknown => "unknown",
        }
    }

    fn classify(stripped: &str) -> Self {
        if stripped.is_empty() {
            return Self::Unknown;
        }
        if stripped.contains("}{") || stripped.matches('{').count() > 1 {
            Self::ConcatenatedJson
        } else if !stripped.starts_with(['{', '[']) && stripped.ends_with(['}', ']']) {
            Self::TrailingGarbage
        } else {
            Self::Unknown
        }
    }
}

/// The argument text could not be turned into an object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("LLM returned invalid JSON for tool arguments: {message}")]
pub struct InvalidArguments {
    pub classification: FailureClass,
    /// Trimmed argument text, cut to [`PREVIEW_LIMIT`] characters
    pub preview: String,
    /// Length of the raw text in bytes
    pub length: usize,
    pub line: usize,
    pub column: usize,
    /// Byte offset of the decode error
    pub offset: usize,
    pub message: String,
}

/// How a successful decode got its mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The text was one JSON object (or empty).
    Strict,
    /// The text was a run of concatenated JSON values.
    Recovered {
        fragments: usize,
        empty_fragment_count: usize,
        /// The strict-parse error that triggered recovery
        error: String,
    },
}

impl RecoveryOutcome {
    pub fn classification(&self) -> Option<&'static str> {
        match self {
            Self::Strict => None,
            Self::Recovered { .. } => Some(FailureClass::ConcatenatedJson.as_str()),
        }
    }
}

/// A decoded argument mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub arguments: Map<String, Value>,
    pub outcome: RecoveryOutcome,
}

/// Decode `text` into an argument mapping. Empty text decodes to `{}`.
pub fn decode(text: &str) -> Result<Decoded, InvalidArguments> {
    let stripped = text.trim();
    if stripped.is_empty() {
        return Ok(Decoded {
            arguments: Map::new(),
            outcome: RecoveryOutcome::Strict,
        });
    }

    match serde_json::from_str::<Value>(stripped) {
        Ok(Value::Object(arguments)) => Ok(Decoded {
            arguments,
            outcome: RecoveryOutcome::Strict,
        }),
        Ok(other) => Err(InvalidArguments {
            classification: FailureClass::Unknown,
            preview: preview(stripped, PREVIEW_LIMIT),
            length: text.len(),
            line: 1,
            column: 1,
            offset: 0,
            message: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(err) => match recover(stripped) {
            Some((arguments, fragments, empty_fragment_count)) => Ok(Decoded {
                arguments,
                outcome: RecoveryOutcome::Recovered {
                    fragments,
                    empty_fragment_count,
                    error: err.to_string(),
                },
            }),
            None => Err(InvalidArguments {
                classification: FailureClass::classify(stripped),
                preview: preview(stripped, PREVIEW_LIMIT),
                length: text.len(),
                line: err.line(),
                column: err.column(),
                offset: byte_offset(stripped, err.line(), err.column()),
                message: err.to_string(),
            }),
        },
    }
}

/// Read `text` as back-to-back JSON values. Every fragment must start with
/// `{` or `[`; at least two fragments and one object are required.
fn recover(text: &str) -> Option<(Map<String, Value>, usize, usize)> {
    let mut fragments = Vec::new();
    let mut idx = 0;
    while idx < text.len() {
        let rest = &text[idx..];
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            break;
        }
        idx += rest.len() - trimmed.len();
        if !trimmed.starts_with(['{', '[']) {
            return None;
        }
        let mut stream = serde_json::Deserializer::from_str(trimmed).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => fragments.push(value),
            _ => return None,
        }
        idx += stream.byte_offset();
    }

    if fragments.len() < 2 {
        return None;
    }
    let total = fragments.len();
    let mut merged = Map::new();
    let mut objects = 0;
    let mut empty = 0;
    for fragment in fragments {
        if let Value::Object(map) = fragment {
            objects += 1;
            if map.is_empty() {
                empty += 1;
            }
            merged.extend(map);
        }
    }
    (objects > 0).then_some((merged, total, empty))
}

fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(text.len())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
