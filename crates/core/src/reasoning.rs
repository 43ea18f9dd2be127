//! Reasoning normalizer. Turns streamed "thinking" fragments into stable
//! segments.
//!
//! Models emit reasoning one token (sometimes one character) at a time.
//! Adjacent fragments of the same type are joined; the edge whitespace of the
//! joined text is kept apart from the trimmed core so that the original text
//! can be reconstituted exactly while display and deduplication work on the
//! trimmed form only.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The type assigned to fragments that arrive without one.
pub const DEFAULT_REASONING_TYPE: &str = "reasoning";

/// Text with its edge whitespace tracked separately from the trimmed core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpacedText {
    #[serde(
        rename = "leading_whitespace",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub leading: String,

    #[serde(rename = "text")]
    pub core: String,

    #[serde(
        rename = "trailing_whitespace",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub trailing: String,
}

impl SpacedText {
    /// Split `raw` into leading whitespace, trimmed core and trailing whitespace.
    pub fn from_raw(raw: &str) -> Self {
        let core = raw.trim();
        if core.is_empty() {
            return Self {
                leading: raw.to_string(),
                core: String::new(),
                trailing: String::new(),
            };
        }
        let start = raw.len() - raw.trim_start().len();
        let end = start + core.len();
        Self {
            leading: raw[..start].to_string(),
            core: core.to_string(),
            trailing: raw[end..].to_string(),
        }
    }

    /// Reconstitute the original text.
    pub fn render(&self) -> String {
        format!("{}{}{}", self.leading, self.core, self.trailing)
    }

    pub fn is_blank(&self) -> bool {
        self.core.is_empty()
    }
}

/// One merged unit of model reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningSegment {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub text: SpacedText,
}

impl ReasoningSegment {
    pub fn new(kind: impl Into<String>, raw: &str) -> Self {
        Self {
            kind: normalise_kind(kind.into()),
            text: SpacedText::from_raw(raw),
        }
    }

    /// The trimmed text used for display and deduplication.
    pub fn text(&self) -> &str {
        &self.text.core
    }

    pub fn render(&self) -> String {
        self.text.render()
    }
}

fn normalise_kind(kind: String) -> String {
    let trimmed = kind.trim();
    if trimmed.is_empty() {
        DEFAULT_REASONING_TYPE.to_string()
    } else if trimmed.len() == kind.len() {
        kind
    } else {
        trimmed.to_string()
    }
}

/// Merge raw `(type, text)` fragments into reasoning segments.
///
/// Adjacent fragments of the same type are concatenated before trimming.
/// Groups that are empty after trimming are dropped, and only the first
/// occurrence of each distinct `(type, trimmed text)` pair is kept.
pub fn merge<I, K, T>(fragments: I) -> Vec<ReasoningSegment>
where
    I: IntoIterator<Item = (K, T)>,
    K: Into<String>,
    T: AsRef<str>,
{
    let mut groups: Vec<(String, String)> = Vec::new();
    for (kind, text) in fragments {
        let kind = normalise_kind(kind.into());
        let text = text.as_ref();
        if text.is_empty() {
            continue;
        }
        match groups.last_mut() {
            Some((last_kind, buffer)) if *last_kind == kind => buffer.push_str(text),
            _ => groups.push((kind, text.to_string())),
        }
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut segments = Vec::with_capacity(groups.len());
    for (kind, raw) in groups {
        let segment = ReasoningSegment {
            kind,
            text: SpacedText::from_raw(&raw),
        };
        if segment.text.is_blank() {
            continue;
        }
        if seen.insert((segment.kind.clone(), segment.text.core.clone())) {
            segments.push(segment);
        }
    }
    segments
}

/// Re-normalise segments that were already merged once, e.g. segments
/// reported by a gateway that did its own partial merging.
pub fn normalise(segments: &[ReasoningSegment]) -> Vec<ReasoningSegment> {
    merge(segments.iter().map(|s| (s.kind.clone(), s.render())))
}
