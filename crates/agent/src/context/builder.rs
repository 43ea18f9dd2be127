//! Request context assembly.
//!
//! Turns the run's conversation into the message sequence handed to the
//! model:
//!
//! 1. **System**: the fixed instructions plus every workspace context
//!    snapshot, merged into one leading system message. The instructions'
//!    tokens are reserved before history is considered.
//! 2. **History**: the conversation, trimmed from the oldest end so it fits
//!    the remaining budget. The newest message is always sent.
//!
//! Assembly is deterministic: identical inputs give identical outputs.

use crate::context::token;
use serde::{Deserialize, Serialize};
use serde_json::json;
use taskloop_config::normalise_context_tokens;
use taskloop_core::event::{EventSink, names};
use taskloop_core::message::{Message, Role};
use tracing::debug;

/// System messages starting with this marker are context snapshots and are
/// folded into the leading system message.
pub const CONTEXT_SNAPSHOT_PREFIX: &str = "[Workspace context]";

/// What trimming removed from the history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimReport {
    pub dropped_messages: usize,
    pub dropped_tokens: usize,
    pub history_messages_before: usize,
    pub history_messages_after: usize,
    pub history_tokens_before: usize,
    pub history_tokens_after: usize,
    pub max_context_tokens: usize,
    pub system_prompt_tokens: usize,
    pub history_token_budget: usize,
}

/// The assembled request.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    /// Merged system message followed by the kept history.
    pub messages: Vec<Message>,
    pub trim: TrimReport,
}

/// Builds request contexts under a token budget. Stateless between calls.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    system_prompt: String,
    max_context_tokens: usize,
}

impl ContextBuilder {
    /// `max_context_tokens` of `0` selects the default budget; smaller
    /// budgets are raised to the minimum.
    pub fn new(system_prompt: impl Into<String>, max_context_tokens: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            max_context_tokens: normalise_context_tokens(max_context_tokens as i64),
        }
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Assemble the request for `history`, reporting trimming to `events`.
    pub fn build(&self, history: &[Message], events: &dyn EventSink) -> BuiltContext {
        let sanitized: Vec<Message> = history.iter().map(sanitize).collect();

        let reserved = token::estimate_tokens(&self.system_prompt);
        let budget = self.max_context_tokens.saturating_sub(reserved);
        let (kept, mut trim) = trim_history(sanitized, budget);
        trim.max_context_tokens = self.max_context_tokens;
        trim.system_prompt_tokens = reserved;
        trim.history_token_budget = budget;

        if trim.dropped_messages > 0 {
            debug!(
                dropped = trim.dropped_messages,
                kept = trim.history_messages_after,
                budget,
                "Trimmed conversation history"
            );
            events.log_event(
                names::LLM_CONTEXT_TRIMMED,
                serde_json::to_value(&trim).unwrap_or_else(|_| json!({})),
            );
        }

        let mut system_parts = vec![self.system_prompt.clone()];
        let mut ordered = Vec::with_capacity(kept.len() + 1);
        for message in kept {
            if message.role == Role::System {
                if message.content.is_empty() {
                    continue;
                }
                if is_context_snapshot(&message.content) {
                    system_parts.push(message.content);
                    continue;
                }
            }
            ordered.push(message);
        }

        let system_text = system_parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut messages = Vec::with_capacity(ordered.len() + 1);
        messages.push(Message::system(system_text));
        messages.extend(ordered);

        BuiltContext { messages, trim }
    }
}

pub fn is_context_snapshot(content: &str) -> bool {
    content.trim_start().starts_with(CONTEXT_SNAPSHOT_PREFIX)
}

/// Some OpenAI-compatible routers serialize empty strings as `null`, which
/// their templates reject.
fn sanitize(message: &Message) -> Message {
    let mut message = message.clone();
    if matches!(message.role, Role::User | Role::Assistant) && message.content.is_empty() {
        message.content = " ".into();
    }
    message
}

/// Keep the newest messages that fit `budget`, then drop tool results whose
/// assistant turn fell off the front. When nothing but tool results would
/// remain, their assistant turn is kept instead.
fn trim_history(history: Vec<Message>, budget: usize) -> (Vec<Message>, TrimReport) {
    let costs: Vec<usize> = history.iter().map(token::estimate_message_tokens).collect();
    let total_tokens: usize = costs.iter().sum();
    let total_messages = history.len();

    // Newest first; the newest message is kept unconditionally.
    let mut remaining = budget;
    let mut keep_from = total_messages;
    for (idx, cost) in costs.iter().enumerate().rev() {
        if *cost > remaining && keep_from < total_messages {
            break;
        }
        keep_from = idx;
        remaining = remaining.saturating_sub(*cost);
    }

    let leading_orphans = history[keep_from..]
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count();
    if leading_orphans < total_messages - keep_from {
        keep_from += leading_orphans;
    } else if let Some(owner) = owning_assistant(&history, keep_from) {
        // Only tool results are left; their assistant turn comes back even
        // over budget so the request never opens on a tool message.
        keep_from = owner;
    }

    let kept_tokens: usize = costs[keep_from..].iter().sum();
    let kept: Vec<Message> = history.into_iter().skip(keep_from).collect();
    let report = TrimReport {
        dropped_messages: total_messages - kept.len(),
        dropped_tokens: total_tokens - kept_tokens,
        history_messages_before: total_messages,
        history_messages_after: kept.len(),
        history_tokens_before: total_tokens,
        history_tokens_after: kept_tokens,
        ..TrimReport::default()
    };
    (kept, report)
}

/// Index of the assistant turn that issued the tool results starting at
/// `start`, looking back past earlier results of the same batch.
fn owning_assistant(history: &[Message], start: usize) -> Option<usize> {
    history[..start]
        .iter()
        .rposition(|m| m.role != Role::Tool)
        .filter(|&idx| history[idx].role == Role::Assistant && !history[idx].tool_calls.is_empty())
}
