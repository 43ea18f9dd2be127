//! Message and Conversation domain types.
//!
//! A run's conversation is an append-only log: the loop appends one
//! assistant message per step followed by the tool messages answering that
//! message's calls. The log refuses appends that would break that shape.

use crate::error::ConversationError;
use crate::reasoning::ReasoningSegment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// Fixed instructions and context snapshots
    System,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    #[serde(default = "new_message_id", skip_serializing)]
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// If this is a tool result, the name of the tool that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Reasoning the assistant produced alongside this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning: Vec<ReasoningSegment>,

    /// Timestamp
    #[serde(default = "Utc::now", skip_serializing)]
    pub timestamp: DateTime<Utc>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            reasoning: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(tool_name.into());
        msg
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<MessageToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_reasoning(mut self, reasoning: Vec<ReasoningSegment>) -> Self {
        self.reasoning = reasoning;
        self
    }
}

/// A tool call embedded in an assistant message, in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON text, exactly as they are sent back to the model
    pub arguments: String,
}

/// The tool calls of the newest assistant turn and which of them are answered.
#[derive(Debug, Clone)]
struct OpenBatch {
    call_ids: Vec<String>,
    answered: HashSet<String>,
}

impl OpenBatch {
    fn unanswered(&self) -> Vec<String> {
        self.call_ids
            .iter()
            .filter(|id| !self.answered.contains(*id))
            .cloned()
            .collect()
    }
}

/// An ordered, append-only sequence of messages.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    open_batch: Option<OpenBatch>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            open_batch: None,
        }
    }

    /// Create a conversation seeded with prior messages.
    ///
    /// Seed messages come from earlier runs and are taken as-is; the turn
    /// invariants apply only to what is appended afterwards.
    pub fn seeded(history: impl IntoIterator<Item = Message>) -> Self {
        let mut conv = Self::new();
        conv.messages.extend(history);
        conv
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append the user turn that starts a run.
    pub fn append_user(&mut self, message: Message) -> Result<(), ConversationError> {
        expect_role(&message, Role::User)?;
        self.ensure_batch_settled()?;
        self.push(message);
        Ok(())
    }

    /// Append an assistant turn, opening a tool batch if it requests calls.
    pub fn append_assistant(&mut self, message: Message) -> Result<(), ConversationError> {
        expect_role(&message, Role::Assistant)?;
        self.ensure_batch_settled()?;
        self.open_batch = if message.tool_calls.is_empty() {
            None
        } else {
            Some(OpenBatch {
                call_ids: message.tool_calls.iter().map(|c| c.id.clone()).collect(),
                answered: HashSet::new(),
            })
        };
        self.push(message);
        Ok(())
    }

    /// Append a tool result answering one call of the open assistant turn.
    pub fn append_tool(&mut self, message: Message) -> Result<(), ConversationError> {
        expect_role(&message, Role::Tool)?;
        let call_id = message.tool_call_id.clone().unwrap_or_default();
        let batch = self
            .open_batch
            .as_mut()
            .ok_or_else(|| ConversationError::UnknownToolCall(call_id.clone()))?;
        if !batch.call_ids.contains(&call_id) {
            return Err(ConversationError::UnknownToolCall(call_id));
        }
        if !batch.answered.insert(call_id.clone()) {
            return Err(ConversationError::DuplicateToolResult(call_id));
        }
        self.push(message);
        Ok(())
    }

    /// Close the open tool batch, returning the ids of calls that were never
    /// executed (a batch stops at its first failure).
    pub fn close_batch(&mut self) -> Vec<String> {
        self.open_batch
            .take()
            .map(|batch| batch.unanswered())
            .unwrap_or_default()
    }

    fn ensure_batch_settled(&self) -> Result<(), ConversationError> {
        match &self.open_batch {
            Some(batch) => {
                let pending = batch.unanswered().len();
                if pending == 0 {
                    Ok(())
                } else {
                    Err(ConversationError::UnresolvedBatch(pending))
                }
            }
            None => Ok(()),
        }
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_role(message: &Message, expected: Role) -> Result<(), ConversationError> {
    if message.role == expected {
        Ok(())
    } else {
        Err(ConversationError::WrongRole {
            expected: expected.as_str(),
            actual: message.role.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> MessageToolCall {
        MessageToolCall {
            id: id.into(),
            name: "get_requirement".into(),
            arguments: "{}".into(),
        }
    }

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn message_wire_shape() {
        let msg = Message::tool_result("call_1", "get_requirement", "{}");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "role": "tool",
                "content": "{}",
                "tool_call_id": "call_1",
                "name": "get_requirement"
            })
        );
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn assistant_then_tool_results() {
        let mut conv = Conversation::new();
        conv.append_user(Message::user("hi")).unwrap();
        conv.append_assistant(Message::assistant("").with_tool_calls(vec![call("a"), call("b")]))
            .unwrap();
        conv.append_tool(Message::tool_result("a", "get_requirement", "{}"))
            .unwrap();
        conv.append_tool(Message::tool_result("b", "get_requirement", "{}"))
            .unwrap();
        conv.append_assistant(Message::assistant("done")).unwrap();
        assert_eq!(conv.len(), 5);
    }

    #[test]
    fn tool_result_must_answer_open_call() {
        let mut conv = Conversation::new();
        let err = conv
            .append_tool(Message::tool_result("x", "t", "{}"))
            .unwrap_err();
        assert_eq!(err, ConversationError::UnknownToolCall("x".into()));

        conv.append_assistant(Message::assistant("").with_tool_calls(vec![call("a")]))
            .unwrap();
        conv.append_tool(Message::tool_result("a", "t", "{}")).unwrap();
        let err = conv
            .append_tool(Message::tool_result("a", "t", "{}"))
            .unwrap_err();
        assert_eq!(err, ConversationError::DuplicateToolResult("a".into()));
    }

    #[test]
    fn assistant_refused_while_batch_open() {
        let mut conv = Conversation::new();
        conv.append_assistant(Message::assistant("").with_tool_calls(vec![call("a"), call("b")]))
            .unwrap();
        conv.append_tool(Message::tool_result("a", "t", "{}")).unwrap();
        let err = conv.append_assistant(Message::assistant("next")).unwrap_err();
        assert_eq!(err, ConversationError::UnresolvedBatch(1));

        assert_eq!(conv.close_batch(), vec!["b".to_string()]);
        conv.append_assistant(Message::assistant("next")).unwrap();
    }

    #[test]
    fn wrong_role_is_rejected() {
        let mut conv = Conversation::new();
        let err = conv.append_assistant(Message::user("x")).unwrap_err();
        assert!(matches!(err, ConversationError::WrongRole { expected: "assistant", .. }));
    }

    #[test]
    fn seeded_history_is_kept_in_order() {
        let conv = Conversation::seeded(vec![Message::user("a"), Message::assistant("b")]);
        let roles: Vec<_> = conv.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }
}
