//! # taskloop core
//!
//! Domain types, gateway traits, and error definitions for the taskloop
//! agent orchestration core. This crate knows nothing about the loop itself:
//! it defines the conversation log, the LLM and tool gateway seams, and the
//! event sink the loop reports through.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here. Implementations live in
//! host applications (or in tests as scripted stubs), so the loop can be
//! driven end to end without a network.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{
    ConversationError, ErrorCode, ErrorPayload, GatewayError, OperationCancelled, ToolError,
};
pub use event::{AgentEvent, EventBus, EventSink, MemorySink, TracingSink};
pub use message::{Conversation, Message, MessageToolCall, Role};
pub use provider::{LlmError, LlmGateway, LlmResponse, ToolValidationError};
pub use reasoning::{ReasoningSegment, SpacedText};
pub use tool::{
    Confirmer, Tool, ToolCall, ToolGateway, ToolRegistry, ToolResult, ToolStatus,
};
pub use tokio_util::sync::CancellationToken;
