//! The tool-calling agent loop of taskloop.
//!
//! A run alternates two phases until the model answers in plain text:
//!
//! 1. **Build context**: system prompt, workspace snapshot and as much of
//!    the conversation as fits the token budget
//! 2. **Ask the model** through the configured [`LlmGateway`](taskloop_core::LlmGateway)
//! 3. **Run the tool batch** sequentially, appending one tool message per
//!    call and stopping at the first failure
//!
//! The loop stops early when the thought-step limit or the consecutive
//! tool-error cap is hit, or when the run is cancelled. Every run ends in
//! an [`AgentRunPayload`] carrying the tool records, the reasoning and a
//! per-step LLM trace.

pub mod calls;
pub mod context;
pub mod local_agent;
pub mod loop_runner;
pub mod outcome;
pub mod recorder;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use calls::{SchemaRegistry, ToolCallParser, ValidationFailure};
pub use context::{BuiltContext, ContextBuilder, TrimReport};
pub use local_agent::{AgentError, LocalAgent, RunRequest};
pub use loop_runner::{AgentLoopRunner, LoopLimits};
pub use outcome::{AgentRunPayload, RunDiagnostic, RunOutcome, RunStatus, StopReason};
pub use recorder::RunRecorder;
pub use stream_event::{AgentStreamEvent, ChannelObserver, ObserverError, RunObserver, StepSummary};
