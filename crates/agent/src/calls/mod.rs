//! Tool-call handling between the model and the tool gateway: argument
//! decoding, schema validation, and response parsing.

pub mod arguments;
pub mod parser;
pub mod validation;

pub use arguments::{Decoded, FailureClass, InvalidArguments, RecoveryOutcome};
pub use parser::{
    PLACEHOLDER_TOOL_NAME, SalvagedCall, ToolCallParser, dedupe_call_ids, placeholder_call, salvage_calls,
};
pub use validation::{SchemaRegistry, ValidationFailure};
