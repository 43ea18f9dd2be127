//! Request context assembly.
//!
//! Every model step sends one leading system message followed by the
//! newest slice of the conversation that fits the token budget.

pub mod builder;
pub mod snapshot;
pub mod token;

pub use builder::{BuiltContext, CONTEXT_SNAPSHOT_PREFIX, ContextBuilder, TrimReport, is_context_snapshot};
pub use snapshot::enrich_snapshots;
