//! Tool name and argument validation against JSON schemas.
//!
//! Schemas are compiled once when the registry is built. Validation messages
//! are meant for the model: they name the tool, the offending argument path
//! and the reason, so the model can correct itself on the next step.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// A requested tool call that does not pass validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("Unknown tool: {name}. Available tools: {}", known.join(", "))]
    UnknownTool { name: String, known: Vec<String> },

    #[error("{message}")]
    SchemaViolation { tool: String, message: String },
}

struct CompiledSchema {
    raw: Value,
    validator: jsonschema::Validator,
}

/// Parameter schemas by tool name.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, CompiledSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every schema. A schema that does not compile is skipped
    /// with a warning, leaving that tool unknown.
    pub fn from_schemas(schemas: BTreeMap<String, Value>) -> Self {
        let mut registry = Self::new();
        for (name, schema) in schemas {
            if let Err(reason) = registry.insert(name.clone(), schema) {
                warn!(tool = %name, %reason, "Skipping tool with invalid parameter schema");
            }
        }
        registry
    }

    /// Add or replace one tool schema.
    pub fn insert(&mut self, name: impl Into<String>, schema: Value) -> Result<(), String> {
        let validator = jsonschema::validator_for(&schema).map_err(|e| e.to_string())?;
        self.schemas.insert(
            name.into(),
            CompiledSchema {
                raw: schema,
                validator,
            },
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Known tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    /// Check a tool call, returning the arguments unchanged when valid.
    pub fn validate(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Map<String, Value>, ValidationFailure> {
        let Some(compiled) = self.schemas.get(name) else {
            return Err(ValidationFailure::UnknownTool {
                name: name.to_string(),
                known: self.names(),
            });
        };

        let instance = Value::Object(arguments);
        let mut problems: Vec<String> = Vec::new();
        for error in compiled.validator.iter_errors(&instance) {
            let instance_path = error.instance_path.to_string();
            let schema_path = error.schema_path.to_string();
            collect_problems(
                &compiled.raw,
                &instance,
                &instance_path,
                &schema_path,
                error.to_string(),
                "",
                &mut problems,
            );
        }

        if problems.is_empty() {
            match instance {
                Value::Object(arguments) => Ok(arguments),
                _ => Ok(Map::new()),
            }
        } else {
            Err(ValidationFailure::SchemaViolation {
                tool: name.to_string(),
                message: format!("Invalid arguments for {name}: {}", problems.join("; ")),
            })
        }
    }
}

/// Record one error. `oneOf`/`anyOf` failures say little on their own, so
/// they are replaced by the errors of each alternative.
fn collect_problems(
    schema: &Value,
    instance: &Value,
    instance_path: &str,
    schema_path: &str,
    reason: String,
    prefix: &str,
    out: &mut Vec<String>,
) {
    let full_path = format!("{prefix}{instance_path}");
    let before = out.len();
    if schema_path.ends_with("/oneOf") || schema_path.ends_with("/anyOf") {
        if let (Some(Value::Array(alternatives)), Some(fragment)) =
            (schema.pointer(schema_path), instance.pointer(instance_path))
        {
            for alternative in alternatives {
                let Ok(validator) = jsonschema::validator_for(alternative) else {
                    continue;
                };
                for error in validator.iter_errors(fragment) {
                    collect_problems(
                        alternative,
                        fragment,
                        &error.instance_path.to_string(),
                        &error.schema_path.to_string(),
                        error.to_string(),
                        &full_path,
                        out,
                    );
                }
            }
        }
    }
    if out.len() == before {
        push_unique(out, format!("{}: {reason}", render_path(&full_path)));
    }
}

fn push_unique(out: &mut Vec<String>, problem: String) {
    if !out.contains(&problem) {
        out.push(problem);
    }
}

/// `/labels/0` renders as `labels.0`; the empty pointer as `<root>`.
fn render_path(pointer: &str) -> String {
    if pointer.is_empty() {
        return "<root>".into();
    }
    pointer
        .trim_start_matches('/')
        .split('/')
        .map(|seg| seg.replace("~1", "/").replace("~0", "~"))
        .collect::<Vec<_>>()
        .join(".")
}
