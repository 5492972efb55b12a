//! Conditional execution gate: a CEL expression over the resource stream
//! decides whether a function runs this invocation.
//!
//! Programs are compiled once per distinct expression string and cached for
//! the whole hydration run, so a condition repeated across packages is not
//! recompiled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cel_interpreter::{Context, Program, Value};
use thiserror::Error;

use crate::pkg::manifest::MAX_CONDITION_LEN;
use crate::resource::ResourceNode;

/// Failures of the gate itself. The runner records these as an `error`
/// result and skips the function; the pipeline aborts unless the function
/// deferred failures.
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("condition failed to compile: {0}")]
    Compile(String),
    #[error("condition evaluation failed: {0}")]
    Eval(String),
    #[error("condition evaluated to {0}, expected a boolean")]
    NotBool(&'static str),
    #[error("condition exceeds the maximum supported length")]
    TooLong,
}

#[derive(Default)]
pub struct ConditionEvaluator {
    cache: Mutex<HashMap<String, Arc<Program>>>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `expr` with the variable `resources` bound to the current
    /// input, as a list of JSON-style maps.
    pub fn eval(
        &self,
        expr: &str,
        resources: &[ResourceNode],
    ) -> std::result::Result<bool, ConditionError> {
        if expr.len() > MAX_CONDITION_LEN {
            return Err(ConditionError::TooLong);
        }

        let program = {
            let mut cache = self.cache.lock().unwrap();
            match cache.get(expr) {
                Some(p) => p.clone(),
                None => {
                    let p = Arc::new(
                        Program::compile(expr)
                            .map_err(|e| ConditionError::Compile(e.to_string()))?,
                    );
                    cache.insert(expr.to_string(), p.clone());
                    p
                }
            }
        };

        let mut items = Vec::with_capacity(resources.len());
        for node in resources {
            items.push(
                node.to_json()
                    .map_err(|e| ConditionError::Eval(e.to_string()))?,
            );
        }
        let mut context = Context::default();
        context
            .add_variable("resources", serde_json::Value::Array(items))
            .map_err(|e| ConditionError::Eval(e.to_string()))?;

        match program.execute(&context) {
            Ok(Value::Bool(b)) => Ok(b),
            Ok(other) => Err(ConditionError::NotBool(value_type_name(&other))),
            Err(e) => Err(ConditionError::Eval(e.to_string())),
        }
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::UInt(_) => "uint",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        Value::Null => "null",
        _ => "value",
    }
}
