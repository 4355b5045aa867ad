// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Query tokens and function results.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Validates function arguments.
///
/// Arguments must be a JSON object; `null` is treated as an empty object.
pub fn validate_args(args: Value) -> Result<Value> {
    match args {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(args),
        other => Err(Error::InvalidArgs(format!(
            "expected object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Deterministic key identifying a `(canonical path, arguments)` pair.
///
/// The token is the JSON text of `{"args": ..., "udfPath": ...}`. Object keys
/// are emitted in sorted order, so equal arguments always produce equal tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryToken(String);

impl QueryToken {
    /// Builds the token for an already-canonicalized path.
    pub fn new(canonical_path: &str, args: &Value) -> Self {
        QueryToken(json!({ "udfPath": canonical_path, "args": args }).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of running a server function.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionResult {
    /// The function returned a value.
    Value(Value),
    /// The function failed with a plain message.
    ErrorMessage(String),
    /// The function failed with a structured error payload.
    ErrorData { message: String, data: Value },
}

impl FunctionResult {
    /// Builds a failure, attaching structured data when present.
    pub fn error(message: impl Into<String>, data: Option<Value>) -> Self {
        match data {
            Some(data) => FunctionResult::ErrorData {
                message: message.into(),
                data,
            },
            None => FunctionResult::ErrorMessage(message.into()),
        }
    }

    /// Returns the success value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            FunctionResult::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "value_tests.rs"]
mod tests;
