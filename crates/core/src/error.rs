// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for lq-core operations.

use thiserror::Error;

/// All possible errors that can occur in lq-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid function path: '{0}'\n  hint: paths look like 'module:function' or 'dir/module:function'")]
    InvalidFunctionPath(String),

    #[error("function '{name}' is declared as a {declared}, not a {requested}")]
    FunctionKindMismatch {
        name: String,
        declared: String,
        requested: String,
    },

    #[error("function not declared: {0}")]
    UnknownFunction(String),

    #[error("function already declared: {0}")]
    DuplicateFunction(String),

    #[error("invalid arguments: {0}\n  hint: arguments must be a JSON object")]
    InvalidArgs(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for lq-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
