// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use thiserror::Error;

use crate::sync::SyncError;

/// Errors surfaced by the `lq` binary and the library entry points.
///
/// Errors provide user-friendly messages with hints for common issues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no deployment URL configured\n  hint: pass --url, set LIVEQUERY_URL, or add deployment_url to the config file")]
    MissingDeploymentUrl,

    #[error("invalid deployment URL '{url}': {reason}")]
    InvalidDeploymentUrl { url: String, reason: String },

    #[error("invalid arguments: {0}\n  hint: --args takes a JSON object, e.g. '{{\"id\": 1}}'")]
    InvalidArgs(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] lq_core::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for livequery operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
