// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

pub mod call;
pub mod status;
pub mod watch;

use std::path::PathBuf;

use lq_core::FunctionResult;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::env;
use crate::error::{Error, Result};
use crate::sync::SyncClient;

/// Settings resolved from flags, environment and the config file, in that
/// order of precedence.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: ClientConfig,
    pub config_file: Option<PathBuf>,
    pub token: Option<String>,
}

impl Context {
    pub fn resolve(
        config_flag: Option<PathBuf>,
        url_flag: Option<String>,
        token_flag: Option<String>,
    ) -> Result<Self> {
        let (mut config, config_file) = match config_flag.or_else(env::config_path) {
            Some(path) => (ClientConfig::load(&path)?, Some(path)),
            None => match env::default_config_path().filter(|path| path.exists()) {
                Some(path) => (ClientConfig::load(&path)?, Some(path)),
                None => (ClientConfig::default(), None),
            },
        };
        if let Some(url) = url_flag.or_else(env::deployment_url) {
            config.deployment_url = url;
        }
        Ok(Context {
            config: config.validate()?,
            config_file,
            token: token_flag.or_else(env::auth_token),
        })
    }

    /// Starts a client; must run inside the tokio runtime.
    pub fn connect(&self) -> Result<SyncClient> {
        let client = SyncClient::new(self.config.clone())?;
        if let Some(token) = &self.token {
            let token = token.clone();
            client.set_auth(
                move |_force_refresh: bool| {
                    let token = token.clone();
                    async move { Some(token) }
                },
                |authenticated: bool| {
                    if authenticated {
                        info!("authenticated");
                    } else {
                        warn!("server rejected the auth token");
                    }
                },
            )?;
        }
        Ok(client)
    }
}

/// Parses `--args`; absent means `{}`.
pub fn parse_args(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(json!({}));
    };
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::InvalidArgs(format!("not JSON: {e}")))?;
    lq_core::validate_args(value).map_err(|e| match e {
        lq_core::Error::InvalidArgs(reason) => Error::InvalidArgs(reason),
        other => other.into(),
    })
}

/// JSON form of a query result for line-oriented output.
pub fn result_json(result: &FunctionResult) -> Value {
    match result {
        FunctionResult::Value(value) => value.clone(),
        FunctionResult::ErrorMessage(message) => json!({ "error": message }),
        FunctionResult::ErrorData { message, data } => json!({ "error": message, "data": data }),
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
