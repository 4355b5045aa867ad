// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Client configuration.
//!
//! Configuration is read from a TOML file (see [`crate::env::default_config_path`])
//! and can be overridden from the command line:
//!
//! ```toml
//! deployment_url = "https://happy-otter-123.example.cloud"
//! verbose = false
//! auth_refresh_token_leeway_secs = 10
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a [`crate::sync::SyncClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the deployment (`http://` or `https://`).
    #[serde(default)]
    pub deployment_url: String,
    /// Accept hosts that look like HTTP-actions hosts (`*.site`).
    #[serde(default)]
    pub skip_deployment_url_check: bool,
    /// Log protocol traffic at debug level.
    #[serde(default)]
    pub verbose: bool,
    /// Refresh auth tokens this many seconds before they expire.
    #[serde(default = "default_auth_refresh_token_leeway_secs")]
    pub auth_refresh_token_leeway_secs: u64,
    /// Base reconnect delay for unclassified close reasons.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the reconnect delay before jitter.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Reconnect when the server has been silent this long.
    #[serde(default = "default_server_inactivity_threshold_ms")]
    pub server_inactivity_threshold_ms: u64,
}

fn default_auth_refresh_token_leeway_secs() -> u64 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    16_000
}

fn default_server_inactivity_threshold_ms() -> u64 {
    60_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            deployment_url: String::new(),
            skip_deployment_url_check: false,
            verbose: false,
            auth_refresh_token_leeway_secs: default_auth_refresh_token_leeway_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            server_inactivity_threshold_ms: default_server_inactivity_threshold_ms(),
        }
    }
}

impl ClientConfig {
    /// Creates a config for `deployment_url` with default tuning.
    pub fn new(deployment_url: impl Into<String>) -> Self {
        ClientConfig {
            deployment_url: deployment_url.into(),
            ..Default::default()
        }
    }

    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Writes the config file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Checks the deployment URL and normalizes it (trailing slashes removed).
    pub fn validate(mut self) -> Result<Self> {
        let url = self.deployment_url.trim().trim_end_matches('/').to_string();
        if url.is_empty() {
            return Err(Error::MissingDeploymentUrl);
        }
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| Error::InvalidDeploymentUrl {
                url: url.clone(),
                reason: "must start with http:// or https://".to_string(),
            })?;
        let host = rest.split(['/', ':']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(Error::InvalidDeploymentUrl {
                url: url.clone(),
                reason: "missing host".to_string(),
            });
        }
        if host.ends_with(".site") && !self.skip_deployment_url_check {
            return Err(Error::InvalidDeploymentUrl {
                url: url.clone(),
                reason: "this looks like an HTTP actions URL (.site); use the deployment URL, \
                         or set skip_deployment_url_check"
                    .to_string(),
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(Error::Config(format!(
                "max_backoff_ms ({}) is smaller than initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        self.deployment_url = url;
        Ok(self)
    }

    /// The sync endpoint: `ws(s)://<host>/api/<client version>/sync`.
    pub fn websocket_url(&self) -> String {
        let base = self.deployment_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{}/api/{}/sync", base, env!("CARGO_PKG_VERSION"))
    }

    pub fn auth_refresh_token_leeway(&self) -> Duration {
        Duration::from_secs(self.auth_refresh_token_leeway_secs)
    }

    pub fn server_inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.server_inactivity_threshold_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
