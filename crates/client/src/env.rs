// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access.
//!
//! The variable name constants are generated by `build.rs` and live in the
//! [`vars`] submodule.

use std::path::PathBuf;

/// Generated environment variable name constants.
pub mod vars {
    include!(concat!(env!("OUT_DIR"), "/env_vars.rs"));
}

/// Returns the value of `LIVEQUERY_URL` if set and non-empty.
pub fn deployment_url() -> Option<String> {
    non_empty(vars::LIVEQUERY_URL)
}

/// Returns the value of `LIVEQUERY_CONFIG` if set.
pub fn config_path() -> Option<PathBuf> {
    non_empty(vars::LIVEQUERY_CONFIG).map(PathBuf::from)
}

/// Returns the value of `LIVEQUERY_AUTH_TOKEN` if set and non-empty.
pub fn auth_token() -> Option<String> {
    non_empty(vars::LIVEQUERY_AUTH_TOKEN)
}

/// Returns `true` if `RUST_LOG` is set (any value).
pub fn rust_log_set() -> bool {
    std::env::var(vars::RUST_LOG).is_ok()
}

/// Default config file location: `<config dir>/livequery/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("livequery").join("config.toml"))
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
