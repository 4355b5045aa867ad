// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use super::Context;
use crate::sync::auth::token_suffix;

pub fn run(ctx: &Context) {
    print!("{}", render(ctx));
}

/// Describes the resolved settings without connecting.
pub fn render(ctx: &Context) -> String {
    let config = &ctx.config;
    let config_file = ctx
        .config_file
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "(none)".to_string());
    let auth = match &ctx.token {
        Some(token) => format!("static token (...{})", token_suffix(token)),
        None => "none".to_string(),
    };
    format!(
        "deployment: {}\n\
         websocket:  {}\n\
         config:     {}\n\
         auth:       {}\n\
         backoff:    {}ms initial, {}ms max\n\
         inactivity: {}ms\n",
        config.deployment_url,
        config.websocket_url(),
        config_file,
        auth,
        config.initial_backoff_ms,
        config.max_backoff_ms,
        config.server_inactivity_threshold_ms,
    )
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
