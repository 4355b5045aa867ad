// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! lqrs - A real-time sync client for livequery deployments.
//!
//! This crate provides the engine behind the `lq` CLI: a client that keeps
//! one WebSocket open to a deployment, subscribes to queries, runs mutations
//! with optimistic updates, and stays authenticated across reconnects.
//!
//! # Main Components
//!
//! - [`SyncClient`] - Handle to the background sync worker
//! - [`QuerySubscription`] - A live query result
//! - [`ClientConfig`] - Deployment URL and connection tuning
//! - [`Error`] - Error types for configuration and CLI operations
//!
//! ```rust,ignore
//! use lqrs::{ClientConfig, SyncClient};
//!
//! let client = SyncClient::new(ClientConfig::new("https://happy-otter-123.example.cloud"))?;
//! let mut messages = client.subscribe("messages:list", json!({})).await?;
//! while let Some(result) = messages.changed().await? {
//!     println!("{result:?}");
//! }
//! ```

mod cli;
mod commands;

pub mod config;
pub mod env;
pub mod error;
pub mod sync;

pub use cli::{CallArgs, Cli, Command};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use sync::{
    ActionOptions, ConnectionState, FunctionError, MutationOptions, QuerySubscription,
    SubscribeOptions, SyncClient, SyncClientBuilder, SyncError, SyncResult,
};

use std::future::Future;

use lq_core::FunctionKind;
use tracing_subscriber::EnvFilter;

use commands::Context;

/// Execute a CLI invocation. Configuration is resolved before logging is
/// set up so that `verbose` in the config file takes effect.
pub fn run(cli: Cli) -> Result<()> {
    let ctx = Context::resolve(cli.config, cli.url, cli.token)?;
    setup_logging(cli.verbose || ctx.config.verbose);

    match cli.command {
        Command::Status => {
            commands::status::run(&ctx);
            Ok(())
        }
        Command::Watch(call) => block_on(commands::watch::run(&ctx, call)),
        Command::Mutation(call) => {
            block_on(commands::call::run(&ctx, FunctionKind::Mutation, call))
        }
        Command::Action(call) => block_on(commands::call::run(&ctx, FunctionKind::Action, call)),
    }
}

fn block_on<F>(future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(future)
}

/// `RUST_LOG` wins; otherwise `debug` for this crate when verbose.
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "lqrs=debug,lq_core=debug,info"
    } else {
        "info"
    }
}

fn setup_logging(verbose: bool) {
    let filter = if env::rust_log_set() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)))
    } else {
        EnvFilter::new(default_filter(verbose))
    };
    // A subscriber may already be installed when embedded.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
