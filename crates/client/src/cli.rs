// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

const QUICKSTART_HELP: &str = "\
Get started:
  lq --url https://happy-otter-123.example.cloud status
  lq watch messages:list --args '{\"channel\": \"general\"}'
  lq mutation messages:send --args '{\"body\": \"hi\"}'";

#[derive(Parser, Debug)]
#[command(name = "lq", version)]
#[command(about = "Real-time sync client for livequery deployments")]
#[command(after_help = QUICKSTART_HELP)]
pub struct Cli {
    /// Config file (default: <config dir>/livequery/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Deployment URL (overrides LIVEQUERY_URL and the config file)
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Static auth token (overrides LIVEQUERY_AUTH_TOKEN)
    #[arg(long, global = true, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Log protocol traffic
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// A function path with its JSON arguments.
#[derive(Args, Debug, Clone)]
pub struct CallArgs {
    /// Function path, e.g. `messages:list`
    pub path: String,

    /// Arguments as a JSON object
    #[arg(long, short = 'a', value_name = "JSON")]
    pub args: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Subscribe to a query and print each new result as a JSON line
    Watch(CallArgs),

    /// Run a mutation and print its result
    Mutation(CallArgs),

    /// Run an action and print its result
    Action(CallArgs),

    /// Show the resolved configuration without connecting
    Status,
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
