// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use clap::Parser;
use yare::parameterized;

use super::*;

#[test]
fn parses_global_options_after_subcommand() {
    let cli = Cli::try_parse_from([
        "lq",
        "status",
        "--url",
        "https://happy-otter-123.example.cloud",
        "-v",
    ])
    .unwrap();
    assert!(matches!(cli.command, Command::Status));
    assert_eq!(
        cli.url.as_deref(),
        Some("https://happy-otter-123.example.cloud")
    );
    assert!(cli.verbose);
    assert!(cli.token.is_none());
}

#[parameterized(
    watch = { "watch" },
    mutation = { "mutation" },
    action = { "action" },
)]
fn parses_call_commands(name: &str) {
    let cli = Cli::try_parse_from(["lq", name, "counter:get", "--args", r#"{"n":1}"#]).unwrap();
    let call = match cli.command {
        Command::Watch(call) | Command::Mutation(call) | Command::Action(call) => call,
        Command::Status => panic!("expected a call command"),
    };
    assert_eq!(call.path, "counter:get");
    assert_eq!(call.args.as_deref(), Some(r#"{"n":1}"#));
}

#[test]
fn call_requires_path() {
    assert!(Cli::try_parse_from(["lq", "mutation"]).is_err());
}

#[test]
fn requires_subcommand() {
    assert!(Cli::try_parse_from(["lq"]).is_err());
}

#[test]
fn config_path_is_global() {
    let cli = Cli::try_parse_from(["lq", "--config", "/tmp/lq.toml", "status"]).unwrap();
    assert_eq!(cli.config, Some(PathBuf::from("/tmp/lq.toml")));
}
