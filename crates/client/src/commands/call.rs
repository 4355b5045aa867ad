// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use lq_core::{FunctionKind, FunctionRef};
use tracing::debug;

use super::{parse_args, Context};
use crate::cli::CallArgs;
use crate::error::{Error, Result};

/// Runs a mutation or action once and prints its value.
pub async fn run(ctx: &Context, kind: FunctionKind, call: CallArgs) -> Result<()> {
    let function = FunctionRef::new(kind, &call.path)?;
    let args = parse_args(call.args.as_deref())?;
    let client = ctx.connect()?;

    debug!(path = function.path(), %kind, "calling");
    let outcome = match kind {
        FunctionKind::Mutation => client.mutation(function.path(), args).await,
        FunctionKind::Action => client.action(function.path(), args).await,
        FunctionKind::Query => {
            return Err(Error::InvalidArgs(format!(
                "'{}' is a query; use `lq watch`",
                function.path()
            )))
        }
    };
    let closed = client.close().await;

    let value = outcome?;
    closed?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
