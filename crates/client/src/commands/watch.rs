// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use lq_core::{FunctionResult, FunctionRef};
use tracing::{info, warn};

use super::{parse_args, result_json, Context};
use crate::cli::CallArgs;
use crate::error::Result;

/// Subscribes to a query and prints every new result until interrupted.
pub async fn run(ctx: &Context, call: CallArgs) -> Result<()> {
    let function = FunctionRef::query(&call.path)?;
    let args = parse_args(call.args.as_deref())?;
    let client = ctx.connect()?;
    let mut subscription = client.subscribe(function.path(), args).await?;

    if let Some(result) = subscription.local_result() {
        print_result(&result)?;
    }
    loop {
        tokio::select! {
            changed = subscription.changed() => match changed {
                Ok(Some(result)) => print_result(&result)?,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "subscription ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    subscription.unsubscribe();
    client.close().await?;
    Ok(())
}

fn print_result(result: &FunctionResult) -> Result<()> {
    println!("{}", serde_json::to_string(&result_json(result))?);
    Ok(())
}
