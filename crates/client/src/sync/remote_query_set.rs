// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The server-confirmed query results.
//!
//! A fresh set is created for every connection. Transitions must start at the
//! exact version the set is at; anything else means the client and server
//! disagree about history and the connection cannot continue.

use std::collections::HashMap;

use lq_core::{FunctionResult, QueryId, StateModification, StateVersion, Timestamp};
use tracing::info;

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid transition: expected start version {expected:?}, got {actual:?}")]
pub struct VersionMismatch {
    pub expected: StateVersion,
    pub actual: StateVersion,
}

#[derive(Debug, Default)]
pub struct RemoteQuerySet {
    version: StateVersion,
    remote_query_set: HashMap<QueryId, FunctionResult>,
}

impl RemoteQuerySet {
    pub fn new() -> Self {
        Self {
            version: StateVersion::initial(),
            remote_query_set: HashMap::new(),
        }
    }

    /// Applies a server transition.
    ///
    /// On error nothing is modified.
    pub fn transition(
        &mut self,
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: &[StateModification],
    ) -> Result<(), VersionMismatch> {
        if start_version != self.version {
            return Err(VersionMismatch {
                expected: self.version,
                actual: start_version,
            });
        }

        for modification in modifications {
            match modification {
                StateModification::QueryUpdated {
                    query_id,
                    value,
                    log_lines,
                    ..
                } => {
                    log_function_lines(*query_id, log_lines);
                    self.remote_query_set
                        .insert(*query_id, FunctionResult::Value(value.clone()));
                }
                StateModification::QueryFailed {
                    query_id,
                    error_message,
                    log_lines,
                    error_data,
                    ..
                } => {
                    log_function_lines(*query_id, log_lines);
                    self.remote_query_set.insert(
                        *query_id,
                        FunctionResult::error(error_message.clone(), error_data.clone()),
                    );
                }
                StateModification::QueryRemoved { query_id } => {
                    self.remote_query_set.remove(query_id);
                }
            }
        }
        self.version = end_version;
        Ok(())
    }

    pub fn remote_query_results(&self) -> &HashMap<QueryId, FunctionResult> {
        &self.remote_query_set
    }

    pub fn version(&self) -> StateVersion {
        self.version
    }

    pub fn timestamp(&self) -> Timestamp {
        self.version.ts
    }
}

fn log_function_lines(query_id: QueryId, lines: &[String]) {
    for line in lines {
        info!(query_id, "[query] {}", line);
    }
}

#[cfg(test)]
#[path = "remote_query_set_tests.rs"]
mod tests;
