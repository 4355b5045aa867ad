// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Optimistic query results.
//!
//! The visible result of a query is the last server-confirmed result with
//! every pending optimistic update replayed over it, oldest first. An update
//! is retired when its mutation completes; after that the server's value is
//! shown as-is.
//!
//! An update whose mutation never completes stays applied for the lifetime
//! of the client. It is not expired on a timer.

use std::collections::{HashMap, HashSet};

use lq_core::{canonicalize_path, validate_args, FunctionResult, QueryToken, RequestId};
use serde_json::Value;
use tracing::warn;

/// A client-side prediction of a mutation's effect on query results.
pub type OptimisticUpdate = Box<dyn Fn(&mut OptimisticLocalStore<'_>) + Send + Sync>;

/// A query's result together with what identifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultEntry {
    pub canonical_path: String,
    pub args: Value,
    /// `None` while the query is loading.
    pub result: Option<FunctionResult>,
}

/// Mutable view over query results handed to an [`OptimisticUpdate`].
pub struct OptimisticLocalStore<'a> {
    query_results: &'a mut HashMap<QueryToken, QueryResultEntry>,
    modified_queries: HashSet<QueryToken>,
}

impl<'a> OptimisticLocalStore<'a> {
    fn new(query_results: &'a mut HashMap<QueryToken, QueryResultEntry>) -> Self {
        OptimisticLocalStore {
            query_results,
            modified_queries: HashSet::new(),
        }
    }

    /// The current value of a query, or `None` if it is loading, failed, or
    /// not subscribed.
    pub fn get_query(&self, path: &str, args: Value) -> Option<Value> {
        let token = token_for(path, args)?;
        self.query_results
            .get(&token)
            .and_then(|entry| entry.result.as_ref())
            .and_then(|result| result.value())
            .cloned()
    }

    /// Every known query of `path` as `(args, value)` pairs.
    pub fn get_all_queries(&self, path: &str) -> Vec<(Value, Option<Value>)> {
        let Ok(canonical) = canonicalize_path(path) else {
            return Vec::new();
        };
        let mut queries: Vec<_> = self
            .query_results
            .iter()
            .filter(|(_, entry)| entry.canonical_path == canonical)
            .map(|(token, entry)| {
                let value = entry.result.as_ref().and_then(|r| r.value()).cloned();
                (token, entry.args.clone(), value)
            })
            .collect();
        queries.sort_by(|a, b| a.0.cmp(b.0));
        queries
            .into_iter()
            .map(|(_, args, value)| (args, value))
            .collect()
    }

    /// Overwrites a query's value; `None` makes it loading.
    pub fn set_query(&mut self, path: &str, args: Value, value: Option<Value>) {
        let Ok(canonical_path) = canonicalize_path(path) else {
            warn!(path, "optimistic update used an invalid function path");
            return;
        };
        let Ok(args) = validate_args(args) else {
            warn!(path, "optimistic update used non-object arguments");
            return;
        };
        let token = QueryToken::new(&canonical_path, &args);
        self.query_results.insert(
            token.clone(),
            QueryResultEntry {
                canonical_path,
                args,
                result: value.map(FunctionResult::Value),
            },
        );
        self.modified_queries.insert(token);
    }
}

fn token_for(path: &str, args: Value) -> Option<QueryToken> {
    let canonical = canonicalize_path(path).ok()?;
    let args = validate_args(args).ok()?;
    Some(QueryToken::new(&canonical, &args))
}

#[derive(Default)]
pub struct OptimisticQueryResultsManager {
    query_results: HashMap<QueryToken, QueryResultEntry>,
    optimistic_updates: Vec<(OptimisticUpdate, RequestId)>,
}

impl OptimisticQueryResultsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `update` for `mutation_id` and applies it once.
    ///
    /// Returns the tokens whose visible result the update touched.
    pub fn apply_optimistic_update(
        &mut self,
        update: OptimisticUpdate,
        mutation_id: RequestId,
    ) -> HashSet<QueryToken> {
        let mut store = OptimisticLocalStore::new(&mut self.query_results);
        update(&mut store);
        let modified = store.modified_queries;
        self.optimistic_updates.push((update, mutation_id));
        modified
    }

    /// Replaces the base results with the server's, drops the updates of
    /// `completed` mutations, and replays the rest.
    ///
    /// Returns the tokens whose visible result differs from before, including
    /// tokens that disappeared.
    pub fn ingest_query_results_from_server(
        &mut self,
        server_results: HashMap<QueryToken, QueryResultEntry>,
        completed: &HashSet<RequestId>,
    ) -> HashSet<QueryToken> {
        self.optimistic_updates
            .retain(|(_, mutation_id)| !completed.contains(mutation_id));

        let old_results = std::mem::replace(&mut self.query_results, server_results);
        let mut store = OptimisticLocalStore::new(&mut self.query_results);
        for (update, _) in &self.optimistic_updates {
            update(&mut store);
        }

        let mut changed: HashSet<QueryToken> = self
            .query_results
            .iter()
            .filter(|(token, entry)| {
                old_results
                    .get(*token)
                    .is_none_or(|old| old.result != entry.result)
            })
            .map(|(token, _)| token.clone())
            .collect();
        changed.extend(
            old_results
                .into_keys()
                .filter(|token| !self.query_results.contains_key(token)),
        );
        changed
    }

    /// The visible result for `token`.
    pub fn query_result(&self, token: &QueryToken) -> Option<&FunctionResult> {
        self.query_results
            .get(token)
            .and_then(|entry| entry.result.as_ref())
    }

    pub fn pending_updates(&self) -> usize {
        self.optimistic_updates.len()
    }
}

impl std::fmt::Debug for OptimisticQueryResultsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticQueryResultsManager")
            .field("query_results", &self.query_results)
            .field("pending_updates", &self.optimistic_updates.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "optimistic_tests.rs"]
mod tests;
