// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Correlates mutations and actions with their responses.
//!
//! Every request owns a oneshot sender that is resolved exactly once. Actions
//! resolve as soon as their response arrives. A successful mutation is held
//! as `Completed` until the query results reach the timestamp it committed
//! at, so its caller never observes success before its effects are visible.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use lq_core::protocol::response_outcome;
use lq_core::{ClientMessage, FunctionResult, RequestId, ServerMessage, Timestamp};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::client::{FunctionError, SyncError, SyncResult};

/// Channel on which a request's caller waits for its outcome.
pub type ResponseSender = oneshot::Sender<SyncResult<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Mutation,
    Action,
}

#[derive(Debug)]
enum RequestStatus {
    NotSent,
    Requested {
        requested_at: DateTime<Utc>,
    },
    Completed {
        result: FunctionResult,
        ts: Timestamp,
    },
}

#[derive(Debug)]
struct RequestEntry {
    message: ClientMessage,
    kind: RequestKind,
    status: RequestStatus,
    reply: Option<ResponseSender>,
}

impl RequestEntry {
    fn resolve(&mut self, outcome: SyncResult<Value>) {
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}

/// Converts a server outcome into the caller-facing result.
pub fn into_sync_result(result: FunctionResult) -> SyncResult<Value> {
    match result {
        FunctionResult::Value(value) => Ok(value),
        FunctionResult::ErrorMessage(message) => Err(SyncError::Function(FunctionError {
            message,
            data: None,
        })),
        FunctionResult::ErrorData { message, data } => Err(SyncError::Function(FunctionError {
            message,
            data: Some(data),
        })),
    }
}

#[derive(Debug, Default)]
pub struct RequestManager {
    inflight_requests: BTreeMap<RequestId, RequestEntry>,
    requests_older_than_restart: HashSet<RequestId>,
    inflight_mutations: usize,
    inflight_actions: usize,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutation or action. `sent` tells whether the message went
    /// out immediately or must wait for the socket.
    ///
    /// Messages other than `Mutation`/`Action` are answered with a protocol
    /// error and not tracked.
    pub fn request(&mut self, message: ClientMessage, sent: bool, reply: ResponseSender) {
        let Some(request_id) = message.request_id() else {
            let _ = reply.send(Err(SyncError::Protocol(format!(
                "{} is not a request",
                message.kind()
            ))));
            return;
        };
        let kind = if matches!(message, ClientMessage::Mutation { .. }) {
            RequestKind::Mutation
        } else {
            RequestKind::Action
        };
        let status = if sent {
            RequestStatus::Requested {
                requested_at: Utc::now(),
            }
        } else {
            RequestStatus::NotSent
        };
        match kind {
            RequestKind::Mutation => self.inflight_mutations += 1,
            RequestKind::Action => self.inflight_actions += 1,
        }
        self.inflight_requests.insert(
            request_id,
            RequestEntry {
                message,
                kind,
                status,
                reply: Some(reply),
            },
        );
    }

    /// Handles a `MutationResponse` or `ActionResponse`.
    ///
    /// Returns the request id when the request was retired by this response
    /// and any optimistic update it owns must be dropped now (a failed
    /// mutation). Unknown ids and duplicate deliveries are ignored.
    pub fn on_response(&mut self, response: &ServerMessage) -> Option<RequestId> {
        let (request_id, success, result, error_data, log_lines, ts) = match response {
            ServerMessage::MutationResponse {
                request_id,
                success,
                result,
                ts,
                error_data,
                log_lines,
            } => (*request_id, *success, result, error_data, log_lines, *ts),
            ServerMessage::ActionResponse {
                request_id,
                success,
                result,
                error_data,
                log_lines,
            } => (*request_id, *success, result, error_data, log_lines, None),
            _ => return None,
        };

        let entry = self.inflight_requests.get_mut(&request_id)?;
        if matches!(entry.status, RequestStatus::Completed { .. }) {
            debug!(request_id, "ignoring duplicate response");
            return None;
        }

        let label = match entry.kind {
            RequestKind::Mutation => "mutation",
            RequestKind::Action => "action",
        };
        for line in log_lines {
            info!(request_id, "[{}] {}", label, line);
        }

        let outcome = response_outcome(success, result, error_data);
        match (entry.kind, success) {
            (RequestKind::Mutation, true) => {
                entry.status = RequestStatus::Completed {
                    result: outcome,
                    ts: ts.unwrap_or_default(),
                };
                self.inflight_mutations = self.inflight_mutations.saturating_sub(1);
                None
            }
            (kind, _) => {
                entry.resolve(into_sync_result(outcome));
                self.forget(request_id);
                match kind {
                    RequestKind::Mutation => {
                        self.inflight_mutations = self.inflight_mutations.saturating_sub(1);
                        Some(request_id)
                    }
                    RequestKind::Action => {
                        self.inflight_actions = self.inflight_actions.saturating_sub(1);
                        None
                    }
                }
            }
        }
    }

    /// Resolves every completed mutation whose commit timestamp is at or
    /// below `ts`, returning their ids.
    pub fn remove_completed(&mut self, ts: Timestamp) -> HashSet<RequestId> {
        let ready: Vec<RequestId> = self
            .inflight_requests
            .iter()
            .filter_map(|(id, entry)| match &entry.status {
                RequestStatus::Completed { ts: done_at, .. } if *done_at <= ts => Some(*id),
                _ => None,
            })
            .collect();

        let mut completed = HashSet::with_capacity(ready.len());
        for request_id in ready {
            if let Some(entry) = self.inflight_requests.remove(&request_id) {
                if let (RequestStatus::Completed { result, .. }, Some(reply)) =
                    (entry.status, entry.reply)
                {
                    let _ = reply.send(into_sync_result(result));
                }
                self.requests_older_than_restart.remove(&request_id);
                completed.insert(request_id);
            }
        }
        completed
    }

    /// Prepares for a fresh connection and returns the messages to replay.
    ///
    /// Unsent requests and every mutation are resent. Actions that were
    /// already sent fail with [`SyncError::ConnectionLost`]; the server may or
    /// may not have run them.
    pub fn restart(&mut self) -> Vec<ClientMessage> {
        self.requests_older_than_restart = self.inflight_requests.keys().copied().collect();

        let mut replay = Vec::new();
        let mut lost_actions = Vec::new();
        for (request_id, entry) in self.inflight_requests.iter_mut() {
            match (&entry.status, entry.kind) {
                (RequestStatus::NotSent, _) => {
                    entry.status = RequestStatus::Requested {
                        requested_at: Utc::now(),
                    };
                    replay.push(entry.message.clone());
                }
                (_, RequestKind::Mutation) => replay.push(entry.message.clone()),
                (_, RequestKind::Action) => lost_actions.push(*request_id),
            }
        }

        for request_id in lost_actions {
            if let Some(mut entry) = self.inflight_requests.remove(&request_id) {
                entry.resolve(Err(SyncError::ConnectionLost));
                self.requests_older_than_restart.remove(&request_id);
                self.inflight_actions = self.inflight_actions.saturating_sub(1);
            }
        }
        replay
    }

    /// Sends requests buffered while the socket was paused.
    pub fn resume(&mut self) -> Vec<ClientMessage> {
        let mut replay = Vec::new();
        for entry in self.inflight_requests.values_mut() {
            if matches!(entry.status, RequestStatus::NotSent) {
                entry.status = RequestStatus::Requested {
                    requested_at: Utc::now(),
                };
                replay.push(entry.message.clone());
            }
        }
        replay
    }

    /// Fails every outstanding request; used when the client shuts down.
    pub fn fail_all(&mut self, error: SyncError) {
        for (_, mut entry) in std::mem::take(&mut self.inflight_requests) {
            entry.resolve(Err(error.clone()));
        }
        self.requests_older_than_restart.clear();
        self.inflight_mutations = 0;
        self.inflight_actions = 0;
    }

    fn forget(&mut self, request_id: RequestId) {
        self.inflight_requests.remove(&request_id);
        self.requests_older_than_restart.remove(&request_id);
    }

    /// Whether every request outstanding at the last restart has finished.
    pub fn has_synced_past_last_reconnect(&self) -> bool {
        self.requests_older_than_restart.is_empty()
    }

    pub fn has_inflight_requests(&self) -> bool {
        !self.inflight_requests.is_empty()
    }

    /// When the oldest request still waiting on the server was sent.
    pub fn time_of_oldest_inflight_request(&self) -> Option<DateTime<Utc>> {
        self.inflight_requests
            .values()
            .filter_map(|entry| match entry.status {
                RequestStatus::Requested { requested_at } => Some(requested_at),
                _ => None,
            })
            .min()
    }

    pub fn inflight_mutations(&self) -> usize {
        self.inflight_mutations
    }

    pub fn inflight_actions(&self) -> usize {
        self.inflight_actions
    }
}

#[cfg(test)]
#[path = "request_manager_tests.rs"]
mod tests;
