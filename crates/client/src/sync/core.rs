// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The single owner of all sync state.
//!
//! [`SyncCore`] is driven by the client worker: it feeds in socket events,
//! finished token fetches, expired timers and caller commands one at a time.
//! Nothing here blocks or awaits, so every handler sees a consistent state.

use std::collections::{HashMap, HashSet};

use lq_core::{
    canonicalize_path, validate_args, ClientMessage, FunctionResult, IdentityVersion, QueryId,
    QueryToken, RequestId, ServerMessage, Timestamp,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error};

use super::auth::{AuthConfig, AuthFetchResult, AuthHost, AuthenticationManager, TokenFetchLock};
use super::client::{ConnectionState, SyncError, SyncResult};
use super::local_state::LocalSyncState;
use super::optimistic::{OptimisticQueryResultsManager, OptimisticUpdate, QueryResultEntry};
use super::remote_query_set::RemoteQuerySet;
use super::request_manager::{RequestManager, ResponseSender};
use super::transport::{SocketEvent, TransportFactory};
use super::web_socket::{ReconnectMetadata, ResumeOutcome, WebSocketManager};
use crate::config::ClientConfig;

/// Visible result of one query; `None` while loading.
pub type QueryResultReceiver = watch::Receiver<Option<FunctionResult>>;

/// Everything except authentication; the auth manager drives it through
/// [`AuthHost`].
pub(crate) struct SyncEngine {
    session_id: String,
    local_state: LocalSyncState,
    remote_query_set: RemoteQuerySet,
    request_manager: RequestManager,
    optimistic: OptimisticQueryResultsManager,
    socket: WebSocketManager,
    max_observed_timestamp: Option<Timestamp>,
    next_request_id: RequestId,
    subscribers: HashMap<QueryToken, watch::Sender<Option<FunctionResult>>>,
}

impl SyncEngine {
    fn send(&mut self, message: ClientMessage) -> bool {
        self.socket.send(message)
    }

    fn observe_timestamp(&mut self, ts: Timestamp) {
        if self.max_observed_timestamp.is_none_or(|max| ts > max) {
            self.max_observed_timestamp = Some(ts);
        }
    }

    /// Replays the whole client state onto a fresh connection.
    fn on_open(&mut self, metadata: ReconnectMetadata) {
        debug!(
            connection_count = metadata.connection_count,
            last_close_reason = ?metadata.last_close_reason,
            "connection opened"
        );
        self.send(ClientMessage::Connect {
            session_id: self.session_id.clone(),
            connection_count: metadata.connection_count,
            last_close_reason: metadata.last_close_reason,
            max_observed_timestamp: self.max_observed_timestamp,
            client_ts: metadata.client_ts,
        });

        let known_results: HashSet<QueryId> = self
            .remote_query_set
            .remote_query_results()
            .keys()
            .copied()
            .collect();
        self.remote_query_set = RemoteQuerySet::new();
        let (query_set, authenticate) = self.local_state.restart(&known_results);
        self.send(query_set);
        if let Some(authenticate) = authenticate {
            self.send(authenticate);
        }
        for message in self.request_manager.restart() {
            self.send(message);
        }
    }

    /// Flushes what was held back while paused.
    fn on_resume(&mut self) {
        let (query_set, authenticate) = self.local_state.resume();
        if let Some(query_set) = query_set {
            self.send(query_set);
        }
        if let Some(authenticate) = authenticate {
            self.send(authenticate);
        }
        for message in self.request_manager.resume() {
            self.send(message);
        }
    }

    /// Rebuilds the visible results from the server's and publishes the
    /// queries whose result changed.
    fn notify_on_query_result_changes(&mut self, completed: &HashSet<RequestId>) {
        let mut server_results = HashMap::new();
        for (query_id, result) in self.remote_query_set.remote_query_results() {
            // The query may have been unsubscribed since the server sent it.
            let Some(query) = self.local_state.query_by_id(*query_id) else {
                continue;
            };
            let Some(token) = self.local_state.query_token(*query_id) else {
                continue;
            };
            server_results.insert(
                token.clone(),
                QueryResultEntry {
                    canonical_path: query.canonical_path.clone(),
                    args: query.args.clone(),
                    result: Some(result.clone()),
                },
            );
        }
        let changed = self
            .optimistic
            .ingest_query_results_from_server(server_results, completed);
        self.publish(&changed);
    }

    fn publish(&self, tokens: &HashSet<QueryToken>) {
        for token in tokens {
            let Some(sender) = self.subscribers.get(token) else {
                continue;
            };
            let visible = self.optimistic.query_result(token).cloned();
            sender.send_if_modified(|current| {
                if *current == visible {
                    false
                } else {
                    *current = visible;
                    true
                }
            });
        }
    }

    /// Stops the client for good; pending callers see [`SyncError::Closed`].
    fn shut_down(&mut self) {
        self.socket.terminate();
        self.request_manager.fail_all(SyncError::Closed);
        self.subscribers.clear();
    }
}

impl AuthHost for SyncEngine {
    fn authenticate(&mut self, token: &str) {
        let message = self.local_state.set_auth(token.to_string());
        self.send(message);
    }

    fn clear_auth(&mut self) {
        let message = self.local_state.clear_auth();
        self.send(message);
    }

    fn has_auth(&self) -> bool {
        self.local_state.has_auth()
    }

    fn is_new_auth(&self, token: &str) -> bool {
        self.local_state.is_new_auth(token)
    }

    fn is_current_or_newer_auth_version(&self, version: IdentityVersion) -> bool {
        self.local_state.is_current_or_newer_auth_version(version)
    }

    fn mark_auth_completion(&mut self) {
        self.local_state.mark_auth_completion();
    }

    fn pause_socket(&mut self) {
        self.socket.pause();
        self.local_state.pause();
    }

    fn resume_socket(&mut self) {
        match self.socket.resume() {
            ResumeOutcome::Opened(metadata) => self.on_open(metadata),
            ResumeOutcome::Resumed => self.on_resume(),
            ResumeOutcome::Nothing => {}
        }
    }

    fn stop_socket(&mut self) {
        self.socket.stop();
    }

    fn try_restart_socket(&mut self) {
        self.socket.try_restart();
    }
}

/// Canonicalizes a function reference for the wire.
fn prepare_call(path: &str, args: Value) -> SyncResult<(String, Value)> {
    let canonical = canonicalize_path(path).map_err(|e| SyncError::InvalidArgs(e.to_string()))?;
    let args = validate_args(args).map_err(|e| SyncError::InvalidArgs(e.to_string()))?;
    Ok((canonical, args))
}

pub struct SyncCore {
    engine: SyncEngine,
    auth: AuthenticationManager,
}

impl SyncCore {
    pub fn new(
        config: &ClientConfig,
        factory: TransportFactory,
        socket_events: mpsc::UnboundedSender<SocketEvent>,
        auth_results: mpsc::UnboundedSender<AuthFetchResult>,
        fetch_lock: TokenFetchLock,
    ) -> Self {
        SyncCore {
            engine: SyncEngine {
                session_id: uuid::Uuid::new_v4().to_string(),
                local_state: LocalSyncState::new(),
                remote_query_set: RemoteQuerySet::new(),
                request_manager: RequestManager::new(),
                optimistic: OptimisticQueryResultsManager::new(),
                socket: WebSocketManager::new(config, factory, socket_events),
                max_observed_timestamp: None,
                next_request_id: 0,
                subscribers: HashMap::new(),
            },
            auth: AuthenticationManager::new(
                config.auth_refresh_token_leeway(),
                fetch_lock,
                auth_results,
            ),
        }
    }

    /// Opens the first connection.
    pub fn start(&mut self) {
        self.engine.socket.connect();
    }

    pub fn session_id(&self) -> &str {
        &self.engine.session_id
    }

    pub fn subscribe(
        &mut self,
        path: &str,
        args: Value,
        journal: Option<String>,
        component_path: Option<String>,
    ) -> SyncResult<(QueryToken, QueryResultReceiver)> {
        let (canonical, args) = prepare_call(path, args)?;
        let subscribed = self
            .engine
            .local_state
            .subscribe(&canonical, args, journal, component_path);
        if let Some(modification) = subscribed.modification {
            self.engine.send(modification);
        }
        let token = subscribed.query_token;
        let receiver = match self.engine.subscribers.get(&token) {
            Some(sender) => sender.subscribe(),
            None => {
                let current = self.engine.optimistic.query_result(&token).cloned();
                let (sender, receiver) = watch::channel(current);
                self.engine.subscribers.insert(token.clone(), sender);
                receiver
            }
        };
        Ok((token, receiver))
    }

    /// Drops one subscriber of `token`.
    pub fn unsubscribe(&mut self, token: &QueryToken) {
        if let Some(modification) = self.engine.local_state.remove_subscriber(token) {
            self.engine.send(modification);
        }
        if self.engine.local_state.query(token).is_none() {
            self.engine.subscribers.remove(token);
        }
    }

    pub fn journal(&self, token: &QueryToken) -> Option<String> {
        self.engine.local_state.query_journal(token)
    }

    pub fn mutation(
        &mut self,
        path: &str,
        args: Value,
        optimistic_update: Option<OptimisticUpdate>,
        component_path: Option<String>,
        reply: ResponseSender,
    ) {
        let (udf_path, args) = match prepare_call(path, args) {
            Ok(call) => call,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let request_id = self.next_request_id();
        if let Some(update) = optimistic_update {
            let changed = self
                .engine
                .optimistic
                .apply_optimistic_update(update, request_id);
            self.engine.publish(&changed);
        }
        let message = ClientMessage::Mutation {
            request_id,
            udf_path,
            args: vec![args],
            component_path,
        };
        let sent = self.engine.send(message.clone());
        self.engine.request_manager.request(message, sent, reply);
    }

    pub fn action(
        &mut self,
        path: &str,
        args: Value,
        component_path: Option<String>,
        reply: ResponseSender,
    ) {
        let (udf_path, args) = match prepare_call(path, args) {
            Ok(call) => call,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let message = ClientMessage::Action {
            request_id: self.next_request_id(),
            udf_path,
            args: vec![args],
            component_path,
        };
        let sent = self.engine.send(message.clone());
        self.engine.request_manager.request(message, sent, reply);
    }

    fn next_request_id(&mut self) -> RequestId {
        let request_id = self.engine.next_request_id;
        self.engine.next_request_id += 1;
        request_id
    }

    /// Authenticates with tokens from `config`.
    pub fn set_auth(&mut self, config: AuthConfig) {
        self.auth.set_config(config, &mut self.engine);
    }

    /// Authenticates with a deployment admin key, optionally acting as
    /// `impersonating`.
    pub fn set_admin_auth(&mut self, admin_key: String, impersonating: Option<Value>) {
        self.auth.stop(&mut self.engine);
        let message = self.engine.local_state.set_admin_auth(admin_key, impersonating);
        self.engine.send(message);
    }

    pub fn clear_auth(&mut self) {
        self.auth.stop(&mut self.engine);
        self.engine.clear_auth();
    }

    pub fn connection_state(&self) -> ConnectionState {
        let socket = self.engine.socket.status();
        let requests = &self.engine.request_manager;
        ConnectionState {
            has_inflight_requests: requests.has_inflight_requests(),
            is_connected: socket.is_connected,
            time_of_oldest_inflight_request: requests.time_of_oldest_inflight_request(),
            has_ever_connected: socket.has_ever_connected,
            connection_count: socket.connection_count,
            connection_retries: socket.connection_retries,
            inflight_mutations: requests.inflight_mutations(),
            inflight_actions: requests.inflight_actions(),
        }
    }

    /// Handles one event from a connection task.
    ///
    /// An error means the client cannot continue and has shut down.
    pub fn handle_socket_event(&mut self, event: SocketEvent) -> SyncResult<()> {
        match event {
            SocketEvent::Opened { epoch } => {
                if let Some(metadata) = self.engine.socket.on_open(epoch) {
                    self.engine.on_open(metadata);
                }
            }
            SocketEvent::Message { epoch, message } => {
                if !self.engine.socket.on_message(epoch) {
                    return Ok(());
                }
                self.handle_message(message)?;
                let synced = self.engine.request_manager.has_synced_past_last_reconnect()
                    && self.engine.local_state.has_synced_past_last_reconnect();
                self.engine.socket.after_message(synced);
            }
            SocketEvent::Closed { epoch, close } => self.engine.socket.on_close(epoch, &close),
            SocketEvent::Malformed { epoch, error } => {
                if self.engine.socket.is_current(epoch) {
                    return Err(self.fail(SyncError::Protocol(error)));
                }
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ServerMessage) -> SyncResult<()> {
        debug!(kind = message.kind(), "received message");
        match &message {
            ServerMessage::Transition {
                start_version,
                end_version,
                modifications,
            } => {
                self.engine.observe_timestamp(end_version.ts);
                self.auth.on_transition(&message, &mut self.engine);
                if let Err(mismatch) = self.engine.remote_query_set.transition(
                    *start_version,
                    *end_version,
                    modifications,
                ) {
                    return Err(self.fail(SyncError::Protocol(mismatch.to_string())));
                }
                self.engine.local_state.transition(modifications);
                if end_version.identity > start_version.identity
                    && self
                        .engine
                        .local_state
                        .is_current_or_newer_auth_version(end_version.identity)
                {
                    self.engine.local_state.mark_auth_completion();
                }
                let completed = self
                    .engine
                    .request_manager
                    .remove_completed(self.engine.remote_query_set.timestamp());
                self.engine.notify_on_query_result_changes(&completed);
            }
            ServerMessage::MutationResponse { success, ts, .. } => {
                if let (true, Some(ts)) = (*success, *ts) {
                    self.engine.observe_timestamp(ts);
                }
                if let Some(request_id) = self.engine.request_manager.on_response(&message) {
                    self.engine
                        .notify_on_query_result_changes(&HashSet::from([request_id]));
                }
            }
            ServerMessage::ActionResponse { .. } => {
                self.engine.request_manager.on_response(&message);
            }
            ServerMessage::AuthError { .. } => {
                self.auth.on_auth_error(&message, &mut self.engine);
            }
            ServerMessage::FatalError { error: reason } => {
                error!(error = %reason, "fatal error from server");
                return Err(self.fail(SyncError::Fatal(reason.clone())));
            }
            ServerMessage::Ping => {}
        }
        Ok(())
    }

    fn fail(&mut self, error: SyncError) -> SyncError {
        error!(%error, "closing client");
        self.close();
        error
    }

    pub fn handle_auth_result(&mut self, result: AuthFetchResult) {
        self.auth.on_fetch_result(result, &mut self.engine);
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.engine.socket.reconnect_at()
    }

    pub fn inactivity_deadline(&self) -> Option<Instant> {
        self.engine.socket.inactivity_deadline()
    }

    pub fn refetch_at(&self) -> Option<Instant> {
        self.auth.refetch_at()
    }

    pub fn on_reconnect_timer(&mut self) {
        self.engine.socket.on_reconnect_timer();
    }

    pub fn on_inactivity_timeout(&mut self) {
        self.engine.socket.on_inactivity_timeout();
    }

    pub fn on_refetch_timer(&mut self) {
        self.auth.on_refetch_timer();
    }

    /// Closes the connection and fails everything pending.
    pub fn close(&mut self) {
        self.engine.socket.terminate();
        self.auth.stop(&mut self.engine);
        self.engine.shut_down();
    }
}

#[cfg(test)]
#[path = "core_tests.rs"]
mod tests;
