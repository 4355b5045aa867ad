// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Public client handle and the background worker that owns the sync state.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lq_core::{FunctionResult, QueryToken};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::auth::{AuthConfig, AuthFetchResult, AuthTokenFetcher, TokenFetchLock};
use super::core::{QueryResultReceiver, SyncCore};
use super::optimistic::{OptimisticLocalStore, OptimisticUpdate};
use super::request_manager::ResponseSender;
use super::transport::{SocketEvent, TransportError, TransportFactory, WebSocketTransport};
use crate::config::ClientConfig;

/// A server function failed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct FunctionError {
    pub message: String,
    /// Structured payload; present iff the server attached one.
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Function(#[from] FunctionError),

    #[error("connection lost while action was in flight")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fatal server error: {0}")]
    Fatal(String),

    #[error("client is closed")]
    Closed,

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Snapshot of the connection, for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub has_inflight_requests: bool,
    pub is_connected: bool,
    /// When the oldest request still waiting on the server was sent.
    pub time_of_oldest_inflight_request: Option<DateTime<Utc>>,
    pub has_ever_connected: bool,
    pub connection_count: u32,
    pub connection_retries: u32,
    pub inflight_mutations: usize,
    pub inflight_actions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Journal from an earlier subscription to the same query.
    pub journal: Option<String>,
    pub component_path: Option<String>,
}

#[derive(Default)]
pub struct MutationOptions {
    pub optimistic_update: Option<OptimisticUpdate>,
    pub component_path: Option<String>,
}

impl MutationOptions {
    /// Options with an optimistic update.
    pub fn optimistic<F>(update: F) -> Self
    where
        F: Fn(&mut OptimisticLocalStore<'_>) + Send + Sync + 'static,
    {
        MutationOptions {
            optimistic_update: Some(Box::new(update)),
            component_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    pub component_path: Option<String>,
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("optimistic_update", &self.optimistic_update.is_some())
            .field("component_path", &self.component_path)
            .finish()
    }
}

enum Command {
    Subscribe {
        path: String,
        args: Value,
        options: SubscribeOptions,
        reply: oneshot::Sender<SyncResult<(QueryToken, QueryResultReceiver)>>,
    },
    Unsubscribe {
        token: QueryToken,
    },
    Journal {
        token: QueryToken,
        reply: oneshot::Sender<Option<String>>,
    },
    Mutation {
        path: String,
        args: Value,
        options: MutationOptions,
        reply: ResponseSender,
    },
    Action {
        path: String,
        args: Value,
        options: ActionOptions,
        reply: ResponseSender,
    },
    SetAuth(AuthConfig),
    SetAdminAuth {
        admin_key: String,
        impersonating: Option<Value>,
    },
    ClearAuth,
    Close,
}

/// Builds a [`SyncClient`] with a custom transport or fetch lock.
pub struct SyncClientBuilder {
    config: ClientConfig,
    transport: Option<TransportFactory>,
    fetch_lock: Option<TokenFetchLock>,
}

impl SyncClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        SyncClientBuilder {
            config,
            transport: None,
            fetch_lock: None,
        }
    }

    /// Replaces the WebSocket transport, e.g. with an in-memory one.
    pub fn transport(mut self, factory: TransportFactory) -> Self {
        self.transport = Some(factory);
        self
    }

    /// Shares token fetches with other clients holding the same lock.
    pub fn token_fetch_lock(mut self, lock: TokenFetchLock) -> Self {
        self.fetch_lock = Some(lock);
        self
    }

    /// Validates the configuration and starts connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> SyncResult<SyncClient> {
        let config = self
            .config
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let factory = self.transport.unwrap_or_else(WebSocketTransport::factory);
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let core = SyncCore::new(
            &config,
            factory,
            socket_tx,
            auth_tx,
            self.fetch_lock.unwrap_or_default(),
        );
        info!(url = %config.websocket_url(), session = core.session_id(), "starting sync client");

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, connection_state) = watch::channel(ConnectionState::default());
        let (outcome_tx, outcome) = watch::channel(None);
        tokio::spawn(run_worker(
            core,
            Channels {
                commands: commands_rx,
                socket_events: socket_rx,
                auth_results: auth_rx,
                connection_state: state_tx,
                outcome: outcome_tx,
            },
        ));
        Ok(SyncClient {
            commands,
            connection_state,
            outcome,
        })
    }
}

/// Handle to a running client. Cheap to clone; the connection closes when
/// the last handle and subscription are dropped or [`close`](Self::close) is
/// called.
#[derive(Clone)]
pub struct SyncClient {
    commands: mpsc::UnboundedSender<Command>,
    connection_state: watch::Receiver<ConnectionState>,
    outcome: watch::Receiver<Option<SyncResult<()>>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> SyncResult<Self> {
        SyncClientBuilder::new(config).build()
    }

    pub fn with_transport(config: ClientConfig, factory: TransportFactory) -> SyncResult<Self> {
        SyncClientBuilder::new(config).transport(factory).build()
    }

    pub fn builder(config: ClientConfig) -> SyncClientBuilder {
        SyncClientBuilder::new(config)
    }

    fn command(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }

    pub async fn subscribe(&self, path: &str, args: Value) -> SyncResult<QuerySubscription> {
        self.subscribe_with(path, args, SubscribeOptions::default())
            .await
    }

    pub async fn subscribe_with(
        &self,
        path: &str,
        args: Value,
        options: SubscribeOptions,
    ) -> SyncResult<QuerySubscription> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            path: path.to_string(),
            args,
            options,
            reply,
        })?;
        let (token, results) = rx.await.map_err(|_| SyncError::Closed)??;
        Ok(QuerySubscription {
            token,
            results,
            commands: self.commands.clone(),
        })
    }

    /// Runs a mutation. Resolves once its effects are visible in query
    /// results.
    pub async fn mutation(&self, path: &str, args: Value) -> SyncResult<Value> {
        self.mutation_with(path, args, MutationOptions::default())
            .await
    }

    pub async fn mutation_with(
        &self,
        path: &str,
        args: Value,
        options: MutationOptions,
    ) -> SyncResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Mutation {
            path: path.to_string(),
            args,
            options,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Runs an action. Actions are not retried: one in flight when the
    /// connection drops fails with [`SyncError::ConnectionLost`].
    pub async fn action(&self, path: &str, args: Value) -> SyncResult<Value> {
        self.action_with(path, args, ActionOptions::default()).await
    }

    pub async fn action_with(
        &self,
        path: &str,
        args: Value,
        options: ActionOptions,
    ) -> SyncResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Action {
            path: path.to_string(),
            args,
            options,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Authenticates with tokens from `fetch_token`; `on_change` hears
    /// whether the server accepted them.
    pub fn set_auth<T, C>(&self, fetch_token: T, on_change: C) -> SyncResult<()>
    where
        T: AuthTokenFetcher + 'static,
        C: Fn(bool) + Send + Sync + 'static,
    {
        self.command(Command::SetAuth(AuthConfig {
            fetch_token: Arc::new(fetch_token),
            on_auth_change: Arc::new(on_change),
        }))
    }

    /// Authenticates with a deployment admin key.
    pub fn set_admin_auth(&self, admin_key: &str, impersonating: Option<Value>) -> SyncResult<()> {
        self.command(Command::SetAdminAuth {
            admin_key: admin_key.to_string(),
            impersonating,
        })
    }

    pub fn clear_auth(&self) -> SyncResult<()> {
        self.command(Command::ClearAuth)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.borrow().clone()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.clone()
    }

    /// Closes the connection. Pending requests fail with
    /// [`SyncError::Closed`]. Returns the error that had already stopped the
    /// client, if any.
    pub async fn close(&self) -> SyncResult<()> {
        // The worker may already be gone; its outcome is still reported.
        let _ = self.commands.send(Command::Close);
        self.terminated().await
    }

    /// Resolves when the client stops, with the fatal error that stopped it.
    pub async fn terminated(&self) -> SyncResult<()> {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or(Ok(())),
            Err(_) => Err(SyncError::Closed),
        };
        result
    }
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("connection_state", &*self.connection_state.borrow())
            .finish_non_exhaustive()
    }
}

/// A live query. Dropping it unsubscribes.
pub struct QuerySubscription {
    token: QueryToken,
    results: QueryResultReceiver,
    commands: mpsc::UnboundedSender<Command>,
}

impl QuerySubscription {
    pub fn query_token(&self) -> &QueryToken {
        &self.token
    }

    /// The visible result: the server's, with pending optimistic updates
    /// applied. `None` while loading.
    pub fn local_result(&self) -> Option<FunctionResult> {
        self.results.borrow().clone()
    }

    /// Waits for the visible result to change.
    pub async fn changed(&mut self) -> SyncResult<Option<FunctionResult>> {
        self.results.changed().await.map_err(|_| SyncError::Closed)?;
        Ok(self.results.borrow_and_update().clone())
    }

    /// The journal the server last attached to this query.
    pub async fn journal(&self) -> SyncResult<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Journal {
                token: self.token.clone(),
                reply,
            })
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Calls `callback` with every new visible result until the returned
    /// handle is dropped or the client stops.
    pub fn on_update<F>(&self, callback: F) -> UpdateHandle
    where
        F: Fn(Option<FunctionResult>) + Send + 'static,
    {
        let mut results = self.results.clone();
        let task = tokio::spawn(async move {
            while results.changed().await.is_ok() {
                let current = results.borrow_and_update().clone();
                callback(current);
            }
        });
        UpdateHandle { task }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe {
            token: self.token.clone(),
        });
    }
}

impl fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Registration of an [`QuerySubscription::on_update`] callback.
#[derive(Debug)]
pub struct UpdateHandle {
    task: JoinHandle<()>,
}

impl UpdateHandle {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for UpdateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Channels {
    commands: mpsc::UnboundedReceiver<Command>,
    socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    auth_results: mpsc::UnboundedReceiver<AuthFetchResult>,
    connection_state: watch::Sender<ConnectionState>,
    outcome: watch::Sender<Option<SyncResult<()>>>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn handle_command(core: &mut SyncCore, command: Command) {
    match command {
        Command::Subscribe {
            path,
            args,
            options,
            reply,
        } => {
            let _ = reply.send(core.subscribe(
                &path,
                args,
                options.journal,
                options.component_path,
            ));
        }
        Command::Unsubscribe { token } => core.unsubscribe(&token),
        Command::Journal { token, reply } => {
            let _ = reply.send(core.journal(&token));
        }
        Command::Mutation {
            path,
            args,
            options,
            reply,
        } => core.mutation(
            &path,
            args,
            options.optimistic_update,
            options.component_path,
            reply,
        ),
        Command::Action {
            path,
            args,
            options,
            reply,
        } => core.action(&path, args, options.component_path, reply),
        Command::SetAuth(config) => core.set_auth(config),
        Command::SetAdminAuth {
            admin_key,
            impersonating,
        } => core.set_admin_auth(admin_key, impersonating),
        Command::ClearAuth => core.clear_auth(),
        // Handled by the worker loop.
        Command::Close => {}
    }
}

fn publish_connection_state(core: &SyncCore, sender: &watch::Sender<ConnectionState>) {
    let state = core.connection_state();
    sender.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
}

async fn run_worker(mut core: SyncCore, mut channels: Channels) {
    core.start();
    publish_connection_state(&core, &channels.connection_state);
    let outcome = loop {
        let reconnect_at = core.reconnect_at();
        let inactivity_deadline = core.inactivity_deadline();
        let refetch_at = core.refetch_at();
        tokio::select! {
            command = channels.commands.recv() => match command {
                Some(Command::Close) | None => {
                    debug!("closing sync client");
                    core.close();
                    break Ok(());
                }
                Some(command) => handle_command(&mut core, command),
            },
            Some(event) = channels.socket_events.recv() => {
                if let Err(e) = core.handle_socket_event(event) {
                    break Err(e);
                }
            }
            Some(result) = channels.auth_results.recv() => core.handle_auth_result(result),
            () = sleep_until_opt(reconnect_at) => core.on_reconnect_timer(),
            () = sleep_until_opt(inactivity_deadline) => core.on_inactivity_timeout(),
            () = sleep_until_opt(refetch_at) => core.on_refetch_timer(),
        }
        publish_connection_state(&core, &channels.connection_state);
    };
    publish_connection_state(&core, &channels.connection_state);
    channels.outcome.send_replace(Some(outcome));
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
