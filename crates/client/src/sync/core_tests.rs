// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use lq_core::{QuerySetModification, TokenType};
use serde_json::json;
use tokio::sync::oneshot;

use super::*;
use crate::sync::client::FunctionError;
use crate::sync::optimistic::OptimisticLocalStore;
use crate::sync::test_helpers::{query_updated, version, MockConnection, MockServer};

struct Harness {
    core: SyncCore,
    server: MockServer,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    auth_results: mpsc::UnboundedReceiver<AuthFetchResult>,
}

impl Harness {
    fn new() -> Self {
        let server = MockServer::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (auth_tx, auth_results) = mpsc::unbounded_channel();
        let core = SyncCore::new(
            &ClientConfig::new("https://happy-otter-123.example.cloud"),
            server.factory(),
            events_tx,
            auth_tx,
            TokenFetchLock::new(),
        );
        Harness {
            core,
            server,
            events,
            auth_results,
        }
    }

    /// Handles the next socket event.
    async fn pump(&mut self) -> SyncResult<()> {
        let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a socket event")
            .expect("event channel closed");
        self.core.handle_socket_event(event)
    }

    /// Waits for the next connection and handles its open.
    async fn accept(&mut self) -> MockConnection {
        let conn = self.server.accept().await;
        self.pump().await.unwrap();
        conn
    }

    async fn start(&mut self) -> MockConnection {
        self.core.start();
        self.accept().await
    }

    async fn reconnect(&mut self, conn: &MockConnection, code: u16, reason: &str) -> MockConnection {
        conn.close(code, reason);
        self.pump().await.unwrap();
        assert!(self.core.reconnect_at().is_some());
        self.core.on_reconnect_timer();
        self.accept().await
    }
}

fn reply() -> (ResponseSender, oneshot::Receiver<SyncResult<Value>>) {
    oneshot::channel()
}

fn set_counter(value: i64) -> OptimisticUpdate {
    Box::new(move |store: &mut OptimisticLocalStore<'_>| {
        store.set_query("counter:get", json!({}), Some(json!(value)));
    })
}

fn value(result: &Option<FunctionResult>) -> Option<Value> {
    result.as_ref().and_then(|r| r.value()).cloned()
}

#[tokio::test]
async fn open_sends_connect_then_query_set() {
    let mut h = Harness::new();
    h.core.subscribe("messages:list", json!({}), None, None).unwrap();
    let mut conn = h.start().await;

    let handshake = conn.handshake().await;
    match &handshake[0] {
        ClientMessage::Connect {
            session_id,
            connection_count,
            last_close_reason,
            max_observed_timestamp,
            ..
        } => {
            assert_eq!(session_id, h.core.session_id());
            assert_eq!(*connection_count, 0);
            assert_eq!(last_close_reason.as_deref(), Some("InitialConnect"));
            assert_eq!(*max_observed_timestamp, None);
        }
        other => panic!("expected Connect, got {other:?}"),
    }
    assert!(matches!(
        &handshake[1],
        ClientMessage::ModifyQuerySet { base_version: 0, new_version: 1, modifications }
            if modifications.len() == 1
    ));
}

#[tokio::test]
async fn transition_publishes_query_result() {
    let mut h = Harness::new();
    let (token, mut rx) = h.core.subscribe("counter:get", json!({}), None, None).unwrap();
    let mut conn = h.start().await;
    conn.handshake().await;
    assert_eq!(*rx.borrow(), None);

    conn.push(query_updated(version(0, 0, 0), version(1, 0, 10), 0, json!(42)));
    h.pump().await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(value(&rx.borrow_and_update()), Some(json!(42)));
    assert_eq!(
        h.core.engine.optimistic.query_result(&token),
        Some(&FunctionResult::Value(json!(42)))
    );
}

#[tokio::test]
async fn late_subscriber_sees_current_result() {
    let mut h = Harness::new();
    let (_token, _rx) = h.core.subscribe("counter:get", json!({}), None, None).unwrap();
    let mut conn = h.start().await;
    conn.handshake().await;
    conn.push(query_updated(version(0, 0, 0), version(1, 0, 10), 0, json!(7)));
    h.pump().await.unwrap();

    let (_token, rx) = h.core.subscribe("counter:get", json!(null), None, None).unwrap();
    assert_eq!(value(&rx.borrow()), Some(json!(7)));
}

#[tokio::test]
async fn duplicate_subscribers_share_one_query() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;

    let (token, _a) = h.core.subscribe("messages:list", json!({"channel": "a"}), None, None).unwrap();
    let (same, _b) = h.core.subscribe("messages:list", json!({"channel": "a"}), None, None).unwrap();
    assert_eq!(token, same);
    h.core.unsubscribe(&token);
    h.core.unsubscribe(&token);

    let messages = conn.recv_n(2).await;
    assert!(matches!(
        &messages[0],
        ClientMessage::ModifyQuerySet { base_version: 1, new_version: 2, modifications }
            if matches!(modifications[..], [QuerySetModification::Add { .. }])
    ));
    assert!(matches!(
        &messages[1],
        ClientMessage::ModifyQuerySet { base_version: 2, new_version: 3, modifications }
            if matches!(modifications[..], [QuerySetModification::Remove { .. }])
    ));
    assert!(conn.try_recv().is_none());
}

#[tokio::test]
async fn invalid_arguments_are_rejected() {
    let mut h = Harness::new();
    let err = h.core.subscribe("counter:get", json!([1, 2]), None, None).unwrap_err();
    assert!(matches!(err, SyncError::InvalidArgs(_)));

    let (tx, rx) = reply();
    h.core.mutation("counter:increment", json!(3), None, None, tx);
    assert!(matches!(rx.await.unwrap(), Err(SyncError::InvalidArgs(_))));
}

#[tokio::test]
async fn reconnect_replays_state_in_order() {
    let mut h = Harness::new();
    for channel in ["a", "b", "c"] {
        h.core
            .subscribe("messages:list", json!({ "channel": channel }), None, None)
            .unwrap();
    }
    h.core.set_admin_auth("admin-key".to_string(), None);
    let mut conn = h.start().await;
    conn.recv_n(3).await;

    let (tx, _rx) = reply();
    h.core.mutation("messages:send", json!({"body": "hi"}), None, None, tx);
    assert!(matches!(conn.recv().await, ClientMessage::Mutation { request_id: 0, .. }));

    let mut conn = h.reconnect(&conn, 1011, "InternalServerError: overloaded").await;
    let replay = conn.recv_n(4).await;
    assert!(matches!(
        &replay[0],
        ClientMessage::Connect { connection_count: 1, last_close_reason: Some(reason), .. }
            if reason == "InternalServerError: overloaded"
    ));
    assert!(matches!(
        &replay[1],
        ClientMessage::ModifyQuerySet { base_version: 0, new_version: 1, modifications }
            if modifications.len() == 3
    ));
    assert!(matches!(
        &replay[2],
        ClientMessage::Authenticate { base_version: 0, token_type: TokenType::Admin, .. }
    ));
    assert!(matches!(&replay[3], ClientMessage::Mutation { request_id: 0, .. }));
}

#[tokio::test]
async fn connect_reports_max_observed_timestamp() {
    let mut h = Harness::new();
    h.core.subscribe("counter:get", json!({}), None, None).unwrap();
    let mut conn = h.start().await;
    conn.handshake().await;
    conn.push(query_updated(version(0, 0, 0), version(1, 0, 10), 0, json!(1)));
    h.pump().await.unwrap();

    let mut conn = h.reconnect(&conn, 1000, "").await;
    match conn.recv().await {
        ClientMessage::Connect {
            max_observed_timestamp,
            ..
        } => assert_eq!(max_observed_timestamp, Some(Timestamp::new(10))),
        other => panic!("expected Connect, got {other:?}"),
    }
}

#[tokio::test]
async fn optimistic_update_converges_with_server() {
    let mut h = Harness::new();
    let (_token, mut rx) = h.core.subscribe("counter:get", json!({}), None, None).unwrap();
    let mut conn = h.start().await;
    conn.handshake().await;
    conn.push(query_updated(version(0, 0, 0), version(1, 0, 10), 0, json!(42)));
    h.pump().await.unwrap();
    assert_eq!(value(&rx.borrow_and_update()), Some(json!(42)));

    let (tx, mut mutation) = reply();
    h.core
        .mutation("counter:increment", json!({}), Some(set_counter(43)), None, tx);
    assert_eq!(value(&rx.borrow_and_update()), Some(json!(43)));
    assert!(matches!(conn.recv().await, ClientMessage::Mutation { request_id: 0, .. }));

    conn.push(ServerMessage::mutation_success(0, json!(null), Timestamp::new(20)));
    h.pump().await.unwrap();
    assert!(mutation.try_recv().is_err());

    conn.push(query_updated(version(1, 0, 10), version(1, 0, 20), 0, json!(43)));
    h.pump().await.unwrap();
    assert_eq!(mutation.await.unwrap(), Ok(json!(null)));
    assert!(!rx.has_changed().unwrap());
    assert_eq!(value(&rx.borrow()), Some(json!(43)));
    assert_eq!(h.core.engine.optimistic.pending_updates(), 0);
    assert_eq!(h.core.connection_state().inflight_mutations, 0);
}

#[tokio::test]
async fn failed_mutation_rolls_back_optimistic_update() {
    let mut h = Harness::new();
    let (_token, mut rx) = h.core.subscribe("counter:get", json!({}), None, None).unwrap();
    let mut conn = h.start().await;
    conn.handshake().await;
    conn.push(query_updated(version(0, 0, 0), version(1, 0, 10), 0, json!(42)));
    h.pump().await.unwrap();

    let (tx, mutation) = reply();
    h.core
        .mutation("counter:increment", json!({}), Some(set_counter(43)), None, tx);
    conn.recv().await;
    assert_eq!(value(&rx.borrow_and_update()), Some(json!(43)));

    conn.push(ServerMessage::mutation_failure(
        0,
        "counter is locked",
        Some(json!({"code": "LOCKED"})),
    ));
    h.pump().await.unwrap();
    assert_eq!(
        mutation.await.unwrap(),
        Err(SyncError::Function(FunctionError {
            message: "counter is locked".to_string(),
            data: Some(json!({"code": "LOCKED"})),
        }))
    );
    assert_eq!(value(&rx.borrow_and_update()), Some(json!(42)));
}

#[tokio::test]
async fn action_in_flight_fails_on_reconnect() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;

    let (tx, action) = reply();
    h.core.action("email:send", json!({"to": "a@b.c"}), None, tx);
    assert!(matches!(conn.recv().await, ClientMessage::Action { .. }));

    let _conn = h.reconnect(&conn, 1006, "").await;
    assert_eq!(action.await.unwrap(), Err(SyncError::ConnectionLost));
}

#[tokio::test]
async fn action_resolves_on_response() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;

    let (tx, action) = reply();
    h.core.action("email:send", json!({}), None, tx);
    conn.recv().await;
    conn.push(ServerMessage::action_success(0, json!("sent")));
    h.pump().await.unwrap();
    assert_eq!(action.await.unwrap(), Ok(json!("sent")));
}

#[tokio::test]
async fn version_mismatch_is_fatal() {
    let mut h = Harness::new();
    h.core.subscribe("counter:get", json!({}), None, None).unwrap();
    let mut conn = h.start().await;
    conn.handshake().await;
    let (tx, mutation) = reply();
    h.core.mutation("counter:increment", json!({}), None, None, tx);

    conn.push(query_updated(version(5, 0, 0), version(6, 0, 10), 0, json!(1)));
    let err = h.pump().await.unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
    assert!(h.core.engine.socket.is_terminated());
    assert_eq!(mutation.await.unwrap(), Err(SyncError::Closed));
}

#[tokio::test]
async fn fatal_error_terminates() {
    let mut h = Harness::new();
    let (_token, mut rx) = h.core.subscribe("counter:get", json!({}), None, None).unwrap();
    let mut conn = h.start().await;
    conn.handshake().await;

    conn.push(ServerMessage::FatalError {
        error: "deployment deleted".to_string(),
    });
    assert_eq!(
        h.pump().await,
        Err(SyncError::Fatal("deployment deleted".to_string()))
    );
    assert!(h.core.engine.socket.is_terminated());
    assert!(rx.changed().await.is_err());
}

#[tokio::test]
async fn malformed_message_is_fatal_only_for_current_connection() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;

    let stale = SocketEvent::Malformed {
        epoch: 41,
        error: "not json".to_string(),
    };
    assert_eq!(h.core.handle_socket_event(stale), Ok(()));

    let current = SocketEvent::Malformed {
        epoch: 0,
        error: "not json".to_string(),
    };
    assert_eq!(
        h.core.handle_socket_event(current),
        Err(SyncError::Protocol("not json".to_string()))
    );
}

#[tokio::test]
async fn connection_state_tracks_requests() {
    let mut h = Harness::new();
    assert_eq!(h.core.connection_state(), ConnectionState::default());

    let mut conn = h.start().await;
    conn.handshake().await;
    let state = h.core.connection_state();
    assert!(state.is_connected);
    assert!(state.has_ever_connected);
    assert_eq!(state.connection_count, 1);

    let (mutation_tx, _m) = reply();
    let (action_tx, _a) = reply();
    h.core.mutation("counter:increment", json!({}), None, None, mutation_tx);
    h.core.action("email:send", json!({}), None, action_tx);
    let state = h.core.connection_state();
    assert!(state.has_inflight_requests);
    assert!(state.time_of_oldest_inflight_request.is_some());
    assert_eq!(state.inflight_mutations, 1);
    assert_eq!(state.inflight_actions, 1);
}

#[tokio::test]
async fn fetched_token_is_sent_after_pause() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;

    h.core.set_auth(AuthConfig {
        fetch_token: Arc::new(|_force: bool| async { Some("header.payload.sig".to_string()) }),
        on_auth_change: Arc::new(|_authed: bool| {}),
    });
    let (tx, _mutation) = reply();
    h.core.mutation("counter:increment", json!({}), None, None, tx);
    assert!(conn.try_recv().is_none());

    let result = h.auth_results.recv().await.unwrap();
    h.core.handle_auth_result(result);
    let messages = conn.recv_n(2).await;
    assert!(matches!(
        &messages[0],
        ClientMessage::Authenticate { base_version: 0, token_type: TokenType::User, value: Some(v), .. }
            if v == "header.payload.sig"
    ));
    assert!(matches!(&messages[1], ClientMessage::Mutation { request_id: 0, .. }));
}

fn static_auth(token: &'static str) -> AuthConfig {
    AuthConfig {
        fetch_token: Arc::new(move |_force: bool| async move { Some(token.to_string()) }),
        on_auth_change: Arc::new(|_authed: bool| {}),
    }
}

/// Authenticates with `token`, then has the server reject it so the socket
/// is stopped while a replacement is fetched.
async fn reject_token(h: &mut Harness, conn: &mut MockConnection, token: &'static str) {
    h.core.set_auth(static_auth(token));
    let result = h.auth_results.recv().await.unwrap();
    h.core.handle_auth_result(result);
    assert!(matches!(conn.recv().await, ClientMessage::Authenticate { base_version: 0, .. }));

    conn.push(ServerMessage::AuthError {
        error: "token expired".to_string(),
        base_version: 0,
        auth_update_attempted: true,
    });
    h.pump().await.unwrap();
    assert!(!h.core.connection_state().is_connected);
}

#[tokio::test]
async fn clearing_auth_during_reauthentication_reconnects() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;
    reject_token(&mut h, &mut conn, "first").await;

    h.core.clear_auth();
    let stale = h.auth_results.recv().await.unwrap();
    h.core.handle_auth_result(stale);

    let mut conn = h.accept().await;
    assert!(matches!(conn.recv().await, ClientMessage::Connect { .. }));
    assert!(h.core.connection_state().is_connected);
    assert!(h.core.inactivity_deadline().is_some());
}

#[tokio::test]
async fn new_auth_during_reauthentication_reconnects() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;
    reject_token(&mut h, &mut conn, "first").await;

    h.core.set_auth(static_auth("second"));
    for _ in 0..2 {
        let result = h.auth_results.recv().await.unwrap();
        h.core.handle_auth_result(result);
    }

    let mut conn = h.accept().await;
    let messages = conn.recv_n(3).await;
    assert!(matches!(&messages[0], ClientMessage::Connect { .. }));
    assert!(messages.iter().any(|m| matches!(
        m,
        ClientMessage::Authenticate { value: Some(v), .. } if v == "second"
    )));
    assert!(h.core.connection_state().is_connected);
}

#[tokio::test]
async fn close_fails_pending_requests() {
    let mut h = Harness::new();
    let mut conn = h.start().await;
    conn.handshake().await;
    let (tx, mutation) = reply();
    h.core.mutation("counter:increment", json!({}), None, None, tx);

    h.core.close();
    assert!(h.core.engine.socket.is_terminated());
    assert_eq!(mutation.await.unwrap(), Err(SyncError::Closed));
}
