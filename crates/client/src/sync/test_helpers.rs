// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for sync module tests.
//!
//! [`MockServer`] hands out [`MockTransport`]s through a transport factory and
//! yields one [`MockConnection`] per successful connect, from which a test
//! plays the server side of the protocol.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lq_core::{ClientMessage, ServerMessage, StateModification, StateVersion, Timestamp};
use serde_json::Value;
use tokio::sync::mpsc;

use super::transport::{
    CloseInfo, Transport, TransportError, TransportEvent, TransportFactory, TransportResult,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct MockShared {
    accepted: mpsc::UnboundedSender<MockConnection>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

/// The server side of mock connections.
pub struct MockServer {
    shared: Arc<MockShared>,
    accepted: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockServer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockServer {
            shared: Arc::new(MockShared {
                accepted: tx,
                refuse: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
            }),
            accepted: rx,
        }
    }

    /// Factory to install on the client under test.
    pub fn factory(&self) -> TransportFactory {
        let shared = Arc::clone(&self.shared);
        Box::new(move || {
            Box::new(MockTransport {
                shared: Arc::clone(&shared),
                link: None,
            })
        })
    }

    /// Make subsequent connects fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts so far, including refused ones.
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Waits for the next successful connect.
    pub async fn accept(&mut self) -> MockConnection {
        tokio::time::timeout(RECV_TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("mock server dropped")
    }

    /// Returns an already-established connection, if any.
    pub fn try_accept(&mut self) -> Option<MockConnection> {
        self.accepted.try_recv().ok()
    }
}

/// One accepted connection, seen from the server.
pub struct MockConnection {
    pub url: String,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<ClientMessage>,
}

impl MockConnection {
    pub fn push(&self, msg: ServerMessage) {
        let _ = self.to_client.send(TransportEvent::Message(msg));
    }

    /// Closes the connection with a close frame.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed(Some(CloseInfo::new(code, reason))));
    }

    /// Next message from the client; panics after a timeout.
    pub async fn recv(&mut self) -> ClientMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client disconnected")
    }

    /// Next `n` messages from the client.
    pub async fn recv_n(&mut self, n: usize) -> Vec<ClientMessage> {
        let mut messages = Vec::with_capacity(n);
        for _ in 0..n {
            messages.push(self.recv().await);
        }
        messages
    }

    /// Receives messages up to and including the connection handshake
    /// (`Connect` plus the query set resync).
    pub async fn handshake(&mut self) -> Vec<ClientMessage> {
        self.recv_n(2).await
    }

    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        self.from_client.try_recv().ok()
    }

    /// Resolves once the client has dropped the connection.
    pub async fn closed_by_client(&mut self) {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.from_client.recv())
                .await
                .expect("timed out waiting for the client to disconnect");
            if next.is_none() {
                return;
            }
        }
    }
}

/// Client side of a mock connection.
pub struct MockTransport {
    shared: Arc<MockShared>,
    link: Option<(
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedSender<ClientMessage>,
    )>,
}

impl Transport for MockTransport {
    fn connect(
        &mut self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        let url = url.to_string();
        Box::pin(async move {
            self.shared.attempts.fetch_add(1, Ordering::SeqCst);
            if self.shared.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed("mock refused".into()));
            }
            let (to_client, incoming) = mpsc::unbounded_channel();
            let (outgoing, from_client) = mpsc::unbounded_channel();
            self.shared
                .accepted
                .send(MockConnection {
                    url,
                    to_client,
                    from_client,
                })
                .map_err(|_| TransportError::ConnectionFailed("mock server gone".into()))?;
            self.link = Some((incoming, outgoing));
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.link = None;
            Ok(())
        })
    }

    fn send(
        &mut self,
        msg: ClientMessage,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            let (_, outgoing) = self.link.as_ref().ok_or(TransportError::ConnectionClosed)?;
            outgoing
                .send(msg)
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<TransportEvent>> + Send + '_>> {
        Box::pin(async move {
            let (incoming, _) = self.link.as_mut().ok_or(TransportError::ConnectionClosed)?;
            match incoming.recv().await {
                Some(TransportEvent::Closed(info)) => {
                    self.link = None;
                    Ok(TransportEvent::Closed(info))
                }
                Some(event) => Ok(event),
                None => {
                    self.link = None;
                    Ok(TransportEvent::Closed(None))
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

/// Builds a state version.
pub fn version(query_set: u64, identity: u64, ts: i64) -> StateVersion {
    StateVersion {
        query_set,
        identity,
        ts: Timestamp::new(ts),
    }
}

/// A `Transition` with a single `QueryUpdated`.
pub fn query_updated(
    start: StateVersion,
    end: StateVersion,
    query_id: u32,
    value: Value,
) -> ServerMessage {
    ServerMessage::transition(
        start,
        end,
        vec![StateModification::QueryUpdated {
            query_id,
            value,
            log_lines: vec![],
            journal: None,
        }],
    )
}

/// Builds an unsigned JWT with the given `iat`/`exp` claims.
pub fn make_jwt(iat: i64, exp: i64) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"iat":{iat},"exp":{exp}}}"#));
    format!("{header}.{claims}.signature")
}
