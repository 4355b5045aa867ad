// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

// Allow unused items: test helpers are shared across multiple test binaries,
// and not every test file uses every helper.
#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use futures_util::{SinkExt, StreamExt};
use lq_core::{
    ClientMessage, QueryId, QuerySetModification, ServerMessage, StateModification, StateVersion,
    Timestamp,
};
use lqrs::ClientConfig;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

pub use predicates::prelude::*;
pub use tempfile::TempDir;

pub fn lq() -> Command {
    cargo_bin_cmd!("lq")
}

/// `lq` with no deployment settings leaking in from the environment.
pub fn lq_isolated(home: &TempDir) -> Command {
    let mut cmd = lq();
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("LIVEQUERY_URL")
        .env_remove("LIVEQUERY_CONFIG")
        .env_remove("LIVEQUERY_AUTH_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

struct Counter {
    value: i64,
    ts: i64,
}

/// A WebSocket deployment serving:
///
/// - query `counter:get`
/// - mutation `counter:increment`, answered after `delayMs` when given
/// - action `echo:run`, which returns its arguments
/// - action `test:disconnect`, which drops the connection
///
/// The counter is shared by every connection.
pub struct CounterServer {
    pub url: String,
    counter: Arc<Mutex<Counter>>,
    connections: Arc<AtomicUsize>,
}

impl CounterServer {
    pub async fn start(initial: i64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = Arc::new(Mutex::new(Counter {
            value: initial,
            ts: 1,
        }));
        let connections = Arc::new(AtomicUsize::new(0));
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&counter),
            Arc::clone(&connections),
        ));
        CounterServer {
            url: format!("http://{addr}"),
            counter,
            connections,
        }
    }

    /// Client config with fast reconnects.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..ClientConfig::new(self.url.clone())
        }
    }

    pub fn value(&self) -> i64 {
        self.counter.lock().unwrap().value
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn accept_loop(
    listener: TcpListener,
    counter: Arc<Mutex<Counter>>,
    connections: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(stream, Arc::clone(&counter)));
    }
}

async fn serve(stream: TcpStream, counter: Arc<Mutex<Counter>>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let mut session = Session::default();
    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(message) = ClientMessage::from_json(&text) else {
            return;
        };
        let Some((delay, replies)) = session.handle(message, &counter) else {
            let _ = sink.close().await;
            return;
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        for reply in replies {
            let json = reply.to_json().unwrap();
            if sink.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct Session {
    version: StateVersion,
    queries: HashMap<QueryId, String>,
}

impl Session {
    /// Replies to one client message and how long to hold them back;
    /// `None` drops the connection.
    fn handle(
        &mut self,
        message: ClientMessage,
        counter: &Mutex<Counter>,
    ) -> Option<(Duration, Vec<ServerMessage>)> {
        let mut counter = counter.lock().unwrap();
        let mut delay = Duration::ZERO;
        let replies = match message {
            ClientMessage::Connect { .. } => {
                *self = Session::default();
                vec![]
            }
            ClientMessage::ModifyQuerySet {
                new_version,
                modifications,
                ..
            } => {
                let mut changes = Vec::new();
                for modification in modifications {
                    match modification {
                        QuerySetModification::Add {
                            query_id, udf_path, ..
                        } => {
                            changes.push(query_result(query_id, &udf_path, counter.value));
                            self.queries.insert(query_id, udf_path);
                        }
                        QuerySetModification::Remove { query_id } => {
                            self.queries.remove(&query_id);
                            changes.push(StateModification::QueryRemoved { query_id });
                        }
                    }
                }
                let end = StateVersion {
                    query_set: new_version,
                    ts: Timestamp::new(counter.ts),
                    ..self.version
                };
                vec![self.advance(end, changes)]
            }
            ClientMessage::Authenticate { base_version, .. } => {
                let end = StateVersion {
                    identity: base_version + 1,
                    ..self.version
                };
                vec![self.advance(end, vec![])]
            }
            ClientMessage::Mutation {
                request_id,
                udf_path,
                args,
                ..
            } => {
                if udf_path != "counter:increment" {
                    let message = format!("unknown mutation '{udf_path}'");
                    let failure = ServerMessage::mutation_failure(request_id, message, None);
                    return Some((delay, vec![failure]));
                }
                if let Some(ms) = args
                    .first()
                    .and_then(|args| args.get("delayMs"))
                    .and_then(Value::as_u64)
                {
                    delay = Duration::from_millis(ms);
                }
                counter.value += 1;
                counter.ts += 1;
                let ts = Timestamp::new(counter.ts);
                let changes = self
                    .queries
                    .iter()
                    .map(|(query_id, path)| query_result(*query_id, path, counter.value))
                    .collect();
                let end = StateVersion { ts, ..self.version };
                vec![
                    ServerMessage::mutation_success(request_id, json!(counter.value), ts),
                    self.advance(end, changes),
                ]
            }
            ClientMessage::Action {
                request_id,
                udf_path,
                args,
                ..
            } => match udf_path.as_str() {
                "echo:run" => vec![ServerMessage::action_success(
                    request_id,
                    args.into_iter().next().unwrap_or(Value::Null),
                )],
                "test:disconnect" => return None,
                _ => vec![ServerMessage::action_failure(
                    request_id,
                    format!("unknown action '{udf_path}'"),
                    None,
                )],
            },
            ClientMessage::Event { .. } => vec![],
        };
        Some((delay, replies))
    }

    fn advance(&mut self, end: StateVersion, changes: Vec<StateModification>) -> ServerMessage {
        let start = std::mem::replace(&mut self.version, end);
        ServerMessage::transition(start, end, changes)
    }
}

fn query_result(query_id: QueryId, path: &str, value: i64) -> StateModification {
    if path == "counter:get" {
        StateModification::QueryUpdated {
            query_id,
            value: json!(value),
            log_lines: Vec::new(),
            journal: None,
        }
    } else {
        StateModification::QueryFailed {
            query_id,
            error_message: format!("unknown query '{path}'"),
            log_lines: Vec::new(),
            error_data: None,
            journal: None,
        }
    }
}
