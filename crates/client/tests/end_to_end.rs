// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;
use common::*;

use std::future::Future;
use std::time::Duration;

use lq_core::FunctionResult;
use lqrs::{MutationOptions, QuerySubscription, SyncClient, SyncError};
use serde_json::{json, Value};

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

/// Waits until the subscription shows `expected`.
async fn wait_for(sub: &mut QuerySubscription, expected: Value) {
    within(async {
        loop {
            if sub.local_result() == Some(FunctionResult::Value(expected.clone())) {
                return;
            }
            sub.changed().await.unwrap();
        }
    })
    .await;
}

#[tokio::test]
async fn subscription_receives_server_value() {
    let server = CounterServer::start(42).await;
    let client = SyncClient::new(server.config()).unwrap();

    let mut sub = client.subscribe("counter:get", json!({})).await.unwrap();
    wait_for(&mut sub, json!(42)).await;

    client.close().await.unwrap();
}

#[tokio::test]
async fn unknown_query_reports_failure() {
    let server = CounterServer::start(0).await;
    let client = SyncClient::new(server.config()).unwrap();

    let mut sub = client.subscribe("missing:get", json!({})).await.unwrap();
    let result = within(sub.changed()).await.unwrap();
    assert_eq!(
        result,
        Some(FunctionResult::ErrorMessage(
            "unknown query 'missing:get'".to_string()
        ))
    );
}

#[tokio::test]
async fn mutation_updates_subscribers() {
    let server = CounterServer::start(42).await;
    let client = SyncClient::new(server.config()).unwrap();
    let mut sub = client.subscribe("counter:get", json!({})).await.unwrap();
    wait_for(&mut sub, json!(42)).await;

    let value = within(client.mutation("counter:increment", json!({})))
        .await
        .unwrap();
    assert_eq!(value, json!(43));
    assert_eq!(server.value(), 43);
    wait_for(&mut sub, json!(43)).await;
}

#[tokio::test]
async fn optimistic_update_converges_to_server_value() {
    let server = CounterServer::start(42).await;
    let client = SyncClient::new(server.config()).unwrap();
    let mut sub = client.subscribe("counter:get", json!({})).await.unwrap();
    wait_for(&mut sub, json!(42)).await;

    let options = MutationOptions::optimistic(|store| {
        let current = store
            .get_query("counter:get", json!({}))
            .and_then(|value| value.as_i64())
            .unwrap_or(0);
        store.set_query("counter:get", json!({}), Some(json!(current + 100)));
    });
    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .mutation_with("counter:increment", json!({"delayMs": 300}), options)
                .await
        }
    });

    wait_for(&mut sub, json!(142)).await;
    assert_eq!(within(pending).await.unwrap().unwrap(), json!(43));
    wait_for(&mut sub, json!(43)).await;
}

#[tokio::test]
async fn failed_mutation_rolls_back() {
    let server = CounterServer::start(7).await;
    let client = SyncClient::new(server.config()).unwrap();
    let mut sub = client.subscribe("counter:get", json!({})).await.unwrap();
    wait_for(&mut sub, json!(7)).await;

    let options = MutationOptions::optimistic(|store| {
        store.set_query("counter:get", json!({}), Some(json!(-1)));
    });
    let err = within(client.mutation_with("counter:explode", json!({}), options))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown mutation 'counter:explode'");
    assert!(matches!(err, SyncError::Function(_)));
    wait_for(&mut sub, json!(7)).await;
}

#[tokio::test]
async fn action_echoes_arguments() {
    let server = CounterServer::start(0).await;
    let client = SyncClient::new(server.config()).unwrap();

    let value = within(client.action("echo:run", json!({"greeting": "hi"})))
        .await
        .unwrap();
    assert_eq!(value, json!({"greeting": "hi"}));
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_disconnect() {
    let server = CounterServer::start(5).await;
    let client = SyncClient::new(server.config()).unwrap();
    let mut sub = client.subscribe("counter:get", json!({})).await.unwrap();
    wait_for(&mut sub, json!(5)).await;

    let err = within(client.action("test:disconnect", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConnectionLost));

    let value = within(client.mutation("counter:increment", json!({})))
        .await
        .unwrap();
    assert_eq!(value, json!(6));
    wait_for(&mut sub, json!(6)).await;
    assert_eq!(server.connections(), 2);

    let state = client.connection_state();
    assert!(state.is_connected);
    assert_eq!(state.connection_count, 2);
}

#[tokio::test]
async fn close_is_idempotent_for_clones() {
    let server = CounterServer::start(0).await;
    let client = SyncClient::new(server.config()).unwrap();
    let other = client.clone();

    client.close().await.unwrap();
    other.close().await.unwrap();
    assert!(matches!(
        other.mutation("counter:increment", json!({})).await,
        Err(SyncError::Closed)
    ));
}
