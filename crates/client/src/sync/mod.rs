// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Real-time synchronization with a deployment.
//!
//! A [`SyncClient`] keeps a live, incrementally updated view of query results
//! over one WebSocket, runs mutations and actions, and keeps the connection
//! authenticated across reconnects.
//!
//! # Architecture
//!
//! ```text
//! SyncClient ──commands──► worker task ──owns──► SyncCore
//!     ▲                        │                   ├── LocalSyncState
//!     │ watch / oneshot        │ select!           ├── RemoteQuerySet
//!     └────────────────────────┤                   ├── RequestManager
//!                              │                   ├── OptimisticQueryResultsManager
//!   connection task ─events───►│                   ├── WebSocketManager
//!   token fetch task ─results─►│                   └── AuthenticationManager
//!   timers (deadlines) ───────►┘
//! ```
//!
//! All state lives in one task, so handlers run to completion without
//! locks. Connection I/O and token fetches run in their own tasks and report
//! back through channels; their results are tagged (connection epoch, auth
//! config version) so late arrivals from abandoned work are ignored.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = SyncClient::new(ClientConfig::new("https://happy-otter-123.example.cloud"))?;
//! let mut messages = client.subscribe("messages:list", json!({})).await?;
//! while let Ok(result) = messages.changed().await {
//!     println!("{result:?}");
//! }
//! ```

pub mod auth;
mod client;
mod core;
mod local_state;
mod optimistic;
mod remote_query_set;
mod request_manager;
pub mod transport;
mod web_socket;

#[cfg(test)]
mod test_helpers;

pub use auth::{AuthTokenFetcher, TokenFetchLock};
pub use client::{
    ActionOptions, ConnectionState, FunctionError, MutationOptions, QuerySubscription,
    SubscribeOptions, SyncClient, SyncClientBuilder, SyncError, SyncResult, UpdateHandle,
};
pub use optimistic::{OptimisticLocalStore, OptimisticUpdate};
pub use transport::{CloseInfo, Transport, TransportError, TransportEvent, TransportFactory};
pub use web_socket::backoff_delay;
