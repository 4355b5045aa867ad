// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket protocol messages for client-server communication.
//!
//! The protocol is strictly sequential per connection:
//! - Client sends query set changes, authentication, mutations and actions
//! - Server pushes versioned `Transition`s of query results and responds to
//!   requests by id
//!
//! Every message is a JSON object tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timestamp::Timestamp;
use crate::value::FunctionResult;

/// Client-assigned identifier of a subscribed query.
pub type QueryId = u32;
/// Client-assigned identifier of a mutation or action.
pub type RequestId = u64;
/// Version of the client's query set.
pub type QuerySetVersion = u64;
/// Version of the client's authenticated identity.
pub type IdentityVersion = u64;

/// Version of the state the server has transitioned the client to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateVersion {
    pub query_set: QuerySetVersion,
    pub identity: IdentityVersion,
    pub ts: Timestamp,
}

impl StateVersion {
    /// The version of a fresh connection.
    pub fn initial() -> Self {
        Self::default()
    }
}

/// A single change to the subscribed query set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuerySetModification {
    #[serde(rename_all = "camelCase")]
    Add {
        query_id: QueryId,
        udf_path: String,
        /// Arguments travel as a one-element array.
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        journal: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component_path: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Remove { query_id: QueryId },
}

impl QuerySetModification {
    /// The query this modification refers to.
    pub fn query_id(&self) -> QueryId {
        match self {
            QuerySetModification::Add { query_id, .. } => *query_id,
            QuerySetModification::Remove { query_id } => *query_id,
        }
    }
}

/// Kind of credential carried by an `Authenticate` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    User,
    Admin,
    None,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First message on every connection.
    #[serde(rename_all = "camelCase")]
    Connect {
        session_id: String,
        connection_count: u32,
        last_close_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_observed_timestamp: Option<Timestamp>,
        client_ts: i64,
    },

    /// Moves the query set from `base_version` to `new_version`.
    #[serde(rename_all = "camelCase")]
    ModifyQuerySet {
        base_version: QuerySetVersion,
        new_version: QuerySetVersion,
        modifications: Vec<QuerySetModification>,
    },

    /// Moves the identity from `base_version` to `base_version + 1`.
    #[serde(rename_all = "camelCase")]
    Authenticate {
        base_version: IdentityVersion,
        token_type: TokenType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        impersonating: Option<Value>,
    },

    #[serde(rename_all = "camelCase")]
    Mutation {
        request_id: RequestId,
        udf_path: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component_path: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Action {
        request_id: RequestId,
        udf_path: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component_path: Option<String>,
    },

    /// Client telemetry.
    #[serde(rename_all = "camelCase")]
    Event { event_type: String, event: Value },
}

/// A change to one query's result inside a `Transition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateModification {
    #[serde(rename_all = "camelCase")]
    QueryUpdated {
        query_id: QueryId,
        value: Value,
        #[serde(default)]
        log_lines: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        journal: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    QueryFailed {
        query_id: QueryId,
        error_message: String,
        #[serde(default)]
        log_lines: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        journal: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    QueryRemoved { query_id: QueryId },
}

impl StateModification {
    pub fn query_id(&self) -> QueryId {
        match self {
            StateModification::QueryUpdated { query_id, .. }
            | StateModification::QueryFailed { query_id, .. }
            | StateModification::QueryRemoved { query_id } => *query_id,
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Versioned batch of query result changes.
    #[serde(rename_all = "camelCase")]
    Transition {
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: Vec<StateModification>,
    },

    /// Outcome of a mutation. On failure `result` holds the error message.
    #[serde(rename_all = "camelCase")]
    MutationResponse {
        request_id: RequestId,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Timestamp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_data: Option<Value>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// Outcome of an action. On failure `result` holds the error message.
    #[serde(rename_all = "camelCase")]
    ActionResponse {
        request_id: RequestId,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_data: Option<Value>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// The credential for identity `base_version + 1` was rejected.
    #[serde(rename_all = "camelCase")]
    AuthError {
        error: String,
        base_version: IdentityVersion,
        #[serde(default)]
        auth_update_attempted: bool,
    },

    /// Unrecoverable error; the connection must not be retried.
    FatalError { error: String },

    /// Keepalive.
    Ping,
}

impl ClientMessage {
    /// Creates an Add/Remove query set message.
    pub fn modify_query_set(
        base_version: QuerySetVersion,
        new_version: QuerySetVersion,
        modifications: Vec<QuerySetModification>,
    ) -> Self {
        ClientMessage::ModifyQuerySet {
            base_version,
            new_version,
            modifications,
        }
    }

    /// Short name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "Connect",
            ClientMessage::ModifyQuerySet { .. } => "ModifyQuerySet",
            ClientMessage::Authenticate { .. } => "Authenticate",
            ClientMessage::Mutation { .. } => "Mutation",
            ClientMessage::Action { .. } => "Action",
            ClientMessage::Event { .. } => "Event",
        }
    }

    /// The request id of a mutation or action.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Mutation { request_id, .. }
            | ClientMessage::Action { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Creates a Transition message.
    pub fn transition(
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: Vec<StateModification>,
    ) -> Self {
        ServerMessage::Transition {
            start_version,
            end_version,
            modifications,
        }
    }

    /// Creates a successful MutationResponse.
    pub fn mutation_success(request_id: RequestId, result: Value, ts: Timestamp) -> Self {
        ServerMessage::MutationResponse {
            request_id,
            success: true,
            result,
            ts: Some(ts),
            error_data: None,
            log_lines: Vec::new(),
        }
    }

    /// Creates a failed MutationResponse.
    pub fn mutation_failure(
        request_id: RequestId,
        message: impl Into<String>,
        error_data: Option<Value>,
    ) -> Self {
        ServerMessage::MutationResponse {
            request_id,
            success: false,
            result: Value::String(message.into()),
            ts: None,
            error_data,
            log_lines: Vec::new(),
        }
    }

    /// Creates a successful ActionResponse.
    pub fn action_success(request_id: RequestId, result: Value) -> Self {
        ServerMessage::ActionResponse {
            request_id,
            success: true,
            result,
            error_data: None,
            log_lines: Vec::new(),
        }
    }

    /// Creates a failed ActionResponse.
    pub fn action_failure(
        request_id: RequestId,
        message: impl Into<String>,
        error_data: Option<Value>,
    ) -> Self {
        ServerMessage::ActionResponse {
            request_id,
            success: false,
            result: Value::String(message.into()),
            error_data,
            log_lines: Vec::new(),
        }
    }

    /// Short name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Transition { .. } => "Transition",
            ServerMessage::MutationResponse { .. } => "MutationResponse",
            ServerMessage::ActionResponse { .. } => "ActionResponse",
            ServerMessage::AuthError { .. } => "AuthError",
            ServerMessage::FatalError { .. } => "FatalError",
            ServerMessage::Ping => "Ping",
        }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Converts a response's `success`/`result`/`errorData` triple to a result.
pub fn response_outcome(success: bool, result: &Value, error_data: &Option<Value>) -> FunctionResult {
    if success {
        return FunctionResult::Value(result.clone());
    }
    let message = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    FunctionResult::error(message, error_data.clone())
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
