// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! lq-core: Shared protocol and data model for the livequery sync client.
//!
//! This crate provides the wire messages exchanged with a deployment, the
//! logical timestamp type, function path canonicalization, and the query
//! token / function result types used by the client engine.

pub mod error;
pub mod function;
pub mod protocol;
pub mod timestamp;
pub mod value;

pub use error::{Error, Result};
pub use function::{canonicalize_path, FunctionKind, FunctionRef, FunctionRegistry};
pub use protocol::{
    ClientMessage, IdentityVersion, QueryId, QuerySetModification, QuerySetVersion, RequestId,
    ServerMessage, StateModification, StateVersion, TokenType,
};
pub use timestamp::Timestamp;
pub use value::{validate_args, FunctionResult, QueryToken};
