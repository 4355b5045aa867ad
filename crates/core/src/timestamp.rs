// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Logical server timestamps.
//!
//! The server orders every commit with a monotonic 64-bit timestamp. On the
//! wire it travels as the base64 encoding of its little-endian bytes so that
//! JSON peers without 64-bit integers do not lose precision:
//!
//! ```text
//! 1234 -> [0xd2, 0x04, 0, 0, 0, 0, 0, 0] -> "0gQAAAAAAAA="
//! ```
//!
//! Plain JSON integers are also accepted when decoding.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A logical server timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from its raw value.
    pub const fn new(value: i64) -> Self {
        Timestamp(value)
    }

    /// Returns the raw value.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Encodes the timestamp in its wire form.
    pub fn encode(self) -> String {
        STANDARD.encode(self.0.to_le_bytes())
    }

    /// Decodes a timestamp from its wire form.
    pub fn decode(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s)
            .map_err(|e| Error::InvalidTimestamp(format!("'{s}': {e}")))?;
        let bytes: [u8; 8] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::InvalidTimestamp(format!("'{s}': expected 8 bytes, got {}", b.len()))
        })?;
        Ok(Timestamp(i64::from_le_bytes(bytes)))
    }
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Timestamp(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

struct TimestampVisitor;

impl Visitor<'_> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a base64-encoded 64-bit timestamp or an integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Timestamp, E> {
        Timestamp::decode(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Timestamp, E> {
        Ok(Timestamp(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Timestamp, E> {
        i64::try_from(v)
            .map(Timestamp)
            .map_err(|_| E::custom(format!("timestamp {v} out of range")))
    }
}

#[cfg(test)]
#[path = "timestamp_tests.rs"]
mod tests;
