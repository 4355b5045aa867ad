// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Function references.
//!
//! Server functions are addressed by a canonical path `module:function`,
//! where `module` may contain directories (`dir/module`). A path without a
//! function name refers to the module's `default` export, and a trailing
//! `.js` on the module is dropped:
//!
//! ```text
//! "messages"          -> "messages:default"
//! "messages.js:list"  -> "messages:list"
//! "chat/rooms:join"   -> "chat/rooms:join"
//! ```
//!
//! [`FunctionRegistry`] maps declared names to typed [`FunctionRef`]s so callers
//! can look functions up by name and kind instead of assembling path strings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Canonicalizes a function path to `module:function`.
pub fn canonicalize_path(path: &str) -> Result<String> {
    let (module, function) = match path.rsplit_once(':') {
        Some((module, function)) => (module, function),
        None => (path, "default"),
    };
    let module = module.strip_suffix(".js").unwrap_or(module);
    if module.is_empty() || function.is_empty() {
        return Err(Error::InvalidFunctionPath(path.to_string()));
    }
    Ok(format!("{module}:{function}"))
}

/// The kind of a server function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Query,
    Mutation,
    Action,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FunctionKind::Query => "query",
            FunctionKind::Mutation => "mutation",
            FunctionKind::Action => "action",
        };
        f.write_str(s)
    }
}

/// A reference to a server function with its canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    kind: FunctionKind,
    path: String,
}

impl FunctionRef {
    /// Creates a reference, canonicalizing the path.
    pub fn new(kind: FunctionKind, path: &str) -> Result<Self> {
        Ok(FunctionRef {
            kind,
            path: canonicalize_path(path)?,
        })
    }

    /// Creates a query reference.
    pub fn query(path: &str) -> Result<Self> {
        Self::new(FunctionKind::Query, path)
    }

    /// Creates a mutation reference.
    pub fn mutation(path: &str) -> Result<Self> {
        Self::new(FunctionKind::Mutation, path)
    }

    /// Creates an action reference.
    pub fn action(path: &str) -> Result<Self> {
        Self::new(FunctionKind::Action, path)
    }

    /// The function kind.
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// The canonical path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

/// Registry of declared server functions keyed by canonical path.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionRef>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a function. Declaring the same path twice is an error.
    pub fn declare(&mut self, kind: FunctionKind, path: &str) -> Result<FunctionRef> {
        let function = FunctionRef::new(kind, path)?;
        if self.functions.contains_key(function.path()) {
            return Err(Error::DuplicateFunction(function.path.clone()));
        }
        self.functions
            .insert(function.path.clone(), function.clone());
        Ok(function)
    }

    /// Looks up a declared function of the given kind.
    pub fn get(&self, kind: FunctionKind, path: &str) -> Result<&FunctionRef> {
        let canonical = canonicalize_path(path)?;
        let function = self
            .functions
            .get(&canonical)
            .ok_or_else(|| Error::UnknownFunction(canonical.clone()))?;
        if function.kind != kind {
            return Err(Error::FunctionKindMismatch {
                name: canonical,
                declared: function.kind.to_string(),
                requested: kind.to_string(),
            });
        }
        Ok(function)
    }

    /// Iterates over declared functions in path order.
    pub fn iter(&self) -> impl Iterator<Item = &FunctionRef> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
#[path = "function_tests.rs"]
mod tests;
