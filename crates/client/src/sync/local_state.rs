// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Client-side record of the subscribed query set and authentication.
//!
//! This is what the client *intends* the server to know, independent of
//! whether the messages describing it have been delivered. Every change
//! produces the protocol message that moves the server to the new state;
//! after a reconnect, [`LocalSyncState::restart`] replays the whole state from
//! version zero.
//!
//! While paused (an auth token fetch is outstanding), version bumps are
//! deferred: query set changes are buffered per query id and flushed as a
//! single `ModifyQuerySet` by [`LocalSyncState::resume`].

use std::collections::{BTreeMap, HashMap, HashSet};

use lq_core::{
    ClientMessage, IdentityVersion, QueryId, QuerySetModification, QuerySetVersion, QueryToken,
    TokenType,
};
use serde_json::Value;

/// A query with at least one local subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalQuery {
    pub id: QueryId,
    pub canonical_path: String,
    pub args: Value,
    pub num_subscribers: u32,
    pub journal: Option<String>,
    pub component_path: Option<String>,
}

impl LocalQuery {
    fn add_modification(&self) -> QuerySetModification {
        QuerySetModification::Add {
            query_id: self.id,
            udf_path: self.canonical_path.clone(),
            args: vec![self.args.clone()],
            journal: self.journal.clone(),
            component_path: self.component_path.clone(),
        }
    }
}

/// Credential currently configured on the client.
#[derive(Debug, Clone, PartialEq)]
enum Credential {
    User(String),
    Admin {
        value: String,
        impersonating: Option<Value>,
    },
}

impl Credential {
    fn value(&self) -> &str {
        match self {
            Credential::User(value) => value,
            Credential::Admin { value, .. } => value,
        }
    }

    fn authenticate(&self, base_version: IdentityVersion) -> ClientMessage {
        match self {
            Credential::User(value) => ClientMessage::Authenticate {
                base_version,
                token_type: TokenType::User,
                value: Some(value.clone()),
                impersonating: None,
            },
            Credential::Admin {
                value,
                impersonating,
            } => ClientMessage::Authenticate {
                base_version,
                token_type: TokenType::Admin,
                value: Some(value.clone()),
                impersonating: impersonating.clone(),
            },
        }
    }
}

/// Result of [`LocalSyncState::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribed {
    pub query_token: QueryToken,
    /// Message to send, if the server has to learn about a new query.
    pub modification: Option<ClientMessage>,
}

#[derive(Debug, Default)]
pub struct LocalSyncState {
    next_query_id: QueryId,
    query_set_version: QuerySetVersion,
    query_set: HashMap<QueryToken, LocalQuery>,
    query_id_to_token: HashMap<QueryId, QueryToken>,
    identity_version: IdentityVersion,
    auth: Option<Credential>,
    outstanding_queries_older_than_restart: HashSet<QueryId>,
    outstanding_auth_older_than_restart: bool,
    paused: bool,
    pending_query_set_modifications: BTreeMap<QueryId, QuerySetModification>,
}

impl LocalSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber for `(canonical_path, args)`.
    pub fn subscribe(
        &mut self,
        canonical_path: &str,
        args: Value,
        journal: Option<String>,
        component_path: Option<String>,
    ) -> Subscribed {
        let query_token = QueryToken::new(canonical_path, &args);
        if let Some(existing) = self.query_set.get_mut(&query_token) {
            existing.num_subscribers += 1;
            return Subscribed {
                query_token,
                modification: None,
            };
        }

        let id = self.next_query_id;
        self.next_query_id += 1;
        let query = LocalQuery {
            id,
            canonical_path: canonical_path.to_string(),
            args,
            num_subscribers: 1,
            journal,
            component_path,
        };
        let add = query.add_modification();
        self.query_set.insert(query_token.clone(), query);
        self.query_id_to_token.insert(id, query_token.clone());

        Subscribed {
            query_token,
            modification: self.modify_query_set(add),
        }
    }

    /// Drops one subscriber of `token`. Returns the `Remove` message once the
    /// last subscriber is gone (and the change is not buffered).
    pub fn remove_subscriber(&mut self, token: &QueryToken) -> Option<ClientMessage> {
        let query = self.query_set.get_mut(token)?;
        if query.num_subscribers > 1 {
            query.num_subscribers -= 1;
            return None;
        }
        let id = query.id;
        self.query_set.remove(token);
        self.query_id_to_token.remove(&id);
        self.outstanding_queries_older_than_restart.remove(&id);

        if self.paused {
            // An Add the server never saw cancels out.
            if self.pending_query_set_modifications.remove(&id).is_none() {
                self.pending_query_set_modifications
                    .insert(id, QuerySetModification::Remove { query_id: id });
            }
            return None;
        }
        self.modify_query_set(QuerySetModification::Remove { query_id: id })
    }

    fn modify_query_set(&mut self, modification: QuerySetModification) -> Option<ClientMessage> {
        if self.paused {
            self.pending_query_set_modifications
                .insert(modification.query_id(), modification);
            return None;
        }
        let base_version = self.query_set_version;
        self.query_set_version += 1;
        Some(ClientMessage::modify_query_set(
            base_version,
            self.query_set_version,
            vec![modification],
        ))
    }

    /// Records query journals and clears restart tracking for reported queries.
    pub fn transition(&mut self, modifications: &[lq_core::StateModification]) {
        use lq_core::StateModification;

        for modification in modifications {
            let query_id = modification.query_id();
            self.outstanding_queries_older_than_restart.remove(&query_id);
            let journal = match modification {
                StateModification::QueryUpdated { journal, .. }
                | StateModification::QueryFailed { journal, .. } => journal,
                StateModification::QueryRemoved { .. } => continue,
            };
            if let Some(journal) = journal {
                if let Some(query) = self
                    .query_id_to_token
                    .get(&query_id)
                    .and_then(|token| self.query_set.get_mut(token))
                {
                    query.journal = Some(journal.clone());
                }
            }
        }
    }

    pub fn query_id(&self, token: &QueryToken) -> Option<QueryId> {
        self.query_set.get(token).map(|q| q.id)
    }

    pub fn query_token(&self, id: QueryId) -> Option<&QueryToken> {
        self.query_id_to_token.get(&id)
    }

    pub fn query(&self, token: &QueryToken) -> Option<&LocalQuery> {
        self.query_set.get(token)
    }

    pub fn query_by_id(&self, id: QueryId) -> Option<&LocalQuery> {
        self.query_token(id).and_then(|t| self.query_set.get(t))
    }

    pub fn query_journal(&self, token: &QueryToken) -> Option<String> {
        self.query_set.get(token).and_then(|q| q.journal.clone())
    }

    #[cfg(test)]
    pub fn query_count(&self) -> usize {
        self.query_set.len()
    }

    pub fn query_set_version(&self) -> QuerySetVersion {
        self.query_set_version
    }

    pub fn identity_version(&self) -> IdentityVersion {
        self.identity_version
    }

    /// Whether `version` is the identity the client currently uses (or newer).
    pub fn is_current_or_newer_auth_version(&self, version: IdentityVersion) -> bool {
        version >= self.identity_version
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Whether `value` differs from the configured credential.
    pub fn is_new_auth(&self, value: &str) -> bool {
        self.auth.as_ref().is_none_or(|a| a.value() != value)
    }

    pub fn set_auth(&mut self, value: String) -> ClientMessage {
        self.replace_auth(Some(Credential::User(value)))
    }

    pub fn set_admin_auth(&mut self, value: String, impersonating: Option<Value>) -> ClientMessage {
        self.replace_auth(Some(Credential::Admin {
            value,
            impersonating,
        }))
    }

    pub fn clear_auth(&mut self) -> ClientMessage {
        self.mark_auth_completion();
        self.replace_auth(None)
    }

    fn replace_auth(&mut self, auth: Option<Credential>) -> ClientMessage {
        self.auth = auth;
        let base_version = self.identity_version;
        if !self.paused {
            self.identity_version += 1;
        }
        self.authenticate_message(base_version)
    }

    fn authenticate_message(&self, base_version: IdentityVersion) -> ClientMessage {
        match &self.auth {
            Some(credential) => credential.authenticate(base_version),
            None => ClientMessage::Authenticate {
                base_version,
                token_type: TokenType::None,
                value: None,
                impersonating: None,
            },
        }
    }

    pub fn mark_auth_completion(&mut self) {
        self.outstanding_auth_older_than_restart = false;
    }

    /// Whether every query and credential replayed at the last restart has
    /// been confirmed by the server.
    pub fn has_synced_past_last_reconnect(&self) -> bool {
        self.outstanding_queries_older_than_restart.is_empty()
            && !self.outstanding_auth_older_than_restart
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Unpauses and returns the deferred `(query set, authenticate)` messages.
    pub fn resume(&mut self) -> (Option<ClientMessage>, Option<ClientMessage>) {
        let query_set = if self.pending_query_set_modifications.is_empty() {
            None
        } else {
            let modifications = std::mem::take(&mut self.pending_query_set_modifications)
                .into_values()
                .collect();
            let base_version = self.query_set_version;
            self.query_set_version += 1;
            Some(ClientMessage::modify_query_set(
                base_version,
                self.query_set_version,
                modifications,
            ))
        };
        let authenticate = if self.auth.is_some() {
            let base_version = self.identity_version;
            self.identity_version += 1;
            Some(self.authenticate_message(base_version))
        } else {
            None
        };
        self.paused = false;
        (query_set, authenticate)
    }

    /// Rebuilds the server's view after a reconnect.
    ///
    /// Returns a `ModifyQuerySet` from version 0 re-adding every query, and an
    /// `Authenticate` from identity 0 when a credential is configured. Queries
    /// whose id is not in `known_results` are tracked until the server reports
    /// on them.
    pub fn restart(
        &mut self,
        known_results: &HashSet<QueryId>,
    ) -> (ClientMessage, Option<ClientMessage>) {
        self.paused = false;
        self.pending_query_set_modifications.clear();
        self.outstanding_queries_older_than_restart.clear();

        let mut queries: Vec<&LocalQuery> = self.query_set.values().collect();
        queries.sort_by_key(|q| q.id);
        let mut modifications = Vec::with_capacity(queries.len());
        for query in queries {
            modifications.push(query.add_modification());
            if !known_results.contains(&query.id) {
                self.outstanding_queries_older_than_restart.insert(query.id);
            }
        }
        self.query_set_version = 1;
        let query_set = ClientMessage::modify_query_set(0, 1, modifications);

        if self.auth.is_none() {
            self.identity_version = 0;
            return (query_set, None);
        }
        let authenticate = self.authenticate_message(0);
        self.identity_version = 1;
        self.outstanding_auth_older_than_restart = true;
        (query_set, Some(authenticate))
    }
}

#[cfg(test)]
#[path = "local_state_tests.rs"]
mod tests;
