// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Authentication token lifecycle.
//!
//! A token is fetched, sent speculatively, and confirmed when a server
//! `Transition` advances the identity version. Confirmed tokens are refreshed
//! shortly before they expire. Rejected tokens trigger a forced refetch, a
//! bounded number of times.
//!
//! Fetches run as separate tasks and report back through a channel. Each
//! fetch is stamped with the config version current when it started; a
//! result whose stamp is no longer current was overtaken by a newer fetch,
//! `set_config` or `stop` and is dropped.
//!
//! The manager never touches the socket or the local state directly. It
//! drives them through [`AuthHost`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lq_core::{IdentityVersion, ServerMessage};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Reauthentication attempts for a fresh token before giving up.
pub const MAX_TOKEN_CONFIRMATION_ATTEMPTS: u32 = 2;

/// Upper bound on how far ahead a refresh is scheduled.
pub const MAXIMUM_REFRESH_DELAY: Duration = Duration::from_secs(20 * 24 * 60 * 60);

/// Tokens living this long or less are not refreshed.
const MINIMUM_TOKEN_LIFETIME_SECS: i64 = 2;

/// Supplies auth tokens. `force_refresh_token` asks for a token that is not
/// served from a cache.
pub trait AuthTokenFetcher: Send + Sync {
    fn fetch_token(
        &self,
        force_refresh_token: bool,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;
}

impl<F, Fut> AuthTokenFetcher for F
where
    F: Fn(bool) -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    fn fetch_token(
        &self,
        force_refresh_token: bool,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        Box::pin(self(force_refresh_token))
    }
}

/// Told whether the client is authenticated whenever that changes.
pub type AuthChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Serializes token fetches. Clients sharing a lock never fetch concurrently.
#[derive(Clone, Default)]
pub struct TokenFetchLock(Arc<tokio::sync::Mutex<()>>);

impl TokenFetchLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for TokenFetchLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenFetchLock").finish()
    }
}

/// Where tokens come from and who hears about auth changes.
#[derive(Clone)]
pub struct AuthConfig {
    pub fetch_token: Arc<dyn AuthTokenFetcher>,
    pub on_auth_change: AuthChangeCallback,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig").finish_non_exhaustive()
    }
}

/// What the manager needs from the rest of the client.
pub trait AuthHost {
    /// Installs `token` locally and sends it to the server.
    fn authenticate(&mut self, token: &str);
    /// Removes the credential locally and tells the server.
    fn clear_auth(&mut self);
    fn has_auth(&self) -> bool;
    fn is_new_auth(&self, token: &str) -> bool;
    fn is_current_or_newer_auth_version(&self, version: IdentityVersion) -> bool;
    fn mark_auth_completion(&mut self);
    fn pause_socket(&mut self);
    fn resume_socket(&mut self);
    fn stop_socket(&mut self);
    fn try_restart_socket(&mut self);
}

#[derive(Debug)]
enum AuthState {
    NoAuth,
    /// First fetch returned nothing; forcing a fresh token.
    InitialRefetch { config: AuthConfig },
    WaitingForServerConfirmationOfCachedToken { config: AuthConfig },
    WaitingForServerConfirmationOfFreshToken {
        config: AuthConfig,
        token: String,
        had_auth: bool,
    },
    NotRefetching { config: AuthConfig },
    WaitingForScheduledRefetch {
        config: AuthConfig,
        /// `None` once the refetch has started.
        refetch_at: Option<Instant>,
    },
}

impl AuthState {
    fn name(&self) -> &'static str {
        match self {
            AuthState::NoAuth => "noAuth",
            AuthState::InitialRefetch { .. } => "initialRefetch",
            AuthState::WaitingForServerConfirmationOfCachedToken { .. } => {
                "waitingForServerConfirmationOfCachedToken"
            }
            AuthState::WaitingForServerConfirmationOfFreshToken { .. } => {
                "waitingForServerConfirmationOfFreshToken"
            }
            AuthState::NotRefetching { .. } => "notRefetching",
            AuthState::WaitingForScheduledRefetch { .. } => "waitingForScheduledRefetch",
        }
    }

    fn config(&self) -> Option<&AuthConfig> {
        match self {
            AuthState::NoAuth => None,
            AuthState::InitialRefetch { config }
            | AuthState::WaitingForServerConfirmationOfCachedToken { config }
            | AuthState::WaitingForServerConfirmationOfFreshToken { config, .. }
            | AuthState::NotRefetching { config }
            | AuthState::WaitingForScheduledRefetch { config, .. } => Some(config),
        }
    }
}

/// Why a fetch was started; decides what happens with its token.
#[derive(Debug)]
pub enum FetchPurpose {
    /// First fetch after `set_config`; a cached token is fine.
    SetConfig(AuthConfig),
    /// Forced refresh; resumes the socket afterwards when it was paused for
    /// the initial fetch.
    Refetch { resume_socket: bool },
    /// Forced refresh after the server rejected the current token.
    Reauthenticate,
}

/// A finished token fetch.
#[derive(Debug)]
pub struct AuthFetchResult {
    pub config_version: u64,
    pub purpose: FetchPurpose,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    iat: Option<i64>,
    exp: Option<i64>,
}

fn decode_claims(token: &str) -> Option<JwtClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Last characters of a token, safe to log.
pub fn token_suffix(token: &str) -> &str {
    let start = token
        .char_indices()
        .rev()
        .nth(6)
        .map_or(0, |(index, _)| index);
    &token[start..]
}

/// Delay before refreshing `token`, or `None` when it cannot be scheduled.
pub fn refresh_delay(token: &str, leeway: Duration) -> Option<Duration> {
    let Some(claims) = decode_claims(token) else {
        error!("auth token is not a valid JWT, cannot refetch the token");
        return None;
    };
    let (Some(iat), Some(exp)) = (claims.iat, claims.exp) else {
        error!("auth token does not have required fields, cannot refetch the token");
        return None;
    };
    let lifetime_secs = exp - iat;
    if lifetime_secs <= MINIMUM_TOKEN_LIFETIME_SECS {
        error!(
            lifetime_secs,
            "auth token does not live long enough, cannot refetch the token"
        );
        return None;
    }
    let leeway_secs = i64::try_from(leeway.as_secs()).unwrap_or(i64::MAX);
    let refresh_in_secs = lifetime_secs.saturating_sub(leeway_secs);
    if refresh_in_secs <= 0 {
        warn!(
            leeway_secs,
            lifetime_secs,
            "refetching auth token immediately, configured leeway is larger than the token's lifetime"
        );
        return Some(Duration::ZERO);
    }
    let delay = Duration::from_secs(u64::try_from(refresh_in_secs).unwrap_or(u64::MAX));
    Some(delay.min(MAXIMUM_REFRESH_DELAY))
}

pub struct AuthenticationManager {
    auth_state: AuthState,
    config_version: u64,
    token_confirmation_attempts: u32,
    refresh_token_leeway: Duration,
    fetch_lock: TokenFetchLock,
    results: mpsc::UnboundedSender<AuthFetchResult>,
    /// The socket is paused for the initial token fetch.
    paused_socket: bool,
    /// The socket is stopped while a rejected token is replaced.
    stopped_socket: bool,
}

impl AuthenticationManager {
    pub fn new(
        refresh_token_leeway: Duration,
        fetch_lock: TokenFetchLock,
        results: mpsc::UnboundedSender<AuthFetchResult>,
    ) -> Self {
        AuthenticationManager {
            auth_state: AuthState::NoAuth,
            config_version: 0,
            token_confirmation_attempts: 0,
            refresh_token_leeway,
            fetch_lock,
            results,
            paused_socket: false,
            stopped_socket: false,
        }
    }

    /// Name of the current state, for logs and tests.
    pub fn state_name(&self) -> &'static str {
        self.auth_state.name()
    }

    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    /// When the scheduled refresh is due.
    pub fn refetch_at(&self) -> Option<Instant> {
        match self.auth_state {
            AuthState::WaitingForScheduledRefetch { refetch_at, .. } => refetch_at,
            _ => None,
        }
    }

    /// Starts authenticating with tokens from `config`.
    ///
    /// The socket stays paused until a first token has been sent, so no
    /// request goes out under the previous identity.
    pub fn set_config(&mut self, config: AuthConfig, host: &mut dyn AuthHost) {
        self.set_auth_state(AuthState::NoAuth, host);
        // A pause only takes hold on a live socket.
        self.restart_stopped_socket(host);
        debug!("pausing socket for auth token fetch");
        if !self.paused_socket {
            host.pause_socket();
            self.paused_socket = true;
        }
        let fetcher = Arc::clone(&config.fetch_token);
        self.fetch(fetcher, false, FetchPurpose::SetConfig(config));
    }

    fn fetch(
        &mut self,
        fetcher: Arc<dyn AuthTokenFetcher>,
        force_refresh_token: bool,
        purpose: FetchPurpose,
    ) {
        self.config_version += 1;
        let config_version = self.config_version;
        debug!(config_version, force_refresh_token, "fetching auth token");
        let lock = self.fetch_lock.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            let token = {
                let _guard = lock.0.lock().await;
                fetcher.fetch_token(force_refresh_token).await
            };
            let _ = results.send(AuthFetchResult {
                config_version,
                purpose,
                token,
            });
        });
    }

    /// Continues the flow that started a fetch.
    pub fn on_fetch_result(&mut self, result: AuthFetchResult, host: &mut dyn AuthHost) {
        if result.config_version != self.config_version {
            debug!(
                expected = self.config_version,
                got = result.config_version,
                "dropping token from stale config version"
            );
            return;
        }
        match result.purpose {
            FetchPurpose::SetConfig(config) => match result.token {
                Some(token) => {
                    self.set_auth_state(
                        AuthState::WaitingForServerConfirmationOfCachedToken { config },
                        host,
                    );
                    self.authenticate(&token, host);
                    self.resume_socket(host);
                }
                None => {
                    self.set_auth_state(AuthState::InitialRefetch { config }, host);
                    self.refetch_token(true);
                }
            },
            FetchPurpose::Refetch { resume_socket } => {
                self.finish_refetch(result.token, host);
                if resume_socket {
                    self.resume_socket(host);
                }
            }
            FetchPurpose::Reauthenticate => self.finish_reauthenticate(result.token, host),
        }
    }

    fn authenticate(&mut self, token: &str, host: &mut dyn AuthHost) {
        debug!(token = token_suffix(token), "sending auth token");
        host.authenticate(token);
    }

    fn resume_socket(&mut self, host: &mut dyn AuthHost) {
        if self.paused_socket {
            debug!("resuming socket after auth token fetch");
            self.paused_socket = false;
            host.resume_socket();
        }
    }

    /// Reconnects a socket stopped for a reauthentication whose fetch was
    /// superseded.
    fn restart_stopped_socket(&mut self, host: &mut dyn AuthHost) {
        if std::mem::take(&mut self.stopped_socket) {
            debug!("restarting socket stopped for reauthentication");
            host.try_restart_socket();
        }
    }

    /// Forces a fresh token; continues in [`Self::finish_refetch`].
    fn refetch_token(&mut self, resume_socket: bool) {
        let Some(config) = self.auth_state.config() else {
            return;
        };
        debug!("refetching auth token");
        let fetcher = Arc::clone(&config.fetch_token);
        self.fetch(fetcher, true, FetchPurpose::Refetch { resume_socket });
    }

    fn finish_refetch(&mut self, token: Option<String>, host: &mut dyn AuthHost) {
        let Some(config) = self.auth_state.config().cloned() else {
            return;
        };
        match token {
            Some(token) if host.is_new_auth(&token) => {
                let had_auth = host.has_auth();
                self.set_auth_state(
                    AuthState::WaitingForServerConfirmationOfFreshToken {
                        config,
                        token: token.clone(),
                        had_auth,
                    },
                    host,
                );
                self.authenticate(&token, host);
            }
            Some(_) => self.set_auth_state(AuthState::NotRefetching { config }, host),
            None => {
                debug!("refetching token failed");
                if host.has_auth() {
                    host.clear_auth();
                }
                self.set_and_report_auth_failed(&config, host);
            }
        }
        self.stopped_socket = false;
        host.try_restart_socket();
    }

    /// Handles a server `Transition`; identity advances confirm the token in
    /// flight.
    pub fn on_transition(&mut self, transition: &ServerMessage, host: &mut dyn AuthHost) {
        let ServerMessage::Transition {
            start_version,
            end_version,
            ..
        } = transition
        else {
            return;
        };
        if !host.is_current_or_newer_auth_version(end_version.identity) {
            // Stale: the client has already moved to a newer identity.
            return;
        }
        if end_version.identity <= start_version.identity {
            return;
        }
        match &self.auth_state {
            AuthState::WaitingForServerConfirmationOfCachedToken { config } => {
                debug!("server confirmed auth token is valid");
                let on_change = Arc::clone(&config.on_auth_change);
                self.refetch_token(false);
                on_change(true);
            }
            AuthState::WaitingForServerConfirmationOfFreshToken {
                config,
                token,
                had_auth,
            } => {
                debug!("server confirmed new auth token is valid");
                let on_change = Arc::clone(&config.on_auth_change);
                let had_auth = *had_auth;
                let token = token.clone();
                self.schedule_token_refetch(&token, host);
                self.token_confirmation_attempts = 0;
                if !had_auth {
                    on_change(true);
                }
            }
            _ => {}
        }
    }

    fn schedule_token_refetch(&mut self, token: &str, host: &mut dyn AuthHost) {
        let Some(config) = self.auth_state.config().cloned() else {
            return;
        };
        let Some(delay) = refresh_delay(token, self.refresh_token_leeway) else {
            return;
        };
        debug!(delay_ms = delay.as_millis() as u64, "scheduled auth token refetch");
        self.set_auth_state(
            AuthState::WaitingForScheduledRefetch {
                config,
                refetch_at: Some(Instant::now() + delay),
            },
            host,
        );
    }

    /// The scheduled refresh is due.
    pub fn on_refetch_timer(&mut self) {
        if let AuthState::WaitingForScheduledRefetch { refetch_at, .. } = &mut self.auth_state {
            if refetch_at.take().is_some() {
                debug!("running scheduled token refetch");
                self.refetch_token(false);
            }
        }
    }

    /// Handles a server `AuthError`.
    pub fn on_auth_error(&mut self, auth_error: &ServerMessage, host: &mut dyn AuthHost) {
        let ServerMessage::AuthError {
            error: message,
            base_version,
            auth_update_attempted,
        } = auth_error
        else {
            return;
        };
        let waiting_for_confirmation = matches!(
            self.auth_state,
            AuthState::WaitingForServerConfirmationOfFreshToken { .. }
                | AuthState::WaitingForServerConfirmationOfCachedToken { .. }
        );
        if !auth_update_attempted && waiting_for_confirmation {
            debug!("ignoring non-auth token expired error");
            return;
        }
        // The error reports the version the server stayed at.
        if !host.is_current_or_newer_auth_version(base_version + 1) {
            debug!("ignoring auth error for previous auth attempt");
            return;
        }
        self.try_to_reauthenticate(message, host);
    }

    fn try_to_reauthenticate(&mut self, message: &str, host: &mut dyn AuthHost) {
        debug!(error = message, "attempting to reauthenticate");
        let exhausted = matches!(
            self.auth_state,
            AuthState::WaitingForServerConfirmationOfFreshToken { .. }
        ) && self.token_confirmation_attempts >= MAX_TOKEN_CONFIRMATION_ATTEMPTS;
        let Some(config) = self.auth_state.config().cloned() else {
            error!(error = message, "failed to authenticate, check your server auth config");
            if host.has_auth() {
                host.clear_auth();
            }
            return;
        };
        if exhausted {
            error!(error = message, "failed to authenticate, check your server auth config");
            if host.has_auth() {
                host.clear_auth();
            }
            self.set_and_report_auth_failed(&config, host);
            return;
        }
        if matches!(
            self.auth_state,
            AuthState::WaitingForServerConfirmationOfFreshToken { .. }
        ) {
            self.token_confirmation_attempts += 1;
            debug!(
                remaining = MAX_TOKEN_CONFIRMATION_ATTEMPTS - self.token_confirmation_attempts,
                "retrying reauthentication"
            );
        }
        host.stop_socket();
        self.stopped_socket = true;
        self.fetch(config.fetch_token, true, FetchPurpose::Reauthenticate);
    }

    fn finish_reauthenticate(&mut self, token: Option<String>, host: &mut dyn AuthHost) {
        let Some(config) = self.auth_state.config().cloned() else {
            self.restart_stopped_socket(host);
            return;
        };
        match token {
            Some(token) if host.is_new_auth(&token) => {
                let had_auth = matches!(
                    self.auth_state,
                    AuthState::NotRefetching { .. } | AuthState::WaitingForScheduledRefetch { .. }
                );
                self.authenticate(&token, host);
                self.set_auth_state(
                    AuthState::WaitingForServerConfirmationOfFreshToken {
                        config,
                        token,
                        had_auth,
                    },
                    host,
                );
            }
            _ => {
                debug!("reauthentication failed, could not fetch a new token");
                if host.has_auth() {
                    host.clear_auth();
                }
                self.set_and_report_auth_failed(&config, host);
            }
        }
        self.stopped_socket = false;
        host.try_restart_socket();
    }

    fn set_and_report_auth_failed(&mut self, config: &AuthConfig, host: &mut dyn AuthHost) {
        (config.on_auth_change)(false);
        self.set_auth_state(AuthState::NoAuth, host);
    }

    fn set_auth_state(&mut self, new_state: AuthState, host: &mut dyn AuthHost) {
        debug!(from = self.auth_state.name(), to = new_state.name(), "auth state");
        if matches!(
            new_state,
            AuthState::NoAuth
                | AuthState::NotRefetching { .. }
                | AuthState::WaitingForScheduledRefetch { .. }
        ) {
            self.token_confirmation_attempts = 0;
        }
        if matches!(self.auth_state, AuthState::WaitingForScheduledRefetch { .. }) {
            // The most settled authenticated state; failure backoffs may reset.
            host.mark_auth_completion();
        }
        self.auth_state = new_state;
    }

    /// Forgets the configuration. Fetches in flight are discarded; a socket
    /// paused for the initial fetch is resumed and one stopped for
    /// reauthentication is reconnected.
    pub fn stop(&mut self, host: &mut dyn AuthHost) {
        self.set_auth_state(AuthState::NoAuth, host);
        self.config_version += 1;
        debug!(config_version = self.config_version, "auth config version bumped");
        self.resume_socket(host);
        self.restart_stopped_socket(host);
    }
}

impl fmt::Debug for AuthenticationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationManager")
            .field("state", &self.auth_state.name())
            .field("config_version", &self.config_version)
            .field("token_confirmation_attempts", &self.token_confirmation_attempts)
            .finish()
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
