// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket lifecycle: connect, pause, reconnect with backoff.
//!
//! The manager is synchronous. It spawns a connection task per attempt and
//! keeps its timers as deadlines that the client worker sleeps on. Every
//! connection gets a new epoch; events from older epochs are ignored, so
//! dropping a [`ConnectionHandle`] is all it takes to abandon a connection.
//!
//! ```text
//!             connect()            open
//! Disconnected ─────────► Connecting ────► Ready
//!      ▲                      │              │
//!      └──── backoff ◄────────┴── close ─────┘
//!
//! stop(): any ──► Stopped ── try_restart() ──► Connecting
//! terminate(): any ──► Terminated
//! ```

use lq_core::ClientMessage;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::transport::{run_connection, CloseInfo, SocketEvent, TransportFactory};
use crate::config::ClientConfig;

/// Close codes that are part of normal operation.
const NORMAL_CLOSE_CODES: [u16; 4] = [1000, 1001, 1005, 4040];

/// Base delay after a client-initiated close.
const CLIENT_CLOSE_BACKOFF: Duration = Duration::from_millis(100);

/// Server close reasons with their own base delay, matched by prefix.
const SERVER_DISCONNECT_BACKOFFS: &[(&str, Duration)] = &[
    ("InternalServerError", Duration::from_secs(1)),
    ("SubscriptionsWorkerFullError", Duration::from_secs(3)),
    ("TooManyConcurrentRequests", Duration::from_secs(3)),
    ("CommitterFullError", Duration::from_secs(3)),
    ("AwsTooManyRequestsException", Duration::from_secs(3)),
    ("ExecuteFullError", Duration::from_secs(3)),
    ("SystemTimeoutError", Duration::from_secs(3)),
    ("ExpiredInQueue", Duration::from_secs(3)),
    ("VectorIndexesUnavailable", Duration::from_secs(1)),
    ("SearchIndexesUnavailable", Duration::from_secs(1)),
    ("TableSummariesUnavailable", Duration::from_secs(1)),
    ("VectorIndexTooLarge", Duration::from_secs(3)),
    ("SearchIndexTooLarge", Duration::from_secs(3)),
    ("TooManyWritesInTimePeriod", Duration::from_secs(3)),
];

/// Why a reconnect is being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// The client closed the connection itself.
    Client,
    /// The server closed it with a recognized reason prefix.
    Server(&'static str),
    Unknown,
}

impl ReconnectReason {
    /// Classifies a server close reason by its prefix.
    pub fn classify(reason: &str) -> Self {
        SERVER_DISCONNECT_BACKOFFS
            .iter()
            .find(|(prefix, _)| reason.starts_with(prefix))
            .map_or(ReconnectReason::Unknown, |(prefix, _)| {
                ReconnectReason::Server(prefix)
            })
    }

    fn base_delay(self, unknown: Duration) -> Duration {
        match self {
            ReconnectReason::Client => CLIENT_CLOSE_BACKOFF,
            ReconnectReason::Server(prefix) => SERVER_DISCONNECT_BACKOFFS
                .iter()
                .find(|(p, _)| *p == prefix)
                .map_or(unknown, |(_, delay)| *delay),
            ReconnectReason::Unknown => unknown,
        }
    }
}

/// Reconnect delay: `min(base * 2^retries, max)` scaled by `0.5 + jitter`,
/// with `jitter` in `[0, 1)`.
pub fn backoff_delay(base: Duration, retries: u32, max: Duration, jitter: f64) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let capped_ms = base_ms
        .saturating_mul(1u64 << retries.min(32))
        .min(max_ms);
    let jittered = capped_ms as f64 * (0.5 + jitter.clamp(0.0, 1.0));
    Duration::from_millis(jittered.round() as u64)
}

/// Whether sends are held back while a connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    No,
    Yes,
    /// Paused before the socket opened; the open has not been reported yet.
    Uninitialized,
}

/// Live connection owned by the manager.
#[derive(Debug)]
pub struct ConnectionHandle {
    epoch: u64,
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

#[derive(Debug)]
enum SocketState {
    Disconnected,
    Connecting {
        conn: ConnectionHandle,
        paused: PauseState,
    },
    Ready {
        conn: ConnectionHandle,
        paused: PauseState,
    },
    Stopped,
    Terminated,
}

/// Reported with every (re)open so the server can tell connections apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectMetadata {
    pub connection_count: u32,
    pub last_close_reason: Option<String>,
    pub client_ts: i64,
}

/// Outcome of [`WebSocketManager::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing was paused.
    Nothing,
    /// The open was deferred by the pause and happens now.
    Opened(ReconnectMetadata),
    /// An already-open connection was unpaused.
    Resumed,
}

/// Socket-level part of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketStatus {
    pub is_connected: bool,
    pub has_ever_connected: bool,
    pub connection_count: u32,
    pub connection_retries: u32,
}

pub struct WebSocketManager {
    url: String,
    factory: TransportFactory,
    events: mpsc::UnboundedSender<SocketEvent>,
    socket: SocketState,
    next_epoch: u64,
    connection_count: u32,
    last_close_reason: Option<String>,
    retries: u32,
    has_ever_connected: bool,
    initial_backoff: Duration,
    max_backoff: Duration,
    inactivity_threshold: Duration,
    reconnect_at: Option<Instant>,
    inactivity_deadline: Option<Instant>,
}

impl WebSocketManager {
    pub fn new(
        config: &ClientConfig,
        factory: TransportFactory,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        WebSocketManager {
            url: config.websocket_url(),
            factory,
            events,
            socket: SocketState::Disconnected,
            next_epoch: 0,
            connection_count: 0,
            last_close_reason: Some("InitialConnect".to_string()),
            retries: 0,
            has_ever_connected: false,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            inactivity_threshold: config.server_inactivity_threshold(),
            reconnect_at: None,
            inactivity_deadline: None,
        }
    }

    /// Starts a connection attempt. Only valid when disconnected or stopped.
    pub fn connect(&mut self) {
        match self.socket {
            SocketState::Disconnected | SocketState::Stopped => {}
            SocketState::Terminated => return,
            SocketState::Connecting { .. } | SocketState::Ready { .. } => {
                debug!("connect called while a connection is active");
                return;
            }
        }
        self.reconnect_at = None;
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            (self.factory)(),
            self.url.clone(),
            epoch,
            outbound_rx,
            self.events.clone(),
        ));
        debug!(epoch, url = %self.url, "connecting");
        self.socket = SocketState::Connecting {
            conn: ConnectionHandle { epoch, outbound },
            paused: PauseState::No,
        };
        self.inactivity_deadline = Some(Instant::now() + self.inactivity_threshold);
    }

    fn current_epoch(&self) -> Option<u64> {
        match &self.socket {
            SocketState::Connecting { conn, .. } | SocketState::Ready { conn, .. } => {
                Some(conn.epoch)
            }
            _ => None,
        }
    }

    /// Whether `epoch` is the connection the manager currently owns.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == Some(epoch)
    }

    /// The socket opened. Returns the metadata to report when the open should
    /// be handled now (it is deferred while paused).
    pub fn on_open(&mut self, epoch: u64) -> Option<ReconnectMetadata> {
        if !self.is_current(epoch) || !matches!(self.socket, SocketState::Connecting { .. }) {
            return None;
        }
        let SocketState::Connecting { conn, paused } =
            std::mem::replace(&mut self.socket, SocketState::Disconnected)
        else {
            return None;
        };
        self.inactivity_deadline = Some(Instant::now() + self.inactivity_threshold);
        self.has_ever_connected = true;
        if paused == PauseState::Yes {
            self.socket = SocketState::Ready {
                conn,
                paused: PauseState::Uninitialized,
            };
            return None;
        }
        self.socket = SocketState::Ready {
            conn,
            paused: PauseState::No,
        };
        Some(self.take_reconnect_metadata())
    }

    fn take_reconnect_metadata(&mut self) -> ReconnectMetadata {
        let metadata = ReconnectMetadata {
            connection_count: self.connection_count,
            last_close_reason: self.last_close_reason.take(),
            client_ts: chrono::Utc::now().timestamp_millis(),
        };
        self.connection_count += 1;
        metadata
    }

    /// A message arrived on `epoch`. Returns whether it should be handled.
    pub fn on_message(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.inactivity_deadline = Some(Instant::now() + self.inactivity_threshold);
        true
    }

    /// Called after a message was handled. Once the client has fully caught up
    /// after a reconnect, the backoff starts over.
    pub fn after_message(&mut self, has_synced_past_last_reconnect: bool) {
        if has_synced_past_last_reconnect && self.retries > 0 {
            debug!("resynced, resetting reconnect backoff");
            self.retries = 0;
        }
    }

    /// The connection on `epoch` closed.
    pub fn on_close(&mut self, epoch: u64, close: &CloseInfo) {
        if !self.is_current(epoch) {
            return;
        }
        if self.last_close_reason.is_none() {
            self.last_close_reason = Some(if close.reason.is_empty() {
                "OnCloseInvoked".to_string()
            } else {
                close.reason.clone()
            });
        }
        if !NORMAL_CLOSE_CODES.contains(&close.code) {
            if close.reason.is_empty() {
                warn!(code = close.code, "websocket closed");
            } else {
                warn!(code = close.code, reason = %close.reason, "websocket closed");
            }
        }
        self.schedule_reconnect(ReconnectReason::classify(&close.reason));
    }

    fn schedule_reconnect(&mut self, reason: ReconnectReason) {
        self.socket = SocketState::Disconnected;
        self.inactivity_deadline = None;
        let delay = backoff_delay(
            reason.base_delay(self.initial_backoff),
            self.retries,
            self.max_backoff,
            rand::random::<f64>(),
        );
        self.retries += 1;
        info!(delay_ms = delay.as_millis() as u64, ?reason, "attempting reconnect");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Sends `msg` if the socket is ready and not paused.
    pub fn send(&mut self, msg: ClientMessage) -> bool {
        let SocketState::Ready {
            conn,
            paused: PauseState::No,
        } = &self.socket
        else {
            return false;
        };
        debug!(kind = msg.kind(), "sending message");
        if conn.outbound.send(msg).is_err() {
            self.close_and_reconnect("FailedToSendMessage");
            return false;
        }
        true
    }

    /// Drops the current connection and reconnects after a short delay.
    pub fn close_and_reconnect(&mut self, reason: &str) {
        match self.socket {
            SocketState::Connecting { .. } | SocketState::Ready { .. } => {
                debug!(reason, "closing connection to reconnect");
                self.last_close_reason = Some(reason.to_string());
                self.schedule_reconnect(ReconnectReason::Client);
            }
            SocketState::Disconnected | SocketState::Stopped | SocketState::Terminated => {}
        }
    }

    /// Deadline of the pending reconnect, if any.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Deadline after which a silent server is considered dead.
    pub fn inactivity_deadline(&self) -> Option<Instant> {
        self.inactivity_deadline
    }

    pub fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        if matches!(self.socket, SocketState::Disconnected) {
            self.connect();
        }
    }

    pub fn on_inactivity_timeout(&mut self) {
        self.inactivity_deadline = None;
        self.close_and_reconnect("InactiveServer");
    }

    /// Holds back sends without closing the socket.
    pub fn pause(&mut self) {
        match &mut self.socket {
            SocketState::Connecting { paused, .. } | SocketState::Ready { paused, .. } => {
                if *paused == PauseState::No {
                    *paused = PauseState::Yes;
                }
            }
            SocketState::Disconnected | SocketState::Stopped | SocketState::Terminated => {}
        }
    }

    pub fn resume(&mut self) -> ResumeOutcome {
        let previous = match &mut self.socket {
            SocketState::Connecting { paused, .. } | SocketState::Ready { paused, .. } => {
                std::mem::replace(paused, PauseState::No)
            }
            SocketState::Disconnected | SocketState::Stopped | SocketState::Terminated => {
                return ResumeOutcome::Nothing;
            }
        };
        if !matches!(self.socket, SocketState::Ready { .. }) {
            return ResumeOutcome::Nothing;
        }
        match previous {
            PauseState::No => ResumeOutcome::Nothing,
            PauseState::Yes => ResumeOutcome::Resumed,
            PauseState::Uninitialized => ResumeOutcome::Opened(self.take_reconnect_metadata()),
        }
    }

    /// Closes the socket without scheduling a reconnect.
    pub fn stop(&mut self) {
        if matches!(self.socket, SocketState::Terminated) {
            return;
        }
        self.socket = SocketState::Stopped;
        self.reconnect_at = None;
        self.inactivity_deadline = None;
    }

    /// Reconnects after [`stop`](Self::stop).
    pub fn try_restart(&mut self) {
        if matches!(self.socket, SocketState::Stopped) {
            self.connect();
        } else {
            debug!("restart called without stopping first");
        }
    }

    /// Closes the socket for good.
    pub fn terminate(&mut self) {
        self.socket = SocketState::Terminated;
        self.reconnect_at = None;
        self.inactivity_deadline = None;
    }

    #[cfg(test)]
    pub fn is_terminated(&self) -> bool {
        matches!(self.socket, SocketState::Terminated)
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus {
            is_connected: matches!(self.socket, SocketState::Ready { .. }),
            has_ever_connected: self.has_ever_connected,
            connection_count: self.connection_count,
            connection_retries: self.retries,
        }
    }
}

#[cfg(test)]
#[path = "web_socket_tests.rs"]
mod tests;
