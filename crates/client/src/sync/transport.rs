// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The socket seam between the sync engine and a deployment.
//!
//! [`WebSocketTransport`] speaks the sync protocol over tokio-tungstenite;
//! tests install their own [`Transport`] through a [`TransportFactory`].
//! Each connection is driven by its own task ([`run_connection`]) that owns
//! the transport and talks to the client worker over channels.

use std::future::Future;
use std::pin::Pin;

use lq_core::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::debug;

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame did not parse as a protocol message.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// WebSocket close code and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Abnormal closure, as reported when no close frame was received.
    pub const ABNORMAL: u16 = 1006;
    /// No status code was present in the close frame.
    pub const NO_STATUS: u16 = 1005;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        CloseInfo {
            code,
            reason: reason.into(),
        }
    }
}

/// What a transport produced when polled.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The peer closed the connection, with its close frame if one was sent.
    Closed(Option<CloseInfo>),
}

/// One sync connection to a deployment.
///
/// `recv` must be cancel safe: the connection task polls it alongside the
/// outbound queue.
pub trait Transport: Send + Sync {
    /// Opens the socket at the `ws(s)://` sync URL.
    fn connect(
        &mut self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Sends a close frame and drops the socket.
    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Writes one protocol message as a text frame.
    fn send(
        &mut self,
        msg: ClientMessage,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Receive the next message or the close of the connection.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<TransportEvent>> + Send + '_>>;

    fn is_connected(&self) -> bool;
}

/// Creates a fresh transport for each connection attempt.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

type WebSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// The production transport. One socket per instance; a close or a failed
/// send or receive drops it.
#[derive(Default)]
pub struct WebSocketTransport {
    socket: Option<WebSocket>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> TransportFactory {
        Box::new(|| Box::new(WebSocketTransport::new()))
    }

    fn socket(&mut self) -> TransportResult<&mut WebSocket> {
        self.socket.as_mut().ok_or(TransportError::ConnectionClosed)
    }
}

/// Maps one frame to a transport event. Control and binary frames map to
/// `None`.
fn frame_event(
    frame: tokio_tungstenite::tungstenite::Message,
) -> Option<TransportResult<TransportEvent>> {
    use tokio_tungstenite::tungstenite::Message;

    match frame {
        Message::Text(text) => Some(
            ServerMessage::from_json(&text)
                .map(TransportEvent::Message)
                .map_err(|e| TransportError::SerializationError(e.to_string())),
        ),
        Message::Close(frame) => Some(Ok(TransportEvent::Closed(
            frame.map(|f| CloseInfo::new(u16::from(f.code), f.reason.as_str())),
        ))),
        _ => None,
    }
}

impl Transport for WebSocketTransport {
    fn connect(
        &mut self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        let url = url.to_string();
        Box::pin(async move {
            let (socket, response) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            debug!(status = %response.status(), "websocket upgraded");
            self.socket = Some(socket);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(mut socket) = self.socket.take() {
                // Best effort: the peer may already be gone.
                let _ = socket.close(None).await;
            }
            Ok(())
        })
    }

    fn send(
        &mut self,
        msg: ClientMessage,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            use futures_util::SinkExt;
            use tokio_tungstenite::tungstenite::Message;

            let text = msg
                .to_json()
                .map_err(|e| TransportError::SerializationError(e.to_string()))?;
            // `SinkExt::send` flushes once the frame is written.
            let sent = self.socket()?.send(Message::Text(text.into())).await;
            sent.map_err(|e| {
                self.socket = None;
                TransportError::SendFailed(e.to_string())
            })
        })
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = TransportResult<TransportEvent>> + Send + '_>> {
        Box::pin(async move {
            use futures_util::StreamExt;

            loop {
                let event = match self.socket()?.next().await {
                    Some(Ok(frame)) => match frame_event(frame) {
                        Some(event) => event,
                        None => continue,
                    },
                    Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
                    None => Ok(TransportEvent::Closed(None)),
                };
                if matches!(
                    event,
                    Ok(TransportEvent::Closed(_)) | Err(TransportError::ReceiveFailed(_))
                ) {
                    self.socket = None;
                }
                return event;
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

/// Events reported by a connection task, stamped with its connection epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened { epoch: u64 },
    Message { epoch: u64, message: ServerMessage },
    Closed { epoch: u64, close: CloseInfo },
    /// The server sent something that is not a protocol message.
    Malformed { epoch: u64, error: String },
}

/// Drives one connection until it closes or `outbound` is dropped.
///
/// Dropping the sender side of `outbound` closes the connection without
/// reporting a `Closed` event; the owner already knows.
pub async fn run_connection(
    mut transport: Box<dyn Transport>,
    url: String,
    epoch: u64,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    if let Err(e) = transport.connect(&url).await {
        debug!(epoch, error = %e, "connect failed");
        let _ = events.send(SocketEvent::Closed {
            epoch,
            close: CloseInfo::new(CloseInfo::ABNORMAL, e.to_string()),
        });
        return;
    }
    if events.send(SocketEvent::Opened { epoch }).is_err() {
        let _ = transport.disconnect().await;
        return;
    }

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(msg) => {
                    if let Err(e) = transport.send(msg).await {
                        debug!(epoch, error = %e, "send failed");
                        let _ = transport.disconnect().await;
                        let _ = events.send(SocketEvent::Closed {
                            epoch,
                            close: CloseInfo::new(CloseInfo::ABNORMAL, "FailedToSendMessage"),
                        });
                        return;
                    }
                }
                None => {
                    let _ = transport.disconnect().await;
                    return;
                }
            },
            incoming = transport.recv() => {
                let event = match incoming {
                    Ok(TransportEvent::Message(message)) => SocketEvent::Message { epoch, message },
                    Ok(TransportEvent::Closed(info)) => {
                        let close = info.unwrap_or_else(|| CloseInfo::new(CloseInfo::NO_STATUS, ""));
                        let _ = events.send(SocketEvent::Closed { epoch, close });
                        return;
                    }
                    Err(TransportError::SerializationError(error)) => {
                        let _ = transport.disconnect().await;
                        let _ = events.send(SocketEvent::Malformed { epoch, error });
                        return;
                    }
                    Err(e) => {
                        let _ = transport.disconnect().await;
                        let _ = events.send(SocketEvent::Closed {
                            epoch,
                            close: CloseInfo::new(CloseInfo::ABNORMAL, e.to_string()),
                        });
                        return;
                    }
                };
                if events.send(event).is_err() {
                    let _ = transport.disconnect().await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
