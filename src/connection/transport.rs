//! Duplex-transport abstraction and the default WebSocket implementation.
//!
//! The gateway consumes transports through the [`Transport`] /
//! [`TransportFactory`] traits so tests (and embedders with unusual
//! networking needs) can substitute their own duplex connection. The
//! default implementation wraps `tokio-tungstenite`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ExecLinkError, Result};
use crate::timeouts::ExecLinkTimeouts;

/// WebSocket close code for a graceful shutdown. Any other close code is
/// treated as an unexpected connection loss and triggers reconnection.
pub const GRACEFUL_CLOSE_CODE: u16 = 1000;

/// One event observed on the duplex connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete inbound text frame.
    Text(String),

    /// Heartbeat response. Proves liveness; its absence is not failure.
    Pong,

    /// The peer closed the connection.
    Closed {
        /// Close code reported by the peer, if any.
        code: Option<u16>,
        /// Close reason reported by the peer.
        reason: String,
    },
}

/// One established duplex connection.
#[async_trait]
pub trait Transport: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send a transport-level heartbeat.
    async fn send_ping(&mut self) -> Result<()>;

    /// Wait for the next event. Returns `None` once the stream has ended
    /// and `Some(Err(_))` on transport failure.
    async fn next_event(&mut self) -> Option<Result<TransportEvent>>;

    /// Close the connection, sending `code` to the peer when given.
    async fn close(&mut self, code: Option<u16>) -> Result<()>;
}

/// Produces a fresh [`Transport`] for every (re-)connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Default WebSocket transport backed by `tokio-tungstenite`.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ExecLinkError::WebSocketError(format!("Failed to send frame: {}", e)))
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.inner
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(|e| ExecLinkError::WebSocketError(format!("Failed to send ping: {}", e)))
    }

    async fn next_event(&mut self) -> Option<Result<TransportEvent>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Ok(TransportEvent::Text(text.to_string())));
                }
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(TransportEvent::Text(text))),
                    Err(_) => {
                        log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len());
                    }
                },
                Ok(Message::Ping(payload)) => {
                    // Answer pings inline so the caller never sees them.
                    if let Err(e) = self.inner.send(Message::Pong(payload)).await {
                        return Some(Err(ExecLinkError::WebSocketError(format!(
                            "Failed to answer ping: {}",
                            e
                        ))));
                    }
                }
                Ok(Message::Pong(_)) => return Some(Ok(TransportEvent::Pong)),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(TransportEvent::Closed { code, reason }));
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    return Some(Err(ExecLinkError::WebSocketError(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self, code: Option<u16>) -> Result<()> {
        let frame = code.map(|c| CloseFrame {
            code: CloseCode::from(c),
            reason: "".into(),
        });
        self.inner
            .close(frame)
            .await
            .map_err(|e| ExecLinkError::WebSocketError(format!("Failed to close: {}", e)))
    }
}

/// Connects [`WsTransport`] instances to a fixed `ws://` or `wss://` URL.
pub struct WsTransportFactory {
    url: String,
    connection_timeout: Duration,
}

impl WsTransportFactory {
    /// Create a factory for the given endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns [`ExecLinkError::ConfigurationError`] unless the URL uses
    /// the `ws` or `wss` scheme.
    pub fn new(url: impl Into<String>, connection_timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ExecLinkError::ConfigurationError(format!(
                "Endpoint URL must use the ws or wss scheme, got '{}'",
                url
            )));
        }
        Ok(Self {
            url,
            connection_timeout,
        })
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        log::debug!("Establishing WebSocket connection to {}", self.url);

        let connect_result = if !ExecLinkTimeouts::is_no_timeout(self.connection_timeout) {
            tokio::time::timeout(self.connection_timeout, connect_async(self.url.as_str())).await
        } else {
            Ok(connect_async(self.url.as_str()).await)
        };

        match connect_result {
            Ok(Ok((stream, _response))) => {
                log::info!("WebSocket connection to {} established", self.url);
                Ok(Box::new(WsTransport { inner: stream }) as Box<dyn Transport>)
            }
            Ok(Err(e)) => Err(ExecLinkError::WebSocketError(format!(
                "Connection failed: {}",
                e
            ))),
            Err(_) => Err(ExecLinkError::TimeoutError(format!(
                "Connection timeout ({:?})",
                self.connection_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_http_url() {
        let result = WsTransportFactory::new("http://localhost:8080", Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(ExecLinkError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_factory_accepts_ws_and_wss() {
        assert!(WsTransportFactory::new("ws://localhost:8080/connect", Duration::ZERO).is_ok());
        assert!(WsTransportFactory::new("wss://host/connect", Duration::ZERO).is_ok());
    }
}
