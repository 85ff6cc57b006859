use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, protocol::CloseFrame},
};
use tracing::{debug, info, warn};

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket subscription to a queue server
///
/// ## Architecture
///
/// A `WsSubscription` owns exactly one websocket stream. There is no background task:
/// frames are only read when `receive()` is awaited, so the caller fully controls the
/// pace of consumption and the order in which messages are handed on.
///
/// ## Message Flow
///
/// When consuming messages:
/// 1. Call `receive()` to wait for the next frame
/// 2. `Ok(Some(text))` carries a text payload (possibly empty)
/// 3. `Ok(None)` means a control frame (ping, pong) or a payload that is not text
/// 4. `Err(WsQueueError::Closed(_))` means the server ended the subscription
///
/// ## Cleanup
///
/// IMPORTANT: The `close()` method SHOULD be called to end the subscription. It sends a
/// close frame and flushes it, so the server sees a clean disconnect instead of a reset.
pub struct WsSubscription {
    url: String,
    stream: SocketStream,
    closed: bool,
}

impl WsSubscription {
    /// Opens a websocket subscription
    ///
    /// # Arguments
    /// * `url` - Websocket URL of the queue server (e.g., "ws://localhost:8080/ws")
    /// * `handshake_timeout` - Upper bound for TCP connect plus websocket handshake
    ///
    /// # Errors
    /// Returns `WsQueueError::UriError` if the URL is not a valid websocket URL,
    /// `WsQueueError::HandshakeTimeout` if the server does not answer in time and
    /// `WsQueueError::ConnectionError` for any other connect or handshake failure
    pub async fn open(url: &str, handshake_timeout: Duration) -> Result<Self, WsQueueError> {
        info!("Opening websocket subscription to: {}", url);

        let connected = tokio::time::timeout(handshake_timeout, connect_async(url))
            .await
            .map_err(|_| WsQueueError::HandshakeTimeout(handshake_timeout))?;

        let (stream, response) = match connected {
            Ok(conn) => conn,
            Err(tungstenite::Error::Url(err)) => {
                warn!("Invalid websocket url {}: {}", url, err);
                return Err(WsQueueError::UriError(err.to_string()));
            }
            Err(err) => {
                warn!("Failed to connect to {}: {}", url, err);
                return Err(WsQueueError::ConnectionError(err.to_string()));
            }
        };

        info!(
            "Websocket subscription established (status {})",
            response.status()
        );

        Ok(Self {
            url: url.to_owned(),
            stream,
            closed: false,
        })
    }

    /// Returns the URL this subscription was opened against
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Receives the next frame from the subscription
    ///
    /// Binary frames are accepted when they hold valid UTF-8, since the queue server
    /// only deals in text payloads. Anything else is reported as `Ok(None)`.
    ///
    /// # Errors
    /// Returns `WsQueueError::Closed` once the server closed the stream (or it ended)
    /// and `WsQueueError::ReceiveError` when the underlying transport fails
    pub async fn receive(&mut self) -> Result<Option<String>, WsQueueError> {
        if self.closed {
            return Err(WsQueueError::Closed("subscription already closed".to_owned()));
        }

        let frame = match self.stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                self.closed = true;
                return Err(match err {
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                        WsQueueError::Closed(err.to_string())
                    }
                    other => WsQueueError::ReceiveError(other.to_string()),
                });
            }
            None => {
                self.closed = true;
                return Err(WsQueueError::Closed("stream ended".to_owned()));
            }
        };

        match frame {
            Message::Text(text) => Ok(Some(text)),
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Ok(Some(text)),
                Err(err) => {
                    warn!(
                        "Skipping binary frame of {} bytes from {}: {}",
                        err.as_bytes().len(),
                        self.url,
                        err.utf8_error()
                    );
                    Ok(None)
                }
            },
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                debug!("control frame received");
                Ok(None)
            }
            Message::Close(frame) => {
                self.closed = true;
                Err(WsQueueError::Closed(describe_close(frame)))
            }
        }
    }

    /// Closes the subscription
    ///
    /// Sends a close frame and flushes it. Closing an already closed subscription
    /// is a no-op.
    ///
    /// # Errors
    /// Returns `WsQueueError::CloseError` if the close frame could not be delivered
    pub async fn close(&mut self) -> Result<(), WsQueueError> {
        if self.closed {
            debug!("subscription to {} already closed", self.url);
            return Ok(());
        }
        self.closed = true;

        match self.stream.close(None).await {
            Ok(()) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {}
            Err(err) => return Err(WsQueueError::CloseError(err.to_string())),
        }

        info!("Websocket subscription to {} closed", self.url);
        Ok(())
    }
}

fn describe_close(frame: Option<CloseFrame<'_>>) -> String {
    match frame {
        Some(frame) if frame.reason.is_empty() => {
            format!("closed by server (code {})", u16::from(frame.code))
        }
        Some(frame) => format!(
            "closed by server (code {}): {}",
            u16::from(frame.code),
            frame.reason
        ),
        None => "closed by server".to_owned(),
    }
}

/// Error types for websocket subscription operations
#[derive(Debug, thiserror::Error)]
pub enum WsQueueError {
    /// Error in the provided URI
    #[error("Provided URI Error: {0}")]
    UriError(String),
    /// Error establishing connection or completing the handshake
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// Handshake did not complete in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// Transport failure while waiting for a frame
    #[error("Error while receiving a frame: {0}")]
    ReceiveError(String),
    /// The subscription was closed
    #[error("Subscription closed: {0}")]
    Closed(String),
    /// Error while sending the close frame
    #[error("Error while closing the subscription: {0}")]
    CloseError(String),
}
