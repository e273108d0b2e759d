//! WebSocket transport carrying RFC 7395 framed XMPP.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::trace;

use crate::error::ConnectionError;
use crate::negotiate;

const MIN_TIMEOUT_SECONDS: u64 = 1;

/// Everything a transport needs to reach the server and stand up a
/// session on the raw connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub full_jid: String,
    pub password: String,
    pub host: String,
    pub websocket_url: String,
    pub timeout_seconds: u64,
}

/// Framed XMPP transport. `connect` yields a session that is already
/// authenticated and resource-bound; `send` and `recv` move whole
/// frames, one stanza each.
pub trait XmppTransport: Send + 'static {
    fn connect(config: &ConnectionConfig) -> impl Future<Output = Result<Self, ConnectionError>>
    where
        Self: Sized;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>>;

    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>>;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>>;
}

pub struct WebSocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    io_timeout: Duration,
}

pub(crate) fn connect_timeout(config: &ConnectionConfig) -> Duration {
    Duration::from_secs(config.timeout_seconds.max(MIN_TIMEOUT_SECONDS))
}

fn map_websocket_error(error: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns")
        || lower.contains("resolve")
        || lower.contains("unable to connect")
        || lower.contains("failed to lookup")
    {
        ConnectionError::DnsResolutionFailed(message)
    } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake")
    {
        ConnectionError::TlsHandshakeFailed(message)
    } else {
        ConnectionError::TransportError(message)
    }
}

impl XmppTransport for WebSocketTransport {
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let io_timeout = connect_timeout(config);
        let mut request = config
            .websocket_url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::TransportError(format!("invalid endpoint URL: {e}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));

        let (socket, response) = timeout(io_timeout, connect_async(request))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_websocket_error)?;
        trace!(status = %response.status(), "WebSocket handshake complete");

        let mut transport = Self { socket, io_timeout };
        negotiate::establish(&mut transport, config).await?;
        Ok(transport)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }

        let text = std::str::from_utf8(data).map_err(|error| {
            ConnectionError::TransportError(format!(
                "RFC 7395 requires UTF-8 text frames; invalid payload: {error}"
            ))
        })?;
        let message = Message::Text(text.to_string().into());
        timeout(self.io_timeout, self.socket.send(message))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_websocket_error)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        // No timeout here: a quiet stream between stanzas is healthy.
        loop {
            let message = match self.socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => return Err(map_websocket_error(error)),
                None => {
                    return Err(ConnectionError::TransportError(
                        "websocket stream ended".to_string(),
                    ));
                }
            };

            match message {
                Message::Text(text) => return Ok(text.to_string().into_bytes()),
                Message::Binary(bytes) => return Ok(bytes.to_vec()),
                Message::Close(_) => {
                    return Err(ConnectionError::TransportError(
                        "websocket closed by peer".to_string(),
                    ));
                }
                // Control frames are not stanzas.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("Skipping websocket control frame");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        timeout(self.io_timeout, self.socket.close(None))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_websocket_error)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tokio_tungstenite::tungstenite::Error;

    use super::*;

    #[test]
    fn classifies_generic_errors_as_transport() {
        let err = map_websocket_error(Error::ConnectionClosed);
        assert!(matches!(err, ConnectionError::TransportError(_)));
    }

    #[test]
    fn classifies_dns_failures() {
        let err = map_websocket_error(Error::Io(io::Error::other(
            "failed to lookup address information: Name or service not known",
        )));
        assert!(matches!(err, ConnectionError::DnsResolutionFailed(_)));
    }

    #[test]
    fn classifies_tls_failures() {
        let err = map_websocket_error(Error::Io(io::Error::other(
            "invalid peer certificate: UnknownIssuer",
        )));
        assert!(matches!(err, ConnectionError::TlsHandshakeFailed(_)));
    }

    #[test]
    fn connect_timeout_has_a_floor() {
        let config = ConnectionConfig {
            full_jid: "alice@example.com/node_0.1_Ab12Cd34".to_string(),
            password: "secret".to_string(),
            host: "example.com".to_string(),
            websocket_url: "wss://example.com:443/websocket".to_string(),
            timeout_seconds: 0,
        };
        assert_eq!(connect_timeout(&config), Duration::from_secs(1));
    }
}
