//! Error types for the XMPP engine.

use thiserror::Error;

/// Errors raised while establishing or using a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A request rejected before any network activity.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Errors raised by the stanza codec. A parse failure never tears
/// down the session; the engine logs it and drops the frame.
#[derive(Debug, Error)]
pub enum StanzaError {
    #[error("Failed to parse stanza: {0}")]
    ParseFailed(String),
}
