//! Shared error types for Petrel crates.

use thiserror::Error;

/// Top-level error umbrella for embedders that want a single error
/// type across Petrel components.
#[derive(Debug, Error)]
pub enum PetrelError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("XMPP error: {0}")]
    Xmpp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PetrelError>;

/// Errors surfaced by the event bus.
#[derive(Debug, Clone, Error)]
pub enum EventBusError {
    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("Invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged and missed {0} events")]
    Lagged(u64),
}
