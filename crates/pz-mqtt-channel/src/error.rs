//! Session error types.

use thiserror::Error;

/// Errors raised by the broker session.
///
/// All of these are recoverable: the event-loop driver logs them and
/// restarts the connection sequence with backoff.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("session is not authenticated")]
    NotConnected,

    #[error("publish cancelled by reconnect")]
    Cancelled,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid broker configuration: {0}")]
    Config(String),
}

/// Convenience alias for session results.
pub type SessionResult<T> = Result<T, SessionError>;
