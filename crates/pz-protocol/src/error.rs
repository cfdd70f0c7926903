use thiserror::Error;

/// Inbound data that failed validation. Never retried; the caller logs and
/// discards it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("malformed command payload: {0:?}")]
    MalformedCommand(String),

    #[error("command names channel '{payload}' but arrived on topic for '{topic}'")]
    ChannelMismatch { topic: String, payload: String },

    #[error("command does not name a channel")]
    MissingChannel,

    #[error("reading for '{channel}' has non-finite {field}")]
    InvalidReading {
        channel: String,
        field: &'static str,
    },
}
