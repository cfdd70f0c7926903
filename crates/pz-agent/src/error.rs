//! Agent error types.

use std::time::Duration;

use thiserror::Error;

/// Network link failures. Recovered by the link's backoff loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("network link is down")]
    LinkDown,

    #[error("network authentication failed: {0}")]
    AuthFailed(String),

    #[error("link attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("gave up after {0} link attempts")]
    RetriesExhausted(u32),
}

/// Configuration rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("broker port must be in 1..=65535")]
    InvalidPort,

    #[error("invalid value {value:?} for {var}")]
    InvalidOverride { var: &'static str, value: String },

    #[error("topic for {name} is not a valid publish topic: {topic:?}")]
    InvalidTopic { name: String, topic: String },

    #[error("channel id {0:?} is used more than once")]
    DuplicateChannel(String),

    #[error("channel id {0:?} may only contain letters, digits, '_' and '-'")]
    InvalidChannelId(String),

    #[error("keep-alive of {0}s is below the 5s minimum")]
    KeepaliveTooShort(u16),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// A sensor read that produced no usable sample.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("no meter on channel {0}")]
    UnknownChannel(String),

    #[error("meter read failed on {channel}: {reason}")]
    ReadFailed { channel: String, reason: String },
}

/// The relay driver could not reach the requested state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("actuator failed on {channel}: {reason}")]
pub struct ActuatorError {
    pub channel: String,
    pub reason: String,
}
