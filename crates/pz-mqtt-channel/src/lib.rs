//! MQTT session layer for the PZEM energy gateway.
//!
//! Provides the broker-facing half of the gateway:
//! - `Channel` trait for publish/subscribe (mockable in tests)
//! - `MqttChannel` over rumqttc, plaintext or TLS
//! - `MockChannel` for testing without a broker
//! - `Session`, the connection state machine that owns the channel,
//!   replays subscriptions and retained state after every reconnect
//! - `KeepAlive` and `Backoff` helpers for the event-loop driver

pub mod backoff;
pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod keepalive;
pub mod mock;
pub mod session;
pub mod tls;

// Re-exports for convenience.
pub use backoff::Backoff;
pub use channel::{Channel, MqttChannel};
pub use config::{BrokerEndpoint, MqttConfig};
pub use error::{SessionError, SessionResult};
pub use handler::{InboundMessage, MessageHandler};
pub use keepalive::KeepAlive;
pub use mock::MockChannel;
pub use session::{Session, SessionState};
