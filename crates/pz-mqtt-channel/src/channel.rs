//! MQTT channel: the raw publish/subscribe transport under a `Session`.
//!
//! Wraps `rumqttc::AsyncClient`. Nothing outside the session layer talks
//! to a channel directly.

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};

use crate::config::MqttConfig;
use crate::error::{SessionError, SessionResult};
use crate::tls;

/// Request queue depth between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

// ── Channel trait ─────────────────────────────────────────────

/// Abstraction for MQTT message publishing and subscribing.
///
/// Enables mocking in tests without a real MQTT broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool)
    -> SessionResult<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> SessionResult<()>;

    /// Drop the broker connection; the event loop reconnects on its next poll.
    async fn disconnect(&self) -> SessionResult<()>;
}

// ── MqttChannel ───────────────────────────────────────────────

/// MQTT channel backed by rumqttc.
///
/// The `EventLoop` is returned separately from `new()`; the agent drives
/// it and feeds its events into the owning `Session`.
pub struct MqttChannel {
    client: AsyncClient,
}

impl MqttChannel {
    /// Build the client from config. TLS is used when `use_tls` is set.
    ///
    /// The session is always clean: subscriptions are replayed by the
    /// `Session` after each connect instead of relying on the broker.
    pub fn new(
        config: &MqttConfig,
        client_id: &str,
        last_will: Option<LastWill>,
    ) -> SessionResult<(Self, EventLoop)> {
        let endpoint = config.endpoint();
        let mut options = MqttOptions::new(client_id, endpoint.host.as_str(), endpoint.port);
        options.set_keep_alive(config.keepalive());
        options.set_clean_session(true);

        if endpoint.has_credentials() {
            options.set_credentials(endpoint.username, endpoint.password);
        }
        if let Some(will) = last_will {
            options.set_last_will(will);
        }
        if config.use_tls {
            options.set_transport(tls::load_tls_transport(config)?);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok((Self { client }, eventloop))
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> SessionResult<()> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| SessionError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> SessionResult<()> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| SessionError::Subscribe(e.to_string()))
    }

    async fn disconnect(&self) -> SessionResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))
    }
}
