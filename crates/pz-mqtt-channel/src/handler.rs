//! Inbound message routing types.
//!
//! The event-loop driver converts each rumqttc publish into an
//! `InboundMessage` and hands it to `Session::dispatch`, which calls every
//! `MessageHandler` registered under a matching filter.

use async_trait::async_trait;
use rumqttc::Publish;

use crate::session::Session;

/// An inbound MQTT publish, detached from the rumqttc packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

impl From<&Publish> for InboundMessage {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
        }
    }
}

/// Callback for messages on a subscribed filter.
///
/// Handlers receive the session so they can publish replies through it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session: &Session, message: &InboundMessage);
}
