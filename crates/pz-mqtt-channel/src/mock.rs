//! Mock MQTT channel for testing without a real broker.
//!
//! Records all published messages, subscription filters and the retained
//! state a broker would hold, for assertion in tests. Publishes and
//! subscribes can be made to fail on demand.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rumqttc::QoS;

use crate::channel::Channel;
use crate::error::{SessionError, SessionResult};

/// A recorded publish call.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

/// Mock implementation of the `Channel` trait.
///
/// Thread-safe via `Mutex` (fine for test contexts).
pub struct MockChannel {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    retained: Mutex<BTreeMap<String, Vec<u8>>>,
    disconnects: AtomicUsize,
    failing_publishes: AtomicUsize,
    failing_subscribes: AtomicUsize,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            retained: Mutex::new(BTreeMap::new()),
            disconnects: AtomicUsize::new(0),
            failing_publishes: AtomicUsize::new(0),
            failing_subscribes: AtomicUsize::new(0),
        }
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Get all subscription filters, in issue order.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Get the last published message.
    pub fn last_published(&self) -> Option<PublishedMessage> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).last().cloned()
    }

    /// Get published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Retained payload the broker would hold for a topic.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.retained.lock().unwrap_or_else(|e| e.into_inner()).get(topic).cloned()
    }

    /// Snapshot of every retained topic and payload.
    pub fn retained_state(&self) -> BTreeMap<String, Vec<u8>> {
        self.retained.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Check whether a subscription was made to the given filter.
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        self.subscription_count(filter) > 0
    }

    /// How many times the filter was subscribed.
    pub fn subscription_count(&self, filter: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(f, _)| f == filter)
            .count()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` subscribes fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Clear recorded publishes and subscriptions. Retained state survives,
    /// as it would on a real broker.
    pub fn reset(&self) {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> SessionResult<()> {
        if take_failure(&self.failing_publishes) {
            return Err(SessionError::Publish("injected publish failure".into()));
        }
        if retain {
            let mut retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
            if payload.is_empty() {
                retained.remove(topic);
            } else {
                retained.insert(topic.to_string(), payload.to_vec());
            }
        }
        self.published.lock().unwrap_or_else(|e| e.into_inner()).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> SessionResult<()> {
        if take_failure(&self.failing_subscribes) {
            return Err(SessionError::Subscribe("injected subscribe failure".into()));
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((filter.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self) -> SessionResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
