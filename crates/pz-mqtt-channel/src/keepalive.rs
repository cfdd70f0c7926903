//! Keep-alive acknowledgment tracking.
//!
//! rumqttc sends PINGREQ on its own schedule; the driver reports each
//! outgoing ping and incoming PINGRESP here. A ping left unanswered for
//! longer than the grace window means the broker is gone even if the
//! socket still looks open.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    grace: Duration,
    awaiting_since: Option<Instant>,
    last_ack: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration, grace: Duration) -> Self {
        Self {
            interval,
            grace,
            awaiting_since: None,
            last_ack: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// How often the driver should call `is_expired`.
    pub fn check_period(&self) -> Duration {
        (self.grace / 2).max(Duration::from_secs(1))
    }

    /// A PINGREQ went out. Only the oldest unanswered ping counts.
    pub fn ping_sent(&mut self, now: Instant) {
        if self.awaiting_since.is_none() {
            self.awaiting_since = Some(now);
        }
    }

    /// A PINGRESP arrived.
    pub fn ack_received(&mut self, now: Instant) {
        self.awaiting_since = None;
        self.last_ack = Some(now);
    }

    /// Forget outstanding pings (new connection).
    pub fn reset(&mut self) {
        self.awaiting_since = None;
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.awaiting_since
            .is_some_and(|sent| now.saturating_duration_since(sent) > self.grace)
    }
}
