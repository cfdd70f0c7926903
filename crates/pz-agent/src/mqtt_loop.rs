//! MQTT event loop driver.
//!
//! Polls the rumqttc event loop and translates what it sees into session
//! transitions: CONNACK drives the handshake, connection errors take the
//! session down and back off, pings feed the keep-alive tracker and
//! inbound publishes are dispatched to subscribed handlers.
//!
//! Whenever the driver gives up on a connection (link loss, unanswered
//! ping, stalled handshake) it flags the transport for reset and `run`
//! drops the rumqttc socket, so the next poll dials a fresh connection.

use std::time::Duration;

use rumqttc::{ConnectionError, Event, EventLoop, Outgoing, Packet};
use tokio::sync::watch;
use tokio::time::{self, Instant};

use pz_mqtt_channel::{
    Backoff, InboundMessage, KeepAlive, MqttConfig, Session, SessionError, SessionState,
};

use crate::link::LinkStatus;

pub struct SessionDriver<'a> {
    session: &'a Session,
    keepalive: KeepAlive,
    backoff: Backoff,
    handshake_since: Option<Instant>,
    reset_transport: bool,
}

impl<'a> SessionDriver<'a> {
    pub fn new(session: &'a Session, keepalive: KeepAlive, backoff: Backoff) -> Self {
        Self {
            session,
            keepalive,
            backoff,
            handshake_since: None,
            reset_transport: false,
        }
    }

    pub fn from_config(session: &'a Session, config: &MqttConfig) -> Self {
        Self::new(
            session,
            KeepAlive::new(config.keepalive(), config.keepalive_grace()),
            Backoff::new(config.reconnect_initial(), config.reconnect_max()),
        )
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn keepalive_check_period(&self) -> Duration {
        self.keepalive.check_period()
    }

    /// Whether the current transport must be dropped before the next poll.
    /// Clears the flag.
    pub fn take_transport_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_transport)
    }

    /// Apply one poll result. Returns how long to wait before polling
    /// again, if the connection failed.
    pub async fn handle_event(&mut self, event: Result<Event, ConnectionError>) -> Option<Duration> {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                self.handshake_since = None;
                self.session.transport_up();
                self.keepalive.reset();
                match self.session.handshake(ack.code).await {
                    Ok(()) => {
                        self.backoff.reset();
                        None
                    }
                    Err(SessionError::Refused(reason)) => {
                        self.reset_transport = true;
                        let delay = self.backoff.next_delay();
                        tracing::warn!(reason = %reason, retry_in_ms = delay.as_millis() as u64, "handshake refused");
                        Some(delay)
                    }
                    Err(e) => {
                        // Authenticated; the next reconnect replays again.
                        tracing::warn!(error = %e, "session restore incomplete");
                        self.backoff.reset();
                        None
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::from(&publish);
                self.session.dispatch(&message).await;
                None
            }
            Ok(Event::Incoming(Packet::PingResp)) => {
                self.keepalive.ack_received(Instant::now());
                None
            }
            Ok(Event::Outgoing(Outgoing::PingReq)) => {
                self.keepalive.ping_sent(Instant::now());
                None
            }
            Ok(_) => None,
            Err(ConnectionError::ConnectionRefused(code)) => {
                self.handshake_since = None;
                self.session.transport_up();
                if let Err(e) = self.session.handshake(code).await {
                    tracing::debug!(error = %e, "connection refused by broker");
                }
                let delay = self.backoff.next_delay();
                tracing::warn!(code = ?code, retry_in_ms = delay.as_millis() as u64, "broker refused connection");
                Some(delay)
            }
            Err(e) => {
                // rumqttc has already dropped the socket.
                self.handshake_since = None;
                self.session.link_down(&e.to_string());
                self.keepalive.reset();
                let delay = self.backoff.next_delay();
                tracing::error!(
                    error = %e,
                    attempt = self.backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "MQTT connection error, reconnecting"
                );
                Some(delay)
            }
        }
    }

    /// Tear the session down if a ping has gone unanswered past the grace
    /// window, or if a handshake has been pending longer than that.
    /// Returns whether it did.
    pub async fn check_keepalive(&mut self, now: Instant) -> bool {
        match self.session.state() {
            SessionState::Authenticated => {
                self.handshake_since = None;
                if !self.keepalive.is_expired(now) {
                    return false;
                }
                tracing::warn!(
                    interval_secs = self.keepalive.interval().as_secs(),
                    "keep-alive unanswered, forcing reconnect"
                );
                self.session.keepalive_timeout();
            }
            SessionState::Connecting | SessionState::Connected => {
                let since = *self.handshake_since.get_or_insert(now);
                if now.saturating_duration_since(since) <= self.keepalive.grace() {
                    return false;
                }
                tracing::warn!(
                    grace_secs = self.keepalive.grace().as_secs(),
                    "handshake stalled, forcing reconnect"
                );
                self.session.link_down("handshake timeout");
            }
            SessionState::Disconnected => {
                self.handshake_since = None;
                return false;
            }
        }
        self.handshake_since = None;
        self.keepalive.reset();
        self.reset_transport = true;
        true
    }

    /// Follow a network link transition.
    pub fn on_link(&mut self, status: LinkStatus) {
        match status {
            LinkStatus::Up => self.session.link_up(),
            LinkStatus::Down => {
                if self.session.state() != SessionState::Disconnected {
                    self.reset_transport = true;
                }
                self.session.link_down("network link down");
                self.handshake_since = None;
                self.keepalive.reset();
            }
        }
    }
}

/// Drive the MQTT event loop.
///
/// Polls only while the network link is up. Runs forever until the task
/// is cancelled or the link watch closes.
pub async fn run(
    eventloop: &mut EventLoop,
    driver: &mut SessionDriver<'_>,
    mut link_rx: watch::Receiver<LinkStatus>,
) {
    let mut keepalive_check = time::interval(driver.keepalive_check_period());
    keepalive_check.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        let link = *link_rx.borrow_and_update();
        driver.on_link(link);
        if driver.take_transport_reset() {
            // Unacked publishes move to the pending queue and are resent.
            eventloop.clean();
            tracing::debug!("MQTT transport dropped");
        }

        if link == LinkStatus::Down {
            if link_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        tokio::select! {
            event = eventloop.poll() => {
                if let Some(delay) = driver.handle_event(event).await {
                    time::sleep(delay).await;
                }
            }
            _ = keepalive_check.tick() => {
                driver.check_keepalive(Instant::now()).await;
            }
            changed = link_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Poll until DISCONNECT has been written or `limit` elapses. Requests
/// are written in queue order, so anything queued before the
/// disconnect has left the client by then. Used at shutdown.
pub async fn flush_outgoing(eventloop: &mut EventLoop, limit: Duration) -> bool {
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "event loop closed during flush");
                    return false;
                }
            }
        }
    };
    time::timeout(limit, drain).await.unwrap_or(false)
}
