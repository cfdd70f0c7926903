//! Broker session state machine.
//!
//! ```text
//! Disconnected --link_up--> Connecting --transport_up--> Connected
//!      ^                                                     |
//!      |                                             handshake(Success)
//!      |                                                     v
//!      +---- link_down / keepalive_timeout / close ---- Authenticated
//! ```
//!
//! The session owns the channel. Everything registered through it
//! (subscriptions and retained "ensure state" entries) is replayed each
//! time the session becomes `Authenticated`, because the broker session is
//! clean and forgets both across reconnects.
//!
//! Each departure from a live state bumps the session epoch. Publishes
//! still in flight when the epoch moves fail with `SessionError::Cancelled`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rumqttc::{ConnectReturnCode, EventLoop, LastWill, QoS};
use tokio::sync::{Mutex, watch};

use pz_protocol::topics::topic_matches;

use crate::channel::{Channel, MqttChannel};
use crate::config::MqttConfig;
use crate::error::{SessionError, SessionResult};
use crate::handler::{InboundMessage, MessageHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticated => "authenticated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Subscription {
    filter: String,
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

struct RetainedEntry {
    payload: Vec<u8>,
    /// Epoch in which this payload last reached the broker.
    published_epoch: Option<u64>,
}

pub struct Session {
    channel: Arc<dyn Channel>,
    qos: QoS,
    state: watch::Sender<SessionState>,
    epoch: watch::Sender<u64>,
    subscriptions: Mutex<Vec<Subscription>>,
    retained: Mutex<BTreeMap<String, RetainedEntry>>,
    authenticated_once: AtomicBool,
    recoveries: AtomicU64,
}

impl Session {
    /// Wrap an existing channel. Publishes default to QoS 1.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (epoch, _) = watch::channel(0);
        Self {
            channel,
            qos: QoS::AtLeastOnce,
            state,
            epoch,
            subscriptions: Mutex::new(Vec::new()),
            retained: Mutex::new(BTreeMap::new()),
            authenticated_once: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
        }
    }

    /// Open a session to the configured broker.
    ///
    /// Returns the session and the rumqttc event loop, which the caller
    /// must drive and feed back through `link_up` / `transport_up` /
    /// `handshake` / `link_down` / `dispatch`.
    pub fn open(
        config: &MqttConfig,
        client_id: &str,
        last_will: Option<LastWill>,
    ) -> SessionResult<(Self, EventLoop)> {
        let endpoint = config.endpoint();
        if endpoint.host.trim().is_empty() {
            return Err(SessionError::Config("broker host is empty".into()));
        }
        if endpoint.port == 0 {
            return Err(SessionError::Config("broker port is 0".into()));
        }
        if client_id.is_empty() {
            return Err(SessionError::Config("client id is empty".into()));
        }

        let (channel, eventloop) = MqttChannel::new(config, client_id, last_will)?;
        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            client_id,
            tls = config.use_tls,
            "MQTT session opened"
        );
        Ok((Self::new(Arc::new(channel)), eventloop))
    }

    // ── State ────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Times the session has been re-authenticated after a loss.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }

    fn transition(&self, to: SessionState) -> SessionState {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::debug!(from = %from, to = %to, "session state changed");
        }
        from
    }

    /// The network link came up.
    pub fn link_up(&self) {
        if self.state() == SessionState::Disconnected {
            self.transition(SessionState::Connecting);
        }
    }

    /// The transport to the broker is established; CONNECT is on the wire.
    pub fn transport_up(&self) {
        match self.state() {
            SessionState::Disconnected | SessionState::Connecting => {
                self.transition(SessionState::Connected);
            }
            SessionState::Connected | SessionState::Authenticated => {}
        }
    }

    /// Result of the CONNECT/CONNACK exchange.
    ///
    /// On success the session becomes `Authenticated` and replays every
    /// registered subscription and retained entry. A replay failure is
    /// returned but leaves the session authenticated; the next reconnect
    /// replays again.
    pub async fn handshake(&self, code: ConnectReturnCode) -> SessionResult<()> {
        if code != ConnectReturnCode::Success {
            self.transition(SessionState::Disconnected);
            tracing::warn!(code = ?code, "broker refused connection");
            return Err(SessionError::Refused(format!("{code:?}")));
        }

        if self.transition(SessionState::Authenticated) == SessionState::Authenticated {
            return Ok(());
        }

        if self.authenticated_once.swap(true, Ordering::SeqCst) {
            let recoveries = self.recoveries.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(recoveries, "session recovered");
        } else {
            tracing::info!("session authenticated");
        }

        self.restore().await
    }

    /// The link or transport went away.
    pub fn link_down(&self, reason: &str) {
        let from = self.transition(SessionState::Disconnected);
        if from != SessionState::Disconnected {
            self.epoch.send_modify(|epoch| *epoch += 1);
            tracing::warn!(from = %from, reason, "session lost");
        }
    }

    /// No keep-alive acknowledgment inside the grace window. The owner of
    /// the event loop must drop the transport so the next poll reconnects;
    /// a DISCONNECT request would sit in the client queue and close the
    /// fresh connection instead.
    pub fn keepalive_timeout(&self) {
        self.link_down("keep-alive timeout");
    }

    /// Send DISCONNECT and leave the session. Used at shutdown, after any
    /// final publishes have been queued.
    pub async fn close(&self) -> SessionResult<()> {
        let result = self.channel.disconnect().await;
        self.link_down("session closed");
        result
    }

    async fn restore(&self) -> SessionResult<()> {
        let epoch = self.epoch();
        let mut first_error = None;

        let filters: Vec<(String, QoS)> = self
            .subscriptions
            .lock()
            .await
            .iter()
            .map(|s| (s.filter.clone(), s.qos))
            .collect();
        for (filter, qos) in &filters {
            if let Err(e) = self.channel.subscribe(filter, *qos).await {
                tracing::warn!(filter = %filter, error = %e, "failed to restore subscription");
                first_error.get_or_insert(e);
            }
        }

        let mut retained = self.retained.lock().await;
        for (topic, entry) in retained.iter_mut() {
            match self.channel.publish(topic, &entry.payload, self.qos, true).await {
                Ok(()) => entry.published_epoch = Some(epoch),
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "failed to restore retained state");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            subscriptions = filters.len(),
            retained = retained.len(),
            "session state restored"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Publish / subscribe contract ─────────────────────────

    /// Publish with the session's default QoS.
    pub async fn publish(&self, topic: &str, payload: &[u8], retained: bool) -> SessionResult<()> {
        self.publish_with_qos(topic, payload, self.qos, retained)
            .await
    }

    /// Publish while authenticated. Fails with `NotConnected` otherwise and
    /// with `Cancelled` if the session is lost before the channel accepts
    /// the message.
    pub async fn publish_with_qos(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retained: bool,
    ) -> SessionResult<()> {
        if !self.is_authenticated() {
            return Err(SessionError::NotConnected);
        }

        let mut epoch_rx = self.epoch.subscribe();
        tokio::select! {
            result = self.channel.publish(topic, payload, qos, retained) => result,
            _ = epoch_rx.changed() => Err(SessionError::Cancelled),
        }
    }

    /// Register a handler for a topic filter.
    ///
    /// Takes effect on the broker immediately when authenticated and is
    /// re-issued on every later authentication. Registering the same
    /// filter again replaces its handler.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> SessionResult<()> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            match subscriptions.iter_mut().find(|s| s.filter == filter) {
                Some(existing) => {
                    existing.qos = qos;
                    existing.handler = handler;
                }
                None => subscriptions.push(Subscription {
                    filter: filter.to_string(),
                    qos,
                    handler,
                }),
            }
        }

        if self.is_authenticated() {
            self.channel.subscribe(filter, qos).await?;
        }
        Ok(())
    }

    /// Registered subscription filters.
    pub async fn subscription_filters(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|s| s.filter.clone())
            .collect()
    }

    /// Make the broker hold `payload` as the retained message on `topic`.
    ///
    /// Idempotent: identical content already published in the current
    /// session epoch is not sent again. The entry is remembered and
    /// republished on every re-authentication. Returns whether a publish
    /// went out.
    pub async fn ensure_retained(&self, topic: &str, payload: &[u8]) -> SessionResult<bool> {
        let epoch = self.epoch();
        let authenticated = self.is_authenticated();

        let mut retained = self.retained.lock().await;
        let entry = retained
            .entry(topic.to_string())
            .or_insert_with(|| RetainedEntry {
                payload: Vec::new(),
                published_epoch: None,
            });

        if entry.payload == payload && entry.published_epoch == Some(epoch) && authenticated {
            return Ok(false);
        }
        if entry.payload != payload {
            entry.payload = payload.to_vec();
            entry.published_epoch = None;
        }
        if !authenticated {
            return Ok(false);
        }

        self.channel.publish(topic, payload, self.qos, true).await?;
        entry.published_epoch = Some(epoch);
        Ok(true)
    }

    /// Publish retained state that must go out on every call, such as a
    /// command confirmation, and remember it for replay after reconnects.
    pub async fn publish_state(&self, topic: &str, payload: &[u8]) -> SessionResult<()> {
        self.publish(topic, payload, true).await?;
        let epoch = self.epoch();
        self.retained.lock().await.insert(
            topic.to_string(),
            RetainedEntry {
                payload: payload.to_vec(),
                published_epoch: Some(epoch),
            },
        );
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────

    /// Route an inbound message to every handler whose filter matches.
    ///
    /// Messages arriving while not authenticated are dropped. Returns the
    /// number of handlers invoked.
    pub async fn dispatch(&self, message: &InboundMessage) -> usize {
        if !self.is_authenticated() {
            tracing::debug!(topic = %message.topic, "dropping message outside authenticated session");
            return 0;
        }

        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|s| topic_matches(&s.filter, &message.topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        if handlers.is_empty() {
            tracing::debug!(topic = %message.topic, "ignoring message with no handler");
        }
        for handler in &handlers {
            handler.handle(self, message).await;
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<InboundMessage>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, _session: &Session, message: &InboundMessage) {
            self.seen.lock().unwrap().push(message.clone());
        }
    }

    /// Channel whose publishes never complete.
    struct StalledChannel;

    #[async_trait]
    impl Channel for StalledChannel {
        async fn publish(&self, _: &str, _: &[u8], _: QoS, _: bool) -> SessionResult<()> {
            std::future::pending().await
        }

        async fn subscribe(&self, _: &str, _: QoS) -> SessionResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> SessionResult<()> {
            Ok(())
        }
    }

    fn session() -> (Arc<MockChannel>, Session) {
        let mock = Arc::new(MockChannel::new());
        let session = Session::new(mock.clone());
        (mock, session)
    }

    async fn authenticate(session: &Session) {
        session.link_up();
        session.transport_up();
        session.handshake(ConnectReturnCode::Success).await.unwrap();
    }

    #[tokio::test]
    async fn walks_state_machine() {
        let (_mock, session) = session();
        let mut rx = session.watch_state();
        assert_eq!(session.state(), SessionState::Disconnected);

        session.link_up();
        assert_eq!(session.state(), SessionState::Connecting);
        session.transport_up();
        assert_eq!(session.state(), SessionState::Connected);
        session.handshake(ConnectReturnCode::Success).await.unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SessionState::Authenticated);

        session.link_down("test");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.epoch(), 1);
    }

    #[tokio::test]
    async fn refused_handshake_returns_to_disconnected() {
        let (_mock, session) = session();
        session.link_up();
        session.transport_up();
        let err = session
            .handshake(ConnectReturnCode::BadUserNamePassword)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Refused(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn publish_requires_authentication() {
        let (mock, session) = session();
        let err = session.publish("t", b"x", false).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(mock.published().is_empty());

        authenticate(&session).await;
        session.publish("t", b"x", false).await.unwrap();
        assert_eq!(mock.published_to("t").len(), 1);
    }

    #[tokio::test]
    async fn subscriptions_are_replayed_after_reconnect() {
        let (mock, session) = session();
        let handler = Arc::new(Recorder::default());
        session
            .subscribe("home/relay/+/set", QoS::AtLeastOnce, handler.clone())
            .await
            .unwrap();
        // Registered while disconnected: nothing reaches the broker yet.
        assert!(mock.subscriptions().is_empty());

        authenticate(&session).await;
        assert_eq!(mock.subscription_count("home/relay/+/set"), 1);

        session.link_down("drop");
        authenticate(&session).await;
        assert_eq!(mock.subscription_count("home/relay/+/set"), 2);
        assert_eq!(session.recoveries(), 1);
    }

    #[tokio::test]
    async fn resubscribing_same_filter_replaces_handler() {
        let (_mock, session) = session();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        session.subscribe("a/#", QoS::AtLeastOnce, first.clone()).await.unwrap();
        session.subscribe("a/#", QoS::AtLeastOnce, second.clone()).await.unwrap();
        assert_eq!(session.subscription_filters().await, vec!["a/#".to_string()]);

        authenticate(&session).await;
        session.dispatch(&InboundMessage::new("a/b", b"x".to_vec())).await;
        assert!(first.seen.lock().unwrap().is_empty());
        assert_eq!(second.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_retained_is_idempotent_within_epoch() {
        let (mock, session) = session();
        authenticate(&session).await;

        assert!(session.ensure_retained("cfg/a", b"one").await.unwrap());
        assert!(!session.ensure_retained("cfg/a", b"one").await.unwrap());
        assert!(!session.ensure_retained("cfg/a", b"one").await.unwrap());
        assert_eq!(mock.published_to("cfg/a").len(), 1);

        assert!(session.ensure_retained("cfg/a", b"two").await.unwrap());
        assert_eq!(mock.retained("cfg/a"), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn ensure_retained_while_disconnected_publishes_on_authentication() {
        let (mock, session) = session();
        assert!(!session.ensure_retained("cfg/a", b"one").await.unwrap());
        assert!(mock.published().is_empty());

        authenticate(&session).await;
        assert_eq!(mock.published_to("cfg/a").len(), 1);
        // Already published in this epoch by the replay.
        assert!(!session.ensure_retained("cfg/a", b"one").await.unwrap());
    }

    #[tokio::test]
    async fn retained_state_replayed_once_per_recovery() {
        let (mock, session) = session();
        authenticate(&session).await;
        session.ensure_retained("cfg/a", b"one").await.unwrap();
        session.ensure_retained("cfg/b", b"two").await.unwrap();
        mock.reset();

        session.link_down("drop");
        authenticate(&session).await;

        assert_eq!(mock.published_to("cfg/a").len(), 1);
        assert_eq!(mock.published_to("cfg/b").len(), 1);
        assert!(mock.published().iter().all(|m| m.retain));
    }

    #[tokio::test]
    async fn publish_state_always_publishes_and_is_replayed() {
        let (mock, session) = session();
        authenticate(&session).await;

        session.publish_state("relay/state", b"ON").await.unwrap();
        session.publish_state("relay/state", b"ON").await.unwrap();
        assert_eq!(mock.published_to("relay/state").len(), 2);

        // The replay carries the latest state; ensure_retained sees it as current.
        assert!(!session.ensure_retained("relay/state", b"ON").await.unwrap());
        mock.reset();
        session.link_down("drop");
        authenticate(&session).await;
        let replayed = mock.published_to("relay/state");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload_str(), "ON");
    }

    #[tokio::test]
    async fn publish_state_fails_when_disconnected() {
        let (mock, session) = session();
        let err = session.publish_state("relay/state", b"ON").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(mock.published().is_empty());
    }

    #[tokio::test]
    async fn duplicate_connack_does_not_replay() {
        let (mock, session) = session();
        session.ensure_retained("cfg/a", b"one").await.unwrap();
        authenticate(&session).await;
        session.handshake(ConnectReturnCode::Success).await.unwrap();
        assert_eq!(mock.published_to("cfg/a").len(), 1);
    }

    #[tokio::test]
    async fn replay_failure_is_reported_but_session_stays_up() {
        let (mock, session) = session();
        session
            .subscribe("x/#", QoS::AtLeastOnce, Arc::new(Recorder::default()))
            .await
            .unwrap();
        mock.fail_next_subscribes(1);

        session.link_up();
        session.transport_up();
        let err = session
            .handshake(ConnectReturnCode::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Subscribe(_)));
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn dispatch_routes_by_filter() {
        let (_mock, session) = session();
        let relays = Arc::new(Recorder::default());
        let other = Arc::new(Recorder::default());
        session
            .subscribe("home/relay/+/set", QoS::AtLeastOnce, relays.clone())
            .await
            .unwrap();
        session
            .subscribe("home/other", QoS::AtLeastOnce, other.clone())
            .await
            .unwrap();
        authenticate(&session).await;

        let n = session
            .dispatch(&InboundMessage::new("home/relay/relay1/set", b"ON".to_vec()))
            .await;
        assert_eq!(n, 1);
        assert_eq!(relays.seen.lock().unwrap().len(), 1);
        assert!(other.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_drops_messages_when_not_authenticated() {
        let (_mock, session) = session();
        let handler = Arc::new(Recorder::default());
        session
            .subscribe("#", QoS::AtLeastOnce, handler.clone())
            .await
            .unwrap();

        let n = session
            .dispatch(&InboundMessage::new("home/relay/relay1/set", b"ON".to_vec()))
            .await;
        assert_eq!(n, 0);
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_cancels_inflight_publish() {
        let session = Arc::new(Session::new(Arc::new(StalledChannel)));
        authenticate(&session).await;

        let publisher = Arc::clone(&session);
        let inflight =
            tokio::spawn(async move { publisher.publish("t", b"x", false).await });
        // Let the spawned publish reach the stalled channel.
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        session.link_down("drop");
        let result = inflight.await.unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn keepalive_timeout_drops_session_without_queueing_disconnect() {
        let (mock, session) = session();
        authenticate(&session).await;
        session.keepalive_timeout();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.epoch(), 1);
        assert_eq!(mock.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn close_sends_disconnect() {
        let (mock, session) = session();
        authenticate(&session).await;
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(mock.disconnect_count(), 1);
    }

    #[test]
    fn open_rejects_empty_host() {
        let config: MqttConfig = toml::from_str(r#"broker_host = "  ""#).unwrap();
        let err = Session::open(&config, "gw", None).err().expect("should fail");
        assert!(matches!(err, SessionError::Config(_)));
    }
}
