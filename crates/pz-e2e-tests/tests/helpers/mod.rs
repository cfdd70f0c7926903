//! Shared test harness for E2E integration tests.
//!
//! Wires the gateway components exactly as `main` does, but over a
//! `MockChannel` instead of a broker. Connection events are fed through the
//! real `SessionDriver`.

use std::sync::Arc;

use chrono::Utc;
use rumqttc::{ConnAck, ConnectReturnCode, ConnectionError, Event, Packet, Publish, QoS};

use pz_agent::config::AgentConfig;
use pz_agent::discovery::DiscoveryAnnouncer;
use pz_agent::link::LinkStatus;
use pz_agent::mqtt_loop::SessionDriver;
use pz_agent::relay::{CommandSubscriber, MemoryActuator};
use pz_agent::status;
use pz_agent::telemetry::TelemetryPublisher;
use pz_mqtt_channel::{MockChannel, Session};
use pz_protocol::SensorReading;

const CONFIG: &str = r#"
[network]
ssid = "home-ap"
password = "wifi-secret"
hostname = "pzem-esp32"

[mqtt]
broker_host = "192.168.1.10"
username = "meter"
password = "secret"
"#;

/// End-to-end harness: one session, every component registered on it.
pub struct TestHarness {
    pub config: AgentConfig,
    /// Broker stand-in shared by all components.
    pub mqtt: Arc<MockChannel>,
    pub session: Arc<Session>,
    pub actuator: Arc<MemoryActuator>,
    pub subscriber: Arc<CommandSubscriber>,
    pub publisher: TelemetryPublisher,
    pub discovery: DiscoveryAnnouncer,
}

impl TestHarness {
    /// Build and register all components while the session is still
    /// disconnected, the same order `main` uses.
    pub async fn new() -> Self {
        let config: AgentConfig = toml::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        let mqtt = Arc::new(MockChannel::new());
        let session = Arc::new(Session::new(mqtt.clone()));

        let actuator = Arc::new(MemoryActuator::new(config.relays.clone()));
        let subscriber = Arc::new(CommandSubscriber::new(
            config.topics.clone(),
            config.relays.clone(),
            actuator.clone(),
        ));
        subscriber.register(&session).await.unwrap();

        let discovery = DiscoveryAnnouncer::from_config(&config);
        discovery.announce_all(&session).await.unwrap();
        status::announce_online(&session, &config.topics)
            .await
            .unwrap();
        subscriber.report_all(&session).await.unwrap();

        let publisher = TelemetryPublisher::new(session.clone(), config.topics.clone());

        Self {
            config,
            mqtt,
            session,
            actuator,
            subscriber,
            publisher,
            discovery,
        }
    }

    /// Harness already past its first authentication, with the
    /// recorded traffic cleared.
    pub async fn connected() -> Self {
        let h = Self::new().await;
        h.connect().await;
        h.mqtt.reset();
        h
    }

    fn driver(&self) -> SessionDriver<'_> {
        SessionDriver::from_config(&self.session, &self.config.mqtt)
    }

    /// Link up, then a successful CONNACK.
    pub async fn connect(&self) {
        let mut driver = self.driver();
        driver.on_link(LinkStatus::Up);
        let ack = Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));
        assert_eq!(driver.handle_event(ack).await, None);
        assert!(self.session.is_authenticated());
    }

    /// The broker connection breaks.
    pub async fn drop_connection(&self) {
        let err = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "broker went away",
        ));
        assert!(self.driver().handle_event(Err(err)).await.is_some());
    }

    /// Deliver an inbound publish as the event loop would.
    pub async fn deliver(&self, topic: &str, payload: &str) {
        let publish = Publish::new(topic, QoS::AtLeastOnce, payload.as_bytes().to_vec());
        self.driver()
            .handle_event(Ok(Event::Incoming(Packet::Publish(publish))))
            .await;
    }

    /// Published payloads on `topic`, as strings.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.mqtt
            .published_to(topic)
            .iter()
            .map(|m| m.payload_str().to_string())
            .collect()
    }

    /// Number of discovery config messages published so far.
    pub fn discovery_publishes(&self) -> usize {
        let prefix = format!("{}/", self.config.topics.discovery_prefix);
        self.mqtt
            .published()
            .iter()
            .filter(|m| m.topic.starts_with(&prefix))
            .count()
    }
}

pub fn reading(channel: &str, voltage: f64, current: f64, power: f64) -> SensorReading {
    SensorReading {
        channel: channel.into(),
        voltage,
        current,
        power,
        energy: 0.5,
        frequency: 50.0,
        power_factor: 1.0,
        timestamp: Utc::now(),
    }
}
