//! E2E tests for meter readings flowing to the telemetry topics.

mod helpers;

use helpers::{TestHarness, reading};
use pz_agent::telemetry::{PublishOutcome, SimulatedSource, sample_all};
use pz_protocol::TelemetryPayload;
use rumqttc::QoS;
use std::time::Duration;

/// A pzem1 reading while authenticated yields exactly one publish to the
/// pzem1 topic carrying that reading.
#[tokio::test]
async fn e2e_reading_published_to_channel_topic() {
    let h = TestHarness::connected().await;

    let outcome = h
        .publisher
        .on_reading(reading("pzem1", 230.0, 1.0, 230.0))
        .await;
    assert_eq!(outcome, PublishOutcome::Published);

    let sent = h.mqtt.published_to("home/energy/pzem1");
    assert_eq!(sent.len(), 1);
    assert_eq!(h.mqtt.published().len(), 1);
    assert_eq!(sent[0].qos, QoS::AtMostOnce);
    assert!(!sent[0].retain);

    let payload: TelemetryPayload = serde_json::from_slice(&sent[0].payload).unwrap();
    assert_eq!(payload.voltage, 230.0);
    assert_eq!(payload.current, 1.0);
    assert_eq!(payload.power, 230.0);
    assert_eq!(payload.pf, 1.0);
}

/// Readings while disconnected never error and only bump the drop counter.
#[tokio::test]
async fn e2e_disconnected_readings_dropped() {
    let h = TestHarness::connected().await;
    h.drop_connection().await;

    for channel in ["pzem1", "pzem2", "pzem3"] {
        let outcome = h
            .publisher
            .on_reading(reading(channel, 231.0, 2.0, 400.0))
            .await;
        assert_eq!(outcome, PublishOutcome::Dropped);
    }

    assert!(h.mqtt.published().is_empty());
    let stats = h.publisher.stats().await;
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.published, 0);
}

/// During the handshake only the newest snapshot per channel survives,
/// and it goes out once authenticated.
#[tokio::test]
async fn e2e_handshake_window_publishes_latest_only() {
    let h = TestHarness::connected().await;
    h.drop_connection().await;

    h.session.link_up();
    h.publisher
        .on_reading(reading("pzem3", 230.0, 1.0, 100.0))
        .await;
    h.publisher
        .on_reading(reading("pzem3", 230.0, 2.0, 200.0))
        .await;

    h.connect().await;
    assert_eq!(h.publisher.flush_pending().await, 1);

    let sent = h.mqtt.published_to("home/energy/pzem3");
    assert_eq!(sent.len(), 1);
    let payload: TelemetryPayload = serde_json::from_slice(&sent[0].payload).unwrap();
    assert_eq!(payload.power, 200.0);
}

/// One sampling pass publishes every configured meter on its own topic.
#[tokio::test]
async fn e2e_sampling_pass_covers_all_meters() {
    let h = TestHarness::connected().await;
    let source = SimulatedSource::new(
        h.config.topics.sensors.keys().cloned(),
        Duration::from_secs(10),
    );

    sample_all(&h.publisher, &source).await;

    for topic in ["home/energy/pzem1", "home/energy/pzem2", "home/energy/pzem3"] {
        assert_eq!(h.mqtt.published_to(topic).len(), 1, "{topic}");
    }
    assert_eq!(h.publisher.stats().await.published, 3);
}
