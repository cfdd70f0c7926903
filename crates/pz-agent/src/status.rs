//! Availability and periodic status reports.
//!
//! Availability is `online` (retained, ensured on every authentication)
//! with a broker last-will of `offline`. The status report carries session
//! state, uptime and telemetry counters.

use std::time::Duration;

use chrono::Utc;
use rumqttc::{LastWill, QoS};
use tokio::time::{self, Instant};

use pz_mqtt_channel::{Session, SessionError, SessionResult};
use pz_protocol::{AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE, DeviceStatus, TopicSet};

use crate::telemetry::TelemetryPublisher;

/// Last-will registered with the broker at connect time.
pub fn last_will(topics: &TopicSet) -> LastWill {
    LastWill::new(
        topics.availability.clone(),
        AVAILABILITY_OFFLINE,
        QoS::AtLeastOnce,
        true,
    )
}

/// Retain `online` on the availability topic.
pub async fn announce_online(session: &Session, topics: &TopicSet) -> SessionResult<bool> {
    session
        .ensure_retained(&topics.availability, AVAILABILITY_ONLINE.as_bytes())
        .await
}

/// Retain `offline` before a clean shutdown; the broker does not fire the
/// last-will on a graceful disconnect.
pub async fn announce_offline(session: &Session, topics: &TopicSet) -> SessionResult<()> {
    session
        .publish(&topics.availability, AVAILABILITY_OFFLINE.as_bytes(), true)
        .await
}

pub async fn build_status(
    session: &Session,
    publisher: &TelemetryPublisher,
    hostname: &str,
    start_time: Instant,
) -> DeviceStatus {
    DeviceStatus {
        hostname: hostname.to_string(),
        session: session.state().to_string(),
        uptime_secs: start_time.elapsed().as_secs(),
        recoveries: session.recoveries(),
        telemetry: publisher.stats().await,
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    }
}

pub async fn publish_status(
    session: &Session,
    topics: &TopicSet,
    status: &DeviceStatus,
) -> SessionResult<()> {
    let payload =
        serde_json::to_vec(status).map_err(|e| SessionError::Serialization(e.to_string()))?;
    session.publish(&topics.status, &payload, false).await
}

/// Run the status loop, publishing at `interval` while authenticated.
///
/// This function runs forever until the task is cancelled.
pub async fn run(
    session: &Session,
    publisher: &TelemetryPublisher,
    topics: &TopicSet,
    hostname: &str,
    interval: Duration,
    start_time: Instant,
) {
    let mut ticker = time::interval(interval);
    // Skip the first tick (fires immediately).
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if !session.is_authenticated() {
            tracing::debug!(state = %session.state(), "session not ready, status skipped");
            continue;
        }

        let status = build_status(session, publisher, hostname, start_time).await;
        if let Err(e) = publish_status(session, topics, &status).await {
            tracing::warn!(error = %e, "failed to publish status");
        } else {
            tracing::debug!(uptime_secs = status.uptime_secs, "status sent");
        }
    }
}
