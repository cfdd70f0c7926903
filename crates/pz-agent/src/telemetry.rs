//! Telemetry publisher and sampling loop.
//!
//! Publishes the latest snapshot per meter channel. There is no history
//! queue: while the broker handshake is underway one pending snapshot is
//! kept per channel and a newer reading replaces it; while disconnected
//! readings are counted and dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::QoS;
use tokio::sync::Mutex;
use tokio::time;

use pz_mqtt_channel::{Session, SessionState};
use pz_protocol::{SensorReading, TelemetryCounters, TopicSet, ValidationError};

use crate::error::SensorError;

/// Upper bound on a single meter read.
const SENSOR_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened to one reading.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published,
    /// Held until the session authenticates.
    Deferred,
    /// Session down; counted and discarded.
    Dropped,
    /// The publish was attempted and failed; logged and discarded.
    Failed,
    Rejected(ValidationError),
}

pub struct TelemetryPublisher {
    session: Arc<Session>,
    topics: TopicSet,
    pending: Mutex<BTreeMap<String, SensorReading>>,
    counters: Mutex<TelemetryCounters>,
}

impl TelemetryPublisher {
    pub fn new(session: Arc<Session>, topics: TopicSet) -> Self {
        Self {
            session,
            topics,
            pending: Mutex::new(BTreeMap::new()),
            counters: Mutex::new(TelemetryCounters::default()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn stats(&self) -> TelemetryCounters {
        *self.counters.lock().await
    }

    /// Channels holding a snapshot that has not been published yet.
    pub async fn pending_channels(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }

    /// Handle one reading according to the current session state.
    pub async fn on_reading(&self, reading: SensorReading) -> PublishOutcome {
        if let Err(e) = reading.validate() {
            return self.reject(e).await;
        }
        let Some(topic) = self.topics.sensor(&reading.channel).map(str::to_string) else {
            return self
                .reject(ValidationError::UnknownChannel(reading.channel.clone()))
                .await;
        };

        match self.session.state() {
            SessionState::Authenticated => {
                // A fresher reading supersedes anything still pending.
                if self.pending.lock().await.remove(&reading.channel).is_some() {
                    self.counters.lock().await.dropped += 1;
                }
                self.publish_now(&topic, &reading).await
            }
            SessionState::Connecting | SessionState::Connected => {
                let replaced = self
                    .pending
                    .lock()
                    .await
                    .insert(reading.channel.clone(), reading);
                let mut counters = self.counters.lock().await;
                counters.deferred += 1;
                if replaced.is_some() {
                    counters.dropped += 1;
                }
                PublishOutcome::Deferred
            }
            SessionState::Disconnected => {
                self.counters.lock().await.dropped += 1;
                tracing::debug!(channel = %reading.channel, "session down, reading dropped");
                PublishOutcome::Dropped
            }
        }
    }

    /// Publish held snapshots. Does nothing unless authenticated.
    pub async fn flush_pending(&self) -> usize {
        if !self.session.is_authenticated() {
            return 0;
        }
        let pending = std::mem::take(&mut *self.pending.lock().await);
        let mut published = 0;
        for (channel, reading) in pending {
            let Some(topic) = self.topics.sensor(&channel) else {
                continue;
            };
            if self.publish_now(topic, &reading).await == PublishOutcome::Published {
                published += 1;
            }
        }
        if published > 0 {
            tracing::info!(published, "flushed pending telemetry");
        }
        published
    }

    async fn publish_now(&self, topic: &str, reading: &SensorReading) -> PublishOutcome {
        let payload = match serde_json::to_vec(&reading.payload()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %reading.channel, error = %e, "failed to encode reading");
                self.counters.lock().await.failed += 1;
                return PublishOutcome::Failed;
            }
        };

        match self
            .session
            .publish_with_qos(topic, &payload, QoS::AtMostOnce, false)
            .await
        {
            Ok(()) => {
                self.counters.lock().await.published += 1;
                tracing::debug!(channel = %reading.channel, topic, power = reading.power, "telemetry published");
                PublishOutcome::Published
            }
            Err(e) => {
                self.counters.lock().await.failed += 1;
                tracing::warn!(channel = %reading.channel, error = %e, "telemetry publish failed");
                PublishOutcome::Failed
            }
        }
    }

    async fn reject(&self, error: ValidationError) -> PublishOutcome {
        tracing::warn!(error = %error, "reading rejected");
        self.counters.lock().await.rejected += 1;
        PublishOutcome::Rejected(error)
    }
}

// ── Sensor source ─────────────────────────────────────────────

/// Producer of meter readings (the PZEM Modbus driver on hardware).
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Channel ids this source can sample.
    fn channels(&self) -> Vec<String>;

    async fn read(&self, channel: &str) -> Result<SensorReading, SensorError>;
}

/// Synthetic meters with a steady per-channel load.
///
/// Channel `n` (1-based) draws `100 * n` W at ~230 V / 50 Hz; energy
/// accumulates with each sample.
pub struct SimulatedSource {
    channels: Vec<String>,
    sample_interval: Duration,
    samples: AtomicU64,
    offline: StdMutex<BTreeSet<String>>,
}

impl SimulatedSource {
    pub fn new(channels: impl IntoIterator<Item = String>, sample_interval: Duration) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            sample_interval,
            samples: AtomicU64::new(0),
            offline: StdMutex::new(BTreeSet::new()),
        }
    }

    /// Make reads on `channel` fail, as an unplugged meter would.
    pub fn set_offline(&self, channel: &str, offline: bool) {
        let mut set = self.offline.lock().unwrap_or_else(|e| e.into_inner());
        if offline {
            set.insert(channel.to_string());
        } else {
            set.remove(channel);
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedSource {
    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    async fn read(&self, channel: &str) -> Result<SensorReading, SensorError> {
        let Some(index) = self.channels.iter().position(|c| c == channel) else {
            return Err(SensorError::UnknownChannel(channel.to_string()));
        };
        let offline = self
            .offline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(channel);
        if offline {
            return Err(SensorError::ReadFailed {
                channel: channel.to_string(),
                reason: "no response from meter".into(),
            });
        }

        let n = self.samples.fetch_add(1, Ordering::Relaxed);
        let voltage = 229.5 + (n % 5) as f64 * 0.2;
        let power = 100.0 * (index + 1) as f64;
        let hours = self.sample_interval.as_secs_f64() / 3600.0;
        Ok(SensorReading {
            channel: channel.to_string(),
            voltage,
            current: power / voltage,
            power,
            energy: power * hours * (n + 1) as f64 / 1000.0,
            frequency: 50.0,
            power_factor: 0.95,
            timestamp: Utc::now(),
        })
    }
}

// ── Sampling loop ─────────────────────────────────────────────

/// Read every channel once and hand the readings to the publisher.
pub async fn sample_all(publisher: &TelemetryPublisher, source: &dyn SensorSource) {
    for channel in source.channels() {
        match time::timeout(SENSOR_READ_TIMEOUT, source.read(&channel)).await {
            Ok(Ok(reading)) => {
                publisher.on_reading(reading).await;
            }
            Ok(Err(e)) => tracing::warn!(channel = %channel, error = %e, "meter read failed"),
            Err(_) => tracing::warn!(channel = %channel, "meter read timed out"),
        }
    }
}

/// Run the sampling loop at `interval`, flushing pending snapshots each
/// time the session authenticates.
///
/// Runs until the session is dropped or the task is cancelled.
pub async fn run(publisher: &TelemetryPublisher, source: &dyn SensorSource, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    let mut state_rx = publisher.session().watch_state();

    loop {
        tokio::select! {
            _ = ticker.tick() => sample_all(publisher, source).await,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *state_rx.borrow_and_update();
                if state == SessionState::Authenticated {
                    publisher.flush_pending().await;
                }
            }
        }
    }
}
