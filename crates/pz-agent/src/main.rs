//! PZEM energy gateway agent.
//!
//! Wires the network link, broker session, meter sampling, relay control,
//! discovery and status reporting into a single binary.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use pz_agent::config::AgentConfig;
use pz_agent::discovery::DiscoveryAnnouncer;
use pz_agent::link::{NetworkLink, TcpProbeDriver};
use pz_agent::mqtt_loop::{self, SessionDriver};
use pz_agent::relay::{CommandSubscriber, MemoryActuator};
use pz_agent::telemetry::{self, SimulatedSource, TelemetryPublisher};
use pz_agent::status;
use pz_mqtt_channel::Session;

/// How often the supervisor re-probes the network link.
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Time allowed for the final `offline` publish and DISCONNECT at shutdown.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pz-agent starting");

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/pzem/agent.toml".to_string());

    let config = AgentConfig::load(&config_path)?;
    let topics = config.topics.clone();
    tracing::info!(
        hostname = %config.network.hostname,
        broker = %config.mqtt.broker_host,
        port = config.mqtt.broker_port,
        meters = topics.sensors.len(),
        relays = config.relays.len(),
        "config loaded"
    );

    // ── Network link ────────────────────────────────────────────
    // Host build: the link is "up" while the broker accepts TCP.
    let credentials = config.credentials();
    let link = NetworkLink::new(
        TcpProbeDriver::new(&config.mqtt.broker_host, config.mqtt.broker_port),
        config.link_policy(),
    );
    let handle = link.connect_with_retry(&credentials, None).await?;
    tracing::info!(hostname = %handle.hostname, attempts = handle.attempts, "network ready");

    // ── Broker session ──────────────────────────────────────────
    let (session, mut eventloop) = Session::open(
        &config.mqtt,
        &config.client_id(),
        Some(status::last_will(&topics)),
    )?;
    let session = Arc::new(session);

    // ── Relay control ───────────────────────────────────────────
    let actuator = Arc::new(MemoryActuator::new(config.relays.clone()));
    let subscriber = Arc::new(CommandSubscriber::new(
        topics.clone(),
        config.relays.clone(),
        actuator,
    ));
    subscriber.register(&session).await?;

    // Registered now, published once the session authenticates and
    // replayed after every reconnect.
    DiscoveryAnnouncer::from_config(&config)
        .announce_all(&session)
        .await?;
    status::announce_online(&session, &topics).await?;
    subscriber.report_all(&session).await?;

    // ── Telemetry ───────────────────────────────────────────────
    let publisher = TelemetryPublisher::new(Arc::clone(&session), topics.clone());
    let source = SimulatedSource::new(topics.sensors.keys().cloned(), config.telemetry_interval());

    let mut driver = SessionDriver::from_config(&session, &config.mqtt);
    let start_time = tokio::time::Instant::now();

    tracing::info!("pz-agent ready");

    tokio::select! {
        () = mqtt_loop::run(&mut eventloop, &mut driver, link.watch()) => {
            tracing::error!("MQTT loop exited unexpectedly");
        }
        () = link.supervise(&credentials, LINK_CHECK_INTERVAL) => {
            tracing::error!("link supervisor exited unexpectedly");
        }
        () = telemetry::run(&publisher, &source, config.telemetry_interval()) => {
            tracing::error!("telemetry loop exited unexpectedly");
        }
        () = status::run(
            &session,
            &publisher,
            &topics,
            &config.network.hostname,
            config.status_interval(),
            start_time,
        ) => {
            tracing::error!("status loop exited unexpectedly");
        }
        // Graceful shutdown on SIGINT/SIGTERM
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if session.is_authenticated() {
        if let Err(e) = status::announce_offline(&session, &topics).await {
            tracing::warn!(error = %e, "failed to publish offline status");
        }
        match session.close().await {
            Ok(()) => {
                if !mqtt_loop::flush_outgoing(&mut eventloop, SHUTDOWN_FLUSH).await {
                    tracing::warn!("offline status may not have reached the broker");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to queue MQTT disconnect"),
        }
    }

    let stats = publisher.stats().await;
    tracing::info!(
        published = stats.published,
        dropped = stats.dropped,
        recoveries = session.recoveries(),
        "pz-agent stopped"
    );
    Ok(())
}
