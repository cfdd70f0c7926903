//! PZEM energy gateway agent, library crate.
//!
//! Re-exports all modules so the binary and `pz-e2e-tests` can reach the
//! components (`NetworkLink`, `TelemetryPublisher`, `CommandSubscriber`,
//! `DiscoveryAnnouncer`) and their in-memory collaborators.

pub mod config;
pub mod discovery;
pub mod error;
pub mod link;
pub mod mqtt_loop;
pub mod relay;
pub mod status;
pub mod telemetry;
