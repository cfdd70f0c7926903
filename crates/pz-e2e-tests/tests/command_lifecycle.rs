//! E2E tests for relay commands: inbound publish through session dispatch,
//! actuator, and retained state confirmation.

mod helpers;

use helpers::TestHarness;
use pz_agent::relay::Actuator;
use pz_protocol::{RelayCommand, RelayState};

/// A valid command produces exactly one confirmation with matching
/// channel and state.
#[tokio::test]
async fn e2e_command_confirmed_once() {
    let h = TestHarness::connected().await;

    h.deliver("home/relay/relay1/set", "ON").await;

    assert_eq!(
        h.actuator.calls(),
        vec![RelayCommand::new("relay1", RelayState::On)]
    );
    assert_eq!(h.payloads("home/relay/relay1/state"), vec!["ON"]);
    assert!(h.payloads("home/relay/relay2/state").is_empty());
    assert_eq!(
        h.mqtt.retained("home/relay/relay1/state"),
        Some(b"ON".to_vec())
    );
}

/// The shared command topic routes by the channel suffix in the payload.
#[tokio::test]
async fn e2e_shared_topic_command() {
    let h = TestHarness::connected().await;

    h.deliver("home/relay/set", "ON relay2").await;
    h.deliver("home/relay/set", "OFF:relay2").await;

    assert_eq!(h.actuator.state("relay2").await, Some(RelayState::Off));
    assert_eq!(h.payloads("home/relay/relay2/state"), vec!["ON", "OFF"]);
}

/// Each command is confirmed even when the state does not change.
#[tokio::test]
async fn e2e_repeated_command_confirmed_each_time() {
    let h = TestHarness::connected().await;

    for _ in 0..3 {
        h.deliver("home/relay/relay2/set", "OFF").await;
    }
    assert_eq!(h.actuator.calls().len(), 3);
    assert_eq!(h.payloads("home/relay/relay2/state").len(), 3);
}

/// Relay states registered before the first connect reach the broker on
/// authentication.
#[tokio::test]
async fn e2e_initial_relay_states_reported_on_connect() {
    let h = TestHarness::new().await;
    assert!(h.mqtt.published().is_empty());

    h.connect().await;
    assert_eq!(h.payloads("home/relay/relay1/state"), vec!["OFF"]);
    assert_eq!(h.payloads("home/relay/relay2/state"), vec!["OFF"]);
}

/// The last confirmed state, not the boot state, is replayed after a
/// reconnect.
#[tokio::test]
async fn e2e_confirmed_state_survives_reconnect() {
    let h = TestHarness::connected().await;
    h.deliver("home/relay/relay1/set", "ON").await;
    h.mqtt.reset();

    h.drop_connection().await;
    h.connect().await;

    assert_eq!(h.payloads("home/relay/relay1/state"), vec!["ON"]);
    assert_eq!(h.payloads("home/relay/relay2/state"), vec!["OFF"]);
}
