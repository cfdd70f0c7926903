//! Relay command subscriber.
//!
//! Listens on the relay command topics, validates each command against
//! the configured channels, drives the actuator and confirms the resulting
//! state on `<relay>/<channel>/state` (retained).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rumqttc::QoS;

use pz_mqtt_channel::{InboundMessage, MessageHandler, Session, SessionResult};
use pz_protocol::{RelayCommand, RelayState, TopicSet, ValidationError};

use crate::error::ActuatorError;

/// Relay driver. Returns the state the output actually reached.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn apply(&self, channel: &str, state: RelayState) -> Result<RelayState, ActuatorError>;

    /// Current output state, `None` for an unknown channel.
    async fn state(&self, channel: &str) -> Option<RelayState>;
}

/// In-memory relay bank. All channels start `Off`.
pub struct MemoryActuator {
    states: Mutex<BTreeMap<String, RelayState>>,
    calls: Mutex<Vec<RelayCommand>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryActuator {
    pub fn new(channels: impl IntoIterator<Item = String>) -> Self {
        Self {
            states: Mutex::new(
                channels
                    .into_iter()
                    .map(|c| (c, RelayState::Off))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Every `apply` call received, in order.
    pub fn calls(&self) -> Vec<RelayCommand> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make `apply` on `channel` fail, as a stuck contact would.
    pub fn set_failing(&self, channel: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if failing {
            set.insert(channel.to_string());
        } else {
            set.remove(channel);
        }
    }
}

#[async_trait]
impl Actuator for MemoryActuator {
    async fn apply(&self, channel: &str, state: RelayState) -> Result<RelayState, ActuatorError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RelayCommand::new(channel, state));

        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(channel)
        {
            return Err(ActuatorError {
                channel: channel.to_string(),
                reason: "output did not switch".into(),
            });
        }

        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match states.get_mut(channel) {
            Some(current) => {
                *current = state;
                Ok(state)
            }
            None => Err(ActuatorError {
                channel: channel.to_string(),
                reason: "no such output".into(),
            }),
        }
    }

    async fn state(&self, channel: &str) -> Option<RelayState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .copied()
    }
}

/// Result of handling one inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Applied and confirmed.
    Applied(RelayCommand),
    /// Discarded before reaching the actuator.
    Rejected(ValidationError),
    /// The actuator failed; nothing was confirmed.
    ActuatorFailed(ActuatorError),
    /// Applied, but the confirmation could not be published.
    Unconfirmed { command: RelayCommand, error: String },
}

pub struct CommandSubscriber {
    topics: TopicSet,
    channels: BTreeSet<String>,
    actuator: Arc<dyn Actuator>,
}

impl CommandSubscriber {
    pub fn new(
        topics: TopicSet,
        channels: impl IntoIterator<Item = String>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        Self {
            topics,
            channels: channels.into_iter().collect(),
            actuator,
        }
    }

    /// Subscribe to the command filters. The session re-issues them after
    /// every reconnect.
    pub async fn register(self: &Arc<Self>, session: &Session) -> SessionResult<()> {
        for filter in self.topics.relay_command_filters() {
            session
                .subscribe(&filter, QoS::AtLeastOnce, Arc::clone(self) as Arc<dyn MessageHandler>)
                .await?;
            tracing::info!(filter = %filter, "relay command subscription registered");
        }
        Ok(())
    }

    fn parse(&self, message: &InboundMessage) -> Result<RelayCommand, ValidationError> {
        let topic_channel = self
            .topics
            .parse_relay_command(&message.topic)
            .ok_or_else(|| ValidationError::MalformedCommand(message.topic.clone()))?;
        let command = RelayCommand::parse(topic_channel, &message.payload)?;
        if !self.channels.contains(&command.channel) {
            return Err(ValidationError::UnknownChannel(command.channel));
        }
        Ok(command)
    }

    pub async fn handle_command(&self, session: &Session, message: &InboundMessage) -> CommandOutcome {
        let command = match self.parse(message) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "relay command discarded");
                return CommandOutcome::Rejected(e);
            }
        };

        let reached = match self.actuator.apply(&command.channel, command.state).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(channel = %command.channel, error = %e, "relay actuation failed");
                return CommandOutcome::ActuatorFailed(e);
            }
        };

        let confirmed = RelayCommand::new(command.channel, reached);
        let state_topic = self.topics.relay_state(&confirmed.channel);
        match session
            .publish_state(&state_topic, reached.as_str().as_bytes())
            .await
        {
            Ok(()) => {
                tracing::info!(channel = %confirmed.channel, state = %reached, "relay state confirmed");
                CommandOutcome::Applied(confirmed)
            }
            Err(e) => {
                tracing::warn!(channel = %confirmed.channel, error = %e, "failed to confirm relay state");
                CommandOutcome::Unconfirmed {
                    command: confirmed,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Make the broker hold the current state of every relay.
    /// Returns how many states were actually published.
    pub async fn report_all(&self, session: &Session) -> SessionResult<usize> {
        let mut published = 0;
        for channel in &self.channels {
            let Some(state) = self.actuator.state(channel).await else {
                continue;
            };
            let topic = self.topics.relay_state(channel);
            if session
                .ensure_retained(&topic, state.as_str().as_bytes())
                .await?
            {
                published += 1;
            }
        }
        Ok(published)
    }
}

#[async_trait]
impl MessageHandler for CommandSubscriber {
    async fn handle(&self, session: &Session, message: &InboundMessage) {
        self.handle_command(session, message).await;
    }
}
