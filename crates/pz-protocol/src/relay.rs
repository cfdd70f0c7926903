use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Relay output state. Wire form is `"ON"` / `"OFF"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::On => "ON",
            RelayState::Off => "OFF",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" | "TRUE" => Ok(RelayState::On),
            "OFF" | "0" | "FALSE" => Ok(RelayState::Off),
            _ => Err(ValidationError::MalformedCommand(s.to_string())),
        }
    }
}

/// A request to drive one relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    pub channel: String,
    pub state: RelayState,
}

impl RelayCommand {
    pub fn new(channel: impl Into<String>, state: RelayState) -> Self {
        Self {
            channel: channel.into(),
            state,
        }
    }

    /// Parse an inbound command.
    ///
    /// `topic_channel` is the channel taken from the topic
    /// (`<relay>/<channel>/set`), `None` for the shared `<relay>/set` topic.
    /// The payload is `ON`/`OFF`, optionally followed by a channel id
    /// separated by whitespace or `:` (`"ON relay2"`, `"OFF:relay1"`).
    /// When both name a channel they must agree.
    pub fn parse(topic_channel: Option<&str>, payload: &[u8]) -> Result<Self, ValidationError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ValidationError::MalformedCommand(String::from_utf8_lossy(payload).into()))?
            .trim()
            .trim_matches('"');

        let (state_part, suffix) = match text.split_once(|c: char| c == ':' || c.is_whitespace()) {
            Some((state, rest)) => (state, Some(rest.trim()).filter(|s| !s.is_empty())),
            None => (text, None),
        };

        let state = state_part
            .parse::<RelayState>()
            .map_err(|_| ValidationError::MalformedCommand(text.to_string()))?;

        let channel = match (topic_channel, suffix) {
            (Some(topic), Some(payload)) if topic != payload => {
                return Err(ValidationError::ChannelMismatch {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                });
            }
            (Some(topic), _) => topic.to_string(),
            (None, Some(payload)) => payload.to_string(),
            (None, None) => return Err(ValidationError::MissingChannel),
        };

        Ok(Self { channel, state })
    }
}
