use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// One sample from a PZEM power meter channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Logical channel id (e.g. "pzem1").
    pub channel: String,
    /// RMS voltage in volts.
    pub voltage: f64,
    /// RMS current in amperes.
    pub current: f64,
    /// Active power in watts.
    pub power: f64,
    /// Accumulated energy in kWh.
    pub energy: f64,
    /// Line frequency in hertz.
    pub frequency: f64,
    /// Power factor (0.0 - 1.0).
    pub power_factor: f64,
    /// When the meter was sampled.
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// Reject readings carrying NaN or infinite values (failed meter reads).
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fields = [
            ("voltage", self.voltage),
            ("current", self.current),
            ("power", self.power),
            ("energy", self.energy),
            ("frequency", self.frequency),
            ("power_factor", self.power_factor),
        ];
        match fields.iter().find(|(_, v)| !v.is_finite()) {
            Some((field, _)) => Err(ValidationError::InvalidReading {
                channel: self.channel.clone(),
                field: *field,
            }),
            None => Ok(()),
        }
    }

    /// Wire payload for the channel's telemetry topic.
    pub fn payload(&self) -> TelemetryPayload {
        TelemetryPayload {
            voltage: self.voltage,
            current: self.current,
            power: self.power,
            energy: self.energy,
            frequency: self.frequency,
            pf: self.power_factor,
        }
    }
}

/// JSON body published on a PZEM topic.
///
/// ```text
/// {"voltage":230.1,"current":1.2,"power":276.0,"energy":12.34,"frequency":50.0,"pf":0.98}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    pub frequency: f64,
    pub pf: f64,
}
