use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability payload published once the session is authenticated.
pub const AVAILABILITY_ONLINE: &str = "online";
/// Availability payload registered as the broker last-will.
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Telemetry publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub published: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Periodic status report published on the status topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub hostname: String,
    /// Session state label (e.g. "authenticated").
    pub session: String,
    pub uptime_secs: u64,
    /// Completed session recoveries since boot.
    pub recoveries: u64,
    pub telemetry: TelemetryCounters,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_status_roundtrip() {
        let status = DeviceStatus {
            hostname: "pzem-gw-01".into(),
            session: "authenticated".into(),
            uptime_secs: 3600,
            recoveries: 2,
            telemetry: TelemetryCounters {
                published: 10,
                dropped: 1,
                ..Default::default()
            },
            agent_version: "0.1.0".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: DeviceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hostname, "pzem-gw-01");
        assert_eq!(back.telemetry.published, 10);
        assert_eq!(back.telemetry.dropped, 1);
    }
}
