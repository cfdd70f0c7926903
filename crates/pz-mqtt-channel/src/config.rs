use std::time::Duration;

use serde::Deserialize;

/// Broker address and credentials used to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl BrokerEndpoint {
    /// Empty username means the broker allows anonymous clients.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// MQTT connection configuration, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP.
    pub broker_host: String,
    /// MQTT broker port (default 1883, plaintext).
    #[serde(default = "default_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// MQTT client ID. Defaults to the device hostname when unset.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Enable TLS. When false, connects plaintext.
    #[serde(default)]
    pub use_tls: bool,
    /// Path to the broker CA certificate (PEM). Required with TLS.
    #[serde(default)]
    pub ca_cert_path: String,
    /// Optional client certificate (PEM) for mutual TLS.
    #[serde(default)]
    pub client_cert_path: String,
    /// Optional client private key (PEM) for mutual TLS.
    #[serde(default)]
    pub client_key_path: String,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// How long a ping may go unanswered before the session is torn down.
    #[serde(default = "default_keepalive_grace")]
    pub keepalive_grace_secs: u16,
    /// First reconnect delay; doubles on each failure.
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    30
}

fn default_keepalive_grace() -> u16 {
    15
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    60
}

impl MqttConfig {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.broker_host.clone(),
            port: self.broker_port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.into())
    }

    pub fn keepalive_grace(&self) -> Duration {
        Duration::from_secs(self.keepalive_grace_secs.into())
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_plain_broker() {
        let config: MqttConfig = toml::from_str(r#"broker_host = "mqtt.example.com""#).unwrap();
        assert_eq!(config.broker_port, 1883);
        assert!(!config.use_tls);
        assert_eq!(config.keepalive(), Duration::from_secs(30));
        assert_eq!(config.keepalive_grace(), Duration::from_secs(15));
        assert_eq!(config.reconnect_initial(), Duration::from_millis(500));
        assert_eq!(config.reconnect_max(), Duration::from_secs(60));
        assert!(!config.endpoint().has_credentials());
    }

    #[test]
    fn endpoint_carries_credentials() {
        let config: MqttConfig = toml::from_str(
            r#"
broker_host = "10.0.0.2"
broker_port = 8883
username = "meter"
password = "secret"
"#,
        )
        .unwrap();
        let endpoint = config.endpoint();
        assert_eq!(endpoint.host, "10.0.0.2");
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.has_credentials());
        assert_eq!(endpoint.password, "secret");
    }
}
