//! TLS transport for brokers that require it.
//!
//! Loads the broker CA certificate and, when both paths are configured,
//! a client certificate/key pair for mutual TLS.

use rumqttc::{TlsConfiguration, Transport};

use crate::config::MqttConfig;
use crate::error::{SessionError, SessionResult};

/// Build a TLS transport from certificate file paths in the config.
pub fn load_tls_transport(config: &MqttConfig) -> SessionResult<Transport> {
    if config.ca_cert_path.is_empty() {
        return Err(SessionError::Tls("use_tls is set but ca_cert_path is empty".into()));
    }

    let ca = std::fs::read(&config.ca_cert_path).map_err(|e| {
        SessionError::Tls(format!(
            "failed to read CA cert '{}': {e}",
            config.ca_cert_path
        ))
    })?;

    let client_auth = match (
        config.client_cert_path.is_empty(),
        config.client_key_path.is_empty(),
    ) {
        (true, true) => None,
        (false, false) => {
            let cert = std::fs::read(&config.client_cert_path).map_err(|e| {
                SessionError::Tls(format!(
                    "failed to read client cert '{}': {e}",
                    config.client_cert_path
                ))
            })?;
            let key = std::fs::read(&config.client_key_path).map_err(|e| {
                SessionError::Tls(format!(
                    "failed to read client key '{}': {e}",
                    config.client_key_path
                ))
            })?;
            Some((cert, key))
        }
        _ => {
            return Err(SessionError::Tls(
                "client_cert_path and client_key_path must be set together".into(),
            ));
        }
    };

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}
