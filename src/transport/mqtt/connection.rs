//! Pure connection configuration for the MQTT transport
//!
//! This module contains the transport settings, the error type and the pure
//! mapping from [`ConnectParams`] to rumqttc options.

use crate::transport::ConnectParams;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// rumqttc rejects keep-alive intervals shorter than this
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Tunables of the MQTT transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long `connect` waits for the broker's ConnAck
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long one `pump` waits for the next event before returning
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Upper bound of events handled per `pump`
    #[serde(default = "default_max_events_per_pump")]
    pub max_events_per_pump: usize,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_poll_timeout_ms() -> u64 {
    10
}

fn default_max_events_per_pump() -> usize {
    64
}

fn default_max_packet_size() -> u32 {
    64 * 1024
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_events_per_pump: default_max_events_per_pump(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Failed to start transport runtime")]
    Runtime(#[source] std::io::Error),
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker refused connection: {0}")]
    Refused(String),
    #[error("ConnAck timeout after {0:?}")]
    ConnAckTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected")]
    NotConnected,
}

/// Build rumqttc options for one connection attempt (pure function)
pub fn configure_mqtt_options(params: &ConnectParams<'_>, settings: &MqttSettings) -> MqttOptions {
    let mut options = MqttOptions::new(params.client_id, params.host, params.port);

    options.set_keep_alive(Duration::from_secs(
        settings.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
    ));
    options.set_max_packet_size(Some(settings.max_packet_size));

    if let Some(username) = params.username {
        options.set_credentials(username, params.password.unwrap_or_default());
    }

    if let Some(will) = params.will {
        let last_will = LastWill::new(
            will.topic.clone(),
            will.payload.to_vec(),
            QoS::AtLeastOnce,
            will.retain,
            None,
        );
        options.set_last_will(last_will);
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn params<'a>(will: Option<&'a Message>) -> ConnectParams<'a> {
        ConnectParams {
            host: "broker.local",
            port: 1884,
            username: Some("dev"),
            password: Some("secret"),
            client_id: "dev1-02:00:00:00:00:01",
            will,
        }
    }

    #[test]
    fn test_settings_default() {
        let settings = MqttSettings::default();
        assert_eq!(settings.keep_alive_secs, 60);
        assert_eq!(settings.connect_timeout_ms, 5_000);
        assert_eq!(settings.poll_timeout_ms, 10);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let will = Message::availability("ava", false);
        let options = configure_mqtt_options(&params(Some(&will)), &MqttSettings::default());

        assert_eq!(options.client_id(), "dev1-02:00:00:00:00:01");
        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_keep_alive_is_clamped() {
        let settings = MqttSettings {
            keep_alive_secs: 1,
            ..MqttSettings::default()
        };
        let options = configure_mqtt_options(&params(None), &settings);
        assert_eq!(options.keep_alive(), Duration::from_secs(5));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::Refused("NotAuthorized".to_string()),
            MqttError::ConnAckTimeout(Duration::from_secs(5)),
            MqttError::NotConnected,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
