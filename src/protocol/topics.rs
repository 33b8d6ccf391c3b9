//! Device name and topic validation
//!
//! Device names end up inside the client identifier and usually inside topic names,
//! so they are restricted to a conservative character set. Topics handled by the
//! client are matched exactly, which rules out MQTT wildcards. Empty topic levels
//! are legal MQTT but almost always a templating mistake, so they are refused too.

use thiserror::Error;

pub fn validate_device_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyDeviceName);
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceNameChar(ch));
        }
    }

    Ok(())
}

/// Validate a topic used for exact-match subscription and publishing
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    if let Some(ch) = topic.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
        return Err(ValidationError::InvalidTopicChar {
            topic: topic.to_string(),
            ch,
        });
    }

    if topic.split('/').any(str::is_empty) {
        return Err(ValidationError::EmptyTopicLevel(topic.to_string()));
    }

    Ok(())
}

/// Client identifier presented to the broker: `<name>-<mac>`
pub fn build_client_id(name: &str, mac: &str) -> String {
    format!("{name}-{mac}")
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device name cannot be empty")]
    EmptyDeviceName,
    #[error("Device name contains invalid character: '{0}'")]
    InvalidDeviceNameChar(char),
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic '{topic}' contains invalid character: {ch:?}")]
    InvalidTopicChar { topic: String, ch: char },
    #[error("Topic '{0}' has an empty level")]
    EmptyTopicLevel(String),
}
