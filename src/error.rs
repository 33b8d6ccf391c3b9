//! Crate-level error type for the composition root
//!
//! The client core reports failures as state transitions and logs; the errors
//! collected here are the ones that stop the node from starting at all.

use crate::config::ConfigError;
use crate::platform::StoreError;
use crate::protocol::IdentityError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("No hardware address found; set [device].mac")]
    HardwareIdUnavailable,

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;
