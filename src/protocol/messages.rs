//! Wire payloads exchanged on the bus
//!
//! Availability topics carry the ASCII strings `"1"` / `"0"`, status topics carry a
//! JSON object describing the device currently holding the name. Both are retained.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Payload published on the availability topic while the device is alive
pub const AVAILABLE_PAYLOAD: &str = "1";

/// Payload published on the availability topic (and used as last-will) when gone
pub const UNAVAILABLE_PAYLOAD: &str = "0";

/// A single pub/sub message as seen by the client and the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    /// Retained availability announcement (`"1"` or `"0"`)
    pub fn availability(topic: &str, available: bool) -> Self {
        let payload = if available {
            AVAILABLE_PAYLOAD
        } else {
            UNAVAILABLE_PAYLOAD
        };
        Self::new(topic, Bytes::from_static(payload.as_bytes()), true)
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Parse an availability payload.
///
/// Only the exact strings `"1"` and `"0"` are recognised; surrounding whitespace is
/// tolerated because some brokers' tooling appends a newline to retained payloads.
pub fn parse_availability(payload: &[u8]) -> Option<bool> {
    match std::str::from_utf8(payload).ok()?.trim() {
        AVAILABLE_PAYLOAD => Some(true),
        UNAVAILABLE_PAYLOAD => Some(false),
        _ => None,
    }
}

/// Heartbeat status published by this device on its status topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    /// Configured device name
    pub name: String,
    /// Hardware id, colon-separated lowercase hex
    pub mac: String,
    /// First heartbeat after (re)establishing the connection
    pub restarted: bool,
    /// Current network address
    pub ip: String,
    /// Milliseconds since boot
    pub uptime: u64,
    /// Free memory in bytes
    pub free_memory: u64,
    /// Average tick latency since the previous heartbeat, in milliseconds
    pub avg_cycle_time: f64,
    /// Largest single tick latency since the previous heartbeat, in milliseconds
    pub max_cycle_time: u64,
}

impl StatusPayload {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The identity fields of any status payload, ours or another device's.
///
/// Extra fields are ignored so that older or newer firmware on the bus still parses.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StatusIdentity {
    #[serde(default)]
    pub name: Option<String>,
    pub mac: String,
}

impl StatusIdentity {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
