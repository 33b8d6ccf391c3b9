//! Stable device identity: configured name plus hardware id
//!
//! The hardware id is what distinguishes two devices that were (mis)configured with
//! the same name, so it is normalised to one canonical text form before it is ever
//! compared against a status payload.

use super::topics::{build_client_id, validate_device_name, ValidationError};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 48-bit hardware address, displayed as colon-separated lowercase hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = IdentityError;

    /// Accepts `:` or `-` separators in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(IdentityError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(IdentityError::InvalidMac(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| IdentityError::InvalidMac(s.to_string()))?;
        }

        Ok(Self(octets))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("Invalid hardware address: {0}")]
    InvalidMac(String),
    #[error("Invalid device name: {0}")]
    InvalidName(#[from] ValidationError),
}

/// Name and hardware id this device asserts on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    name: String,
    mac: MacAddress,
    mac_text: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, mac: MacAddress) -> Result<Self, IdentityError> {
        let name = name.into();
        validate_device_name(&name)?;
        Ok(Self {
            name,
            mac,
            mac_text: mac.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Canonical text form used in status payloads
    pub fn mac_str(&self) -> &str {
        &self.mac_text
    }

    pub fn client_id(&self) -> String {
        build_client_id(&self.name, &self.mac_text)
    }

    /// Whether a hardware id seen on the bus refers to this device.
    ///
    /// Foreign firmware may publish uppercase or dash-separated ids; unparseable
    /// ids never match.
    pub fn is_own_mac(&self, mac: &str) -> bool {
        mac.parse::<MacAddress>()
            .map(|parsed| parsed == self.mac)
            .unwrap_or(false)
    }
}
