//! Connection bookkeeping: broker candidates, retry schedule and composite state

use super::negotiation::NegotiationState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One candidate broker
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    1883
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Connection retry delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delays for the first failed attempts, in milliseconds
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay: u64,
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![1_000, 2_000, 5_000, 10_000]
}

fn default_sustained_delay() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: default_backoff_pattern(),
            sustained_delay: default_sustained_delay(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the next attempt after `attempt` consecutive failures (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// When the next connection attempt may happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    config: ReconnectConfig,
    failures: u32,
    next_attempt_ms: u64,
}

impl RetrySchedule {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
            next_attempt_ms: 0,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_attempt_ms
    }

    pub fn next_attempt_ms(&self) -> u64 {
        self.next_attempt_ms
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Push the next attempt out by the current delay; returns that delay
    pub fn record_failure(&mut self, now_ms: u64) -> u64 {
        self.failures = self.failures.saturating_add(1);
        let delay = self.config.calculate_backoff_delay(self.failures);
        self.next_attempt_ms = now_ms.saturating_add(delay);
        delay
    }

    /// Back to the first delay of the pattern
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Composite client state as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport connection; next attempt not before `next_attempt_ms`
    Disconnected { next_attempt_ms: u64 },
    /// Transport up, name not yet claimed
    Negotiating(NegotiationState),
    /// Name claimed, application traffic allowed
    Active,
}

/// Classification of one connect/negotiate step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Transport up, negotiation still running
    Connecting,
    /// No candidate broker accepted the connection
    ConnectionFailed,
    /// Negotiation done
    ConnectionSuccessful,
    /// Connection dropped while negotiating, already handled where it happened
    Rejected,
}
