//! Escalating retry-then-restart policy
//!
//! Some failure classes (a wedged radio stack, a corrupted socket layer) are only
//! fixed by a clean reboot. [`Backoff`] tolerates failures for an adaptive window
//! and then restarts the device, doubling the window each time so a device stuck
//! in a genuinely broken environment does not reboot-loop.
//!
//! The window and the start of the current failure run are persisted so that the
//! doubling survives the restart it triggers.

use crate::platform::{CounterStore, Platform};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Success/failure reporting seam used by the client
pub trait RetryPolicy {
    /// The guarded operation succeeded
    fn good(&mut self);

    /// The guarded operation failed. May restart the device and never return.
    fn bad(&mut self);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Window granted to the first failure run
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for the doubled window
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    120_000 // 2 minutes
}

fn default_max_delay_ms() -> u64 {
    3_600_000 // 1 hour
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Persisted part of the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    pub current_delay_ms: u64,
    pub last_failure_ms: Option<u64>,
}

pub struct Backoff<P, S> {
    name: String,
    config: BackoffConfig,
    state: BackoffState,
    platform: P,
    store: S,
}

impl<P: Platform, S: CounterStore> Backoff<P, S> {
    /// Restore the policy named `name` from `store`.
    ///
    /// A failure timestamp later than the current clock was recorded before a
    /// reboot reset the clock; it is re-anchored to now so the restored window
    /// is measured from boot.
    pub fn new(name: impl Into<String>, config: BackoffConfig, platform: P, store: S) -> Self {
        let name = name.into();
        let now = platform.now_ms();

        let current_delay_ms = store
            .read(&delay_key(&name))
            .unwrap_or(config.initial_delay_ms)
            .clamp(config.initial_delay_ms, config.max_delay_ms.max(config.initial_delay_ms));
        let last_failure_ms = store
            .read(&failure_key(&name))
            .map(|recorded| if recorded > now { now } else { recorded });

        debug!(
            backoff = %name,
            current_delay_ms,
            last_failure_ms = ?last_failure_ms,
            "Restored backoff state"
        );

        Self {
            name,
            config,
            state: BackoffState {
                current_delay_ms,
                last_failure_ms,
            },
            platform,
            store,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Time left before the next `bad()` escalates, if a failure run is active
    pub fn remaining_ms(&self) -> Option<u64> {
        let since = self.state.last_failure_ms?;
        let deadline = since.saturating_add(self.state.current_delay_ms);
        Some(deadline.saturating_sub(self.platform.now_ms()))
    }

    fn persist(&mut self) {
        let delay = self
            .store
            .write(&delay_key(&self.name), self.state.current_delay_ms);
        let failure = match self.state.last_failure_ms {
            Some(at) => self.store.write(&failure_key(&self.name), at),
            None => self.store.clear(&failure_key(&self.name)),
        };

        if let Err(e) = delay.and(failure) {
            warn!(backoff = %self.name, error = %e, "Failed to persist backoff state");
        }
    }

    fn escalate(&mut self, since: u64, now: u64) -> ! {
        let elapsed = now - since;
        self.state.current_delay_ms = self
            .state
            .current_delay_ms
            .saturating_mul(2)
            .min(self.config.max_delay_ms.max(self.config.initial_delay_ms));
        self.persist();

        error!(
            backoff = %self.name,
            failing_for_ms = elapsed,
            next_delay_ms = self.state.current_delay_ms,
            "Failure persisted past backoff window, restarting"
        );
        self.platform.restart()
    }
}

impl<P: Platform, S: CounterStore> RetryPolicy for Backoff<P, S> {
    fn good(&mut self) {
        if self.state.last_failure_ms.is_none() {
            return;
        }

        self.state.current_delay_ms = self.config.initial_delay_ms;
        self.state.last_failure_ms = None;
        self.persist();
        info!(backoff = %self.name, "Recovered, backoff reset");
    }

    fn bad(&mut self) {
        let now = self.platform.now_ms();

        match self.state.last_failure_ms {
            None => {
                self.state.last_failure_ms = Some(now);
                self.persist();
                info!(
                    backoff = %self.name,
                    window_ms = self.state.current_delay_ms,
                    "First failure, retrying"
                );
            }
            Some(since) if now >= since.saturating_add(self.state.current_delay_ms) => {
                self.escalate(since, now)
            }
            Some(since) => {
                debug!(
                    backoff = %self.name,
                    failing_for_ms = now.saturating_sub(since),
                    window_ms = self.state.current_delay_ms,
                    "Still failing, within backoff window"
                );
            }
        }
    }
}

fn delay_key(name: &str) -> String {
    format!("{name}.delay")
}

fn failure_key(name: &str) -> String {
    format!("{name}.failure")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{catch_restart, MemoryStore, MockPlatform};

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 4_000,
        }
    }

    #[test]
    fn test_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay_ms, 120_000);
        assert_eq!(config.max_delay_ms, 3_600_000);
    }

    #[test]
    fn test_first_bad_only_records_failure() {
        let platform = MockPlatform::new();
        platform.set_time(500);
        let mut backoff = Backoff::new("net", config(), platform.clone(), MemoryStore::new());

        backoff.bad();

        assert_eq!(backoff.state().last_failure_ms, Some(500));
        assert_eq!(backoff.state().current_delay_ms, 1_000);
        assert_eq!(backoff.store().read("net.failure"), Some(500));
    }

    #[test]
    fn test_bad_within_window_does_not_restart() {
        let platform = MockPlatform::new();
        let mut backoff = Backoff::new("net", config(), platform.clone(), MemoryStore::new());

        backoff.bad();
        platform.set_time(999);
        assert!(catch_restart(|| backoff.bad()).is_ok());
        assert_eq!(backoff.remaining_ms(), Some(1));
    }

    #[test]
    fn test_bad_at_deadline_doubles_and_restarts() {
        let platform = MockPlatform::new();
        let store = MemoryStore::new();
        let mut backoff = Backoff::new("net", config(), platform.clone(), store.clone());

        backoff.bad();
        platform.set_time(1_000);
        let restart = catch_restart(|| backoff.bad()).unwrap_err();

        assert_eq!(restart.at_ms, 1_000);
        assert_eq!(store.read("net.delay"), Some(2_000));
    }

    #[test]
    fn test_delay_is_capped() {
        let platform = MockPlatform::new();
        let store = MemoryStore::new();
        store.clone().write("net.delay", 4_000).unwrap();
        let mut backoff = Backoff::new("net", config(), platform.clone(), store.clone());

        backoff.bad();
        platform.advance(4_000);
        assert!(catch_restart(|| backoff.bad()).is_err());
        assert_eq!(store.read("net.delay"), Some(4_000));
    }

    #[test]
    fn test_good_resets_delay_and_failure() {
        let platform = MockPlatform::new();
        let store = MemoryStore::new();
        store.clone().write("net.delay", 4_000).unwrap();
        let mut backoff = Backoff::new("net", config(), platform.clone(), store.clone());

        backoff.bad();
        backoff.good();

        assert_eq!(backoff.state().current_delay_ms, 1_000);
        assert_eq!(backoff.state().last_failure_ms, None);
        assert_eq!(store.read("net.delay"), Some(1_000));
        assert_eq!(store.read("net.failure"), None);
    }

    #[test]
    fn test_good_without_failure_does_not_touch_store() {
        let platform = MockPlatform::new();
        let store = MemoryStore::new();
        let mut backoff = Backoff::new("net", config(), platform, store.clone());

        backoff.good();

        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_failure_recorded_before_reboot_is_reanchored() {
        let store = MemoryStore::new();
        store.clone().write("net.failure", 50_000).unwrap();
        let platform = MockPlatform::new();
        platform.set_time(10);

        let backoff = Backoff::new("net", config(), platform, store);

        assert_eq!(backoff.state().last_failure_ms, Some(10));
    }

    #[test]
    fn test_out_of_range_persisted_delay_is_clamped() {
        let store = MemoryStore::new();
        store.clone().write("net.delay", 99_000).unwrap();

        let backoff = Backoff::new("net", config(), MockPlatform::new(), store);

        assert_eq!(backoff.state().current_delay_ms, 4_000);
    }
}
