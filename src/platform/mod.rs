//! Platform capabilities consumed by the client
//!
//! Everything the connectivity core needs from the device it runs on: a monotonic
//! clock, a way to restart, memory and network introspection, and a small
//! non-volatile store that survives the restart.

pub mod host;
pub mod store;

pub use host::HostPlatform;
pub use store::{FileStore, StoreError};

/// Clock, restart and introspection primitives of the device.
///
/// Implementations are cheap handles: the composition root clones one handle into
/// every component that needs the clock.
pub trait Platform {
    /// Milliseconds since boot; never goes backwards while the process lives
    fn now_ms(&self) -> u64;

    /// Hard restart of the device. Never returns.
    fn restart(&self) -> !;

    /// Free heap/system memory in bytes
    fn free_memory(&self) -> u64;

    /// Current network address as presented in status payloads
    fn network_address(&self) -> String;
}

/// Non-volatile store for small integers, keyed by name
pub trait CounterStore {
    fn read(&self, key: &str) -> Option<u64>;

    fn write(&mut self, key: &str, value: u64) -> Result<(), StoreError>;

    fn clear(&mut self, key: &str) -> Result<(), StoreError>;
}
