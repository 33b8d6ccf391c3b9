//! Testing utilities and mock implementations
//!
//! Mock platform, store, retry policy and an in-memory broker for driving the
//! client without a network or a device.

pub mod mocks;

pub use mocks::*;
