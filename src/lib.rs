//! homenode - connectivity and identity client for home-automation nodes
//!
//! # Overview
//!
//! A node keeps one connection to a pub/sub broker and, before it emits anything
//! under its configured name, makes sure no other live device already holds that
//! name. This crate provides:
//! - The tick-driven [`Client`] with its anti-collision negotiation and heartbeat
//! - [`Backoff`], the retry-then-restart policy persisted across reboots
//! - An MQTT v5 [`Transport`](transport::Transport) built on rumqttc
//! - Host implementations of the platform capabilities and a file-backed store
//! - In-memory mocks for driving all of the above in tests
//!
//! # Quick Start
//!
//! ```rust
//! use homenode::client::{Client, ClientConfig, ConnectionState, ServerConfig};
//! use homenode::protocol::{DeviceIdentity, MacAddress};
//! use homenode::testing::{MockBroker, MockPlatform, RecordingRetryPolicy};
//!
//! let broker = MockBroker::new();
//! let platform = MockPlatform::new();
//! let identity = DeviceIdentity::new("dev1", MacAddress::new([2, 0, 0, 0, 0, 1])).unwrap();
//! let config = ClientConfig::new(vec![ServerConfig::new("broker", 1883)])
//!     .with_topics(Some("ava"), Some("status"));
//!
//! let mut client = Client::new(
//!     identity,
//!     config,
//!     broker.transport(),
//!     RecordingRetryPolicy::new(),
//!     platform.clone(),
//! );
//!
//! client.tick();
//! platform.set_time(2_000);
//! client.tick();
//! assert_eq!(client.state(), ConnectionState::Active);
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod platform;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig, RetryPolicy};
pub use client::{Client, ClientConfig, ConnectionState, PublishError};
pub use config::{ConfigError, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use protocol::{DeviceIdentity, MacAddress, Message};
