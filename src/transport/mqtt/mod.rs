//! MQTT v5 transport
//!
//! # Architecture
//!
//! - [`connection`] - settings, errors and the pure options mapping
//! - [`message_handler`] - pure routing of rumqttc events
//! - [`client`] - impure I/O: the runtime, the event loop and the [`Transport`] impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use homenode::transport::mqtt::{MqttSettings, MqttTransport};
//! use homenode::transport::{ConnectParams, Transport};
//!
//! let mut transport = MqttTransport::new(MqttSettings::default())?;
//! transport.connect(&ConnectParams {
//!     host: "localhost",
//!     port: 1883,
//!     username: None,
//!     password: None,
//!     client_id: "kitchen-02:00:00:00:00:01",
//!     will: None,
//! })?;
//! for message in transport.pump() {
//!     println!("{} {:?}", message.topic, message.payload);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`Transport`]: crate::transport::Transport

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, MqttError, MqttSettings};
pub use message_handler::{route_event, subscribe_refusal, EventRoute};
