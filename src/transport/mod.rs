//! Pub/sub transport abstraction
//!
//! The client drives a [`Transport`] from its tick: one connection at a time,
//! exact-topic subscriptions, and a `pump` that hands back whatever arrived since
//! the previous call. Wire framing lives entirely behind this trait.

use crate::protocol::Message;

pub mod mqtt;

/// Everything needed to open one connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub client_id: &'a str,
    /// Message the broker publishes on our behalf after an unclean disconnect
    pub will: Option<&'a Message>,
}

pub trait Transport {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a connection, replacing any previous one
    fn connect(&mut self, params: &ConnectParams<'_>) -> Result<(), Self::Error>;

    /// Close the connection cleanly (the will is not published)
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    fn publish(&mut self, message: &Message) -> Result<(), Self::Error>;

    /// Drive I/O and return the messages received since the previous call
    fn pump(&mut self) -> Vec<Message>;

    /// Topics whose subscription was accepted locally but later refused by the
    /// broker, collected since the previous call
    fn take_rejected_subscriptions(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
