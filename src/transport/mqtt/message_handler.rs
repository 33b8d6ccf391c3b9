//! Pure routing of rumqttc events
//!
//! The I/O side only polls the event loop; what an event means for the
//! transport is decided here.

use crate::protocol::Message;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::v5::{ConnectionError, Event, StateError};
use rumqttc::Outgoing;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received; `refusal` carries the reason code when it is not a success
    ConnectionAcknowledged { refusal: Option<String> },
    /// Message received on a subscribed topic
    MessageReceived(Message),
    /// SubAck received; `refusal` carries the first failing reason code
    SubscriptionAcknowledged { pkid: u16, refusal: Option<String> },
    /// A Subscribe packet with this packet id went out
    SubscribeSent(u16),
    /// Our Disconnect packet went out
    DisconnectSent,
    /// The broker closed the session
    Disconnected,
    /// Infrastructure event (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Route an MQTT event to its handling (pure routing decision)
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                refusal: match &connack.code {
                    ConnectReturnCode::Success => None,
                    code => Some(format!("{code:?}")),
                },
            },
            Packet::Publish(publish) => EventRoute::MessageReceived(Message::new(
                String::from_utf8_lossy(&publish.topic).to_string(),
                publish.payload.clone(),
                publish.retain,
            )),
            Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                pkid: suback.pkid,
                refusal: suback
                    .return_codes
                    .iter()
                    .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                    .map(|code| format!("{code:?}")),
            },
            Packet::Disconnect(_) => EventRoute::Disconnected,
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent(*pkid),
        Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Reason code of a SubAck refusal, when that is what ended the session.
///
/// rumqttc reports a refused SubAck as a poll error and closes the session
/// instead of yielding the packet.
pub fn subscribe_refusal(error: &ConnectionError) -> Option<String> {
    match error {
        ConnectionError::MqttState(StateError::SubFail { reason }) => Some(format!("{reason:?}")),
        _ => None,
    }
}
