//! Impure I/O for the MQTT transport
//!
//! rumqttc is async; the client core is a synchronous tick loop. The transport owns
//! a private current-thread tokio runtime. After ConnAck the event loop moves into
//! a task on that runtime, and `pump` waits on the channel the task feeds. The
//! task only makes progress inside `connect`, `pump` and `disconnect`, so nothing
//! runs between ticks, and no in-flight `EventLoop::poll` is ever cancelled.

use super::connection::{configure_mqtt_options, MqttError, MqttSettings};
use super::message_handler::{route_event, subscribe_refusal, EventRoute};
use crate::protocol::Message;
use crate::transport::{ConnectParams, Transport};
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Request channel capacity between `AsyncClient` and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// What the event loop task hands to `pump`
#[derive(Debug)]
enum Polled {
    Route(EventRoute),
    /// The session ended; the task stops after sending this
    Failed {
        error: String,
        refused_subscribe: Option<String>,
    },
}

/// Poll the event loop until the session fails or the transport stops listening
async fn drive_event_loop(mut event_loop: EventLoop, events: mpsc::UnboundedSender<Polled>) {
    loop {
        let polled = match event_loop.poll().await {
            Ok(event) => Polled::Route(route_event(&event)),
            Err(e) => Polled::Failed {
                refused_subscribe: subscribe_refusal(&e),
                error: e.to_string(),
            },
        };

        // reconnecting is the client's decision, not rumqttc's
        let failed = matches!(polled, Polled::Failed { .. });
        if events.send(polled).is_err() || failed {
            break;
        }
    }
}

/// Maps subscribe requests to packet ids so a SubAck can be traced to its topic.
///
/// Requests reach the event loop in call order, so each outgoing Subscribe
/// belongs to the oldest queued topic.
#[derive(Debug, Default)]
struct SubscribeTracker {
    queued: VecDeque<String>,
    in_flight: VecDeque<(u16, String)>,
}

impl SubscribeTracker {
    fn requested(&mut self, topic: &str) {
        self.queued.push_back(topic.to_string());
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(topic) = self.queued.pop_front() {
            self.in_flight.push_back((pkid, topic));
        }
    }

    fn acknowledged(&mut self, pkid: u16) -> Option<String> {
        let index = self.in_flight.iter().position(|(id, _)| *id == pkid)?;
        self.in_flight.remove(index).map(|(_, topic)| topic)
    }

    /// The topic a refusal without a packet id most likely belongs to
    fn oldest_in_flight(&mut self) -> Option<String> {
        self.in_flight.pop_front().map(|(_, topic)| topic)
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

/// MQTT v5 transport over rumqttc
pub struct MqttTransport {
    runtime: Runtime,
    settings: MqttSettings,
    client: Option<AsyncClient>,
    events: Option<mpsc::UnboundedReceiver<Polled>>,
    event_loop_handle: Option<JoinHandle<()>>,
    subscribes: SubscribeTracker,
    rejected: Vec<String>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Result<Self, MqttError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(MqttError::Runtime)?;

        Ok(Self {
            runtime,
            settings,
            client: None,
            events: None,
            event_loop_handle: None,
            subscribes: SubscribeTracker::default(),
            rejected: Vec::new(),
        })
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    /// Poll until ConnAck; any other outcome is a failed attempt
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), MqttError> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;

            match route_event(&event) {
                EventRoute::ConnectionAcknowledged { refusal: None } => return Ok(()),
                EventRoute::ConnectionAcknowledged {
                    refusal: Some(reason),
                } => return Err(MqttError::Refused(reason)),
                route => trace!(?route, "Event before ConnAck"),
            }
        }
    }

    fn reject_subscription(&mut self, topic: Option<String>, reason: &str) {
        match topic {
            Some(topic) => {
                warn!(topic = %topic, reason, "Broker refused subscription");
                self.rejected.push(topic);
            }
            None => warn!(reason, "Broker refused an untracked subscription"),
        }
    }

    fn drop_connection(&mut self) {
        self.client = None;
        self.events = None;
        self.subscribes.clear();

        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
            // let the runtime release the task and its socket now
            if let Err(e) = self.runtime.block_on(handle) {
                trace!(error = %e, "Event loop task ended");
            }
        }
    }
}

impl Transport for MqttTransport {
    type Error = MqttError;

    fn connect(&mut self, params: &ConnectParams<'_>) -> Result<(), Self::Error> {
        self.disconnect();
        self.rejected.clear();

        let options = configure_mqtt_options(params, &self.settings);
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        debug!(host = params.host, port = params.port, ?timeout, "Connecting");

        let result = self.runtime.block_on(tokio::time::timeout(
            timeout,
            Self::wait_for_connack(&mut event_loop),
        ));

        match result {
            Ok(Ok(())) => {
                info!(host = params.host, port = params.port, "ConnAck received");
                let (sender, receiver) = mpsc::unbounded_channel();
                self.event_loop_handle = Some(self.runtime.spawn(drive_event_loop(event_loop, sender)));
                self.client = Some(client);
                self.events = Some(receiver);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::ConnAckTimeout(timeout)),
        }
    }

    fn disconnect(&mut self) {
        let (Some(client), Some(mut events)) = (self.client.take(), self.events.take()) else {
            self.drop_connection();
            return;
        };

        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "Disconnect request not queued");
            self.drop_connection();
            return;
        }

        // flush the Disconnect packet so the broker does not publish our will
        let timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        let flushed = self.runtime.block_on(tokio::time::timeout(timeout, async {
            while let Some(polled) = events.recv().await {
                if matches!(
                    polled,
                    Polled::Route(EventRoute::DisconnectSent) | Polled::Failed { .. }
                ) {
                    break;
                }
            }
        }));

        if flushed.is_err() {
            warn!("Timed out flushing disconnect");
        }
        self.drop_connection();
        debug!("Disconnected");
    }

    fn is_connected(&self) -> bool {
        self.events.is_some()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        let client = self.client.as_ref().ok_or(MqttError::NotConnected)?;
        client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        self.subscribes.requested(topic);
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        let client = self.client.as_ref().ok_or(MqttError::NotConnected)?;
        client
            .try_unsubscribe(topic)
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    fn publish(&mut self, message: &Message) -> Result<(), Self::Error> {
        let client = self.client.as_ref().ok_or(MqttError::NotConnected)?;
        client
            .try_publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                message.retain,
                message.payload.to_vec(),
            )
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    fn pump(&mut self) -> Vec<Message> {
        let mut received = Vec::new();
        let poll_timeout = Duration::from_millis(self.settings.poll_timeout_ms);
        let mut lost = false;

        for _ in 0..self.settings.max_events_per_pump {
            let Some(events) = self.events.as_mut() else {
                break;
            };
            // only the channel receive is cut short, never the event loop poll
            let polled = self
                .runtime
                .block_on(tokio::time::timeout(poll_timeout, events.recv()));

            match polled {
                // idle
                Err(_) => break,
                Ok(None) => {
                    warn!("MQTT event loop stopped");
                    lost = true;
                    break;
                }
                Ok(Some(Polled::Route(route))) => match route {
                    EventRoute::MessageReceived(message) => received.push(message),
                    EventRoute::SubscribeSent(pkid) => self.subscribes.sent(pkid),
                    EventRoute::SubscriptionAcknowledged { pkid, refusal } => {
                        let topic = self.subscribes.acknowledged(pkid);
                        if let Some(reason) = refusal {
                            self.reject_subscription(topic, &reason);
                        }
                    }
                    EventRoute::Disconnected => {
                        warn!("Broker closed the session");
                        lost = true;
                        break;
                    }
                    route => trace!(?route, "MQTT event"),
                },
                Ok(Some(Polled::Failed {
                    error,
                    refused_subscribe,
                })) => {
                    if let Some(reason) = refused_subscribe {
                        let topic = self.subscribes.oldest_in_flight();
                        self.reject_subscription(topic, &reason);
                    }
                    warn!(error = %error, "MQTT connection error");
                    lost = true;
                    break;
                }
            }
        }

        if lost {
            self.drop_connection();
        }
        received
    }

    fn take_rejected_subscriptions(&mut self) -> Vec<String> {
        std::mem::take(&mut self.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transport_is_disconnected() {
        let mut transport = MqttTransport::new(MqttSettings::default()).unwrap();

        assert!(!transport.is_connected());
        assert!(transport.pump().is_empty());
        assert!(transport.take_rejected_subscriptions().is_empty());
    }

    #[test]
    fn test_operations_fail_without_connection() {
        let mut transport = MqttTransport::new(MqttSettings::default()).unwrap();

        assert!(matches!(
            transport.subscribe("ava"),
            Err(MqttError::NotConnected)
        ));
        assert!(matches!(
            transport.unsubscribe("ava"),
            Err(MqttError::NotConnected)
        ));
        assert!(matches!(
            transport.publish(&Message::availability("ava", true)),
            Err(MqttError::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_without_connection() {
        let mut transport = MqttTransport::new(MqttSettings::default()).unwrap();
        transport.disconnect();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_connect_to_closed_port_fails() {
        let settings = MqttSettings {
            connect_timeout_ms: 500,
            ..MqttSettings::default()
        };
        let mut transport = MqttTransport::new(settings).unwrap();
        let params = ConnectParams {
            host: "127.0.0.1",
            port: 1,
            username: None,
            password: None,
            client_id: "dev1-02:00:00:00:00:01",
            will: None,
        };

        assert!(transport.connect(&params).is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_subscribe_tracker_pairs_packet_ids_in_request_order() {
        let mut tracker = SubscribeTracker::default();
        tracker.requested("ava");
        tracker.requested("status");

        tracker.sent(1);
        tracker.sent(2);

        assert_eq!(tracker.acknowledged(2).as_deref(), Some("status"));
        assert_eq!(tracker.acknowledged(2), None);
        assert_eq!(tracker.acknowledged(1).as_deref(), Some("ava"));
    }

    #[test]
    fn test_subscribe_tracker_blames_oldest_unacknowledged_topic() {
        let mut tracker = SubscribeTracker::default();
        for topic in ["ava", "status", "home/dev1/set"] {
            tracker.requested(topic);
        }
        tracker.sent(10);
        tracker.sent(11);
        tracker.acknowledged(10);

        assert_eq!(tracker.oldest_in_flight().as_deref(), Some("status"));
        assert_eq!(tracker.oldest_in_flight(), None);

        // the third request was still queued
        tracker.sent(12);
        assert_eq!(tracker.oldest_in_flight().as_deref(), Some("home/dev1/set"));
    }

    #[test]
    fn test_subscribe_tracker_ignores_unrequested_packets() {
        let mut tracker = SubscribeTracker::default();
        tracker.sent(5);

        assert_eq!(tracker.acknowledged(5), None);
        assert_eq!(tracker.oldest_in_flight(), None);

        tracker.requested("ava");
        tracker.clear();
        tracker.sent(6);
        assert_eq!(tracker.acknowledged(6), None);
    }
}
