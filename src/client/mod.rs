//! Connectivity & identity client
//!
//! The client owns the transport connection and decides, tick by tick, whether the
//! device may speak on the bus under its configured name.
//!
//! # Lifecycle
//!
//! ```text
//! disconnected -> connecting -> negotiating -> active
//!       ^                            |            |
//!       +------ collision / lost ----+------------+
//! ```
//!
//! - [`connection`] - broker candidates, retry schedule, composite state
//! - [`negotiation`] - the pure anti-collision decision table
//! - [`heartbeat`] - heartbeat grid and tick-latency telemetry
//! - [`subscriptions`] - application subscriptions, replayed on reconnect
//!
//! Everything advances inside [`Client::tick`]; there is no background task.

pub mod connection;
pub mod heartbeat;
pub mod negotiation;
pub mod subscriptions;

pub use connection::{ConnectOutcome, ConnectionState, ReconnectConfig, RetrySchedule, ServerConfig};
pub use heartbeat::{CycleStats, CycleSummary, HeartbeatSchedule};
pub use negotiation::{resolve, Negotiation, NegotiationEvent, NegotiationState, Resolution};
pub use subscriptions::{MessageCallback, SubscriptionList};

use crate::backoff::RetryPolicy;
use crate::platform::Platform;
use crate::protocol::{parse_availability, DeviceIdentity, Message, StatusIdentity, StatusPayload};
use crate::transport::{ConnectParams, Transport};
use crate::{connection_span, negotiation_span};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default time to listen for a competing device before claiming the name
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 2_000;

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;

/// Runtime configuration of the client, resolved by the config loader
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Candidate brokers, tried in order
    pub servers: Vec<ServerConfig>,
    /// Retained `"1"`/`"0"` topic; `None` disables negotiation entirely
    pub availability_topic: Option<String>,
    /// Retained status topic; `None` disables status publishing
    pub status_topic: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers,
            availability_topic: None,
            status_topic: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT_MS,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_topics(mut self, availability: Option<&str>, status: Option<&str>) -> Self {
        self.availability_topic = availability.filter(|t| !t.is_empty()).map(str::to_string);
        self.status_topic = status.filter(|t| !t.is_empty()).map(str::to_string);
        self
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Not initialized - name negotiation has not completed")]
    NotInitialized,
    #[error("Transport rejected publish")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub struct Client<T, B, P> {
    identity: DeviceIdentity,
    config: ClientConfig,
    transport: T,
    retry: B,
    platform: P,
    subscriptions: SubscriptionList,
    reconnect_hooks: Vec<Box<dyn FnMut()>>,
    negotiation: Negotiation,
    schedule: RetrySchedule,
    heartbeat: HeartbeatSchedule,
    stats: CycleStats,
    connected: bool,
    announced: bool,
}

impl<T, B, P> Client<T, B, P>
where
    T: Transport,
    B: RetryPolicy,
    P: Platform,
{
    pub fn new(
        identity: DeviceIdentity,
        config: ClientConfig,
        transport: T,
        retry: B,
        platform: P,
    ) -> Self {
        let now = platform.now_ms();
        let schedule = RetrySchedule::new(config.reconnect.clone());
        let heartbeat = HeartbeatSchedule::new(config.heartbeat_interval_ms);

        Self {
            identity,
            config,
            transport,
            retry,
            platform,
            subscriptions: SubscriptionList::new(),
            reconnect_hooks: Vec::new(),
            negotiation: Negotiation::new(),
            schedule,
            heartbeat,
            stats: CycleStats::new(now),
            connected: false,
            announced: false,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn retry_policy(&self) -> &B {
        &self.retry
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn negotiation_deadline_ms(&self) -> Option<u64> {
        self.negotiation.deadline_ms()
    }

    /// Whether the name is claimed and application traffic is allowed
    pub fn is_initialized(&self) -> bool {
        self.negotiation.is_done()
    }

    pub fn state(&self) -> ConnectionState {
        if !self.transport.is_connected() {
            ConnectionState::Disconnected {
                next_attempt_ms: self.schedule.next_attempt_ms(),
            }
        } else if self.negotiation.is_done() {
            ConnectionState::Active
        } else {
            ConnectionState::Negotiating(self.negotiation.state())
        }
    }

    pub fn next_heartbeat_ms(&self) -> u64 {
        self.heartbeat.next_due_ms()
    }

    pub fn cycle_stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Run `hook` each time the client becomes active after a (re)connect
    pub fn on_reconnect(&mut self, hook: impl FnMut() + 'static) {
        self.reconnect_hooks.push(Box::new(hook));
    }

    /// Advance the client by one step
    pub fn tick(&mut self) {
        let now = self.platform.now_ms();
        self.stats.record_tick(now);

        if self.schedule.is_due(now) {
            let mut outcome = self.connect_and_negotiate(now);
            if outcome == ConnectOutcome::Connecting {
                self.retry.good();
                outcome = self.settle_negotiation(now);
            }

            match outcome {
                ConnectOutcome::Connecting | ConnectOutcome::Rejected => {}
                ConnectOutcome::ConnectionFailed => {
                    self.retry.bad();
                    let delay = self.schedule.record_failure(now);
                    warn!(
                        device = %self.identity.name(),
                        retry_in_ms = delay,
                        failures = self.schedule.failures(),
                        "No broker accepted the connection"
                    );
                }
                ConnectOutcome::ConnectionSuccessful => {
                    self.retry.good();
                    self.on_connection_successful(now);
                }
            }
        }

        self.pump();
    }

    /// Publish application data. Dropped until the name is claimed.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.is_initialized() {
            warn!(topic, "Dropping publish, device not initialized");
            return Err(PublishError::NotInitialized);
        }

        let message = Message::new(topic, payload, retain);
        self.transport.publish(&message).map_err(|e| {
            warn!(topic, error = %e, "Publish failed");
            PublishError::Transport(Box::new(e))
        })
    }

    /// Register `callback` for messages on `topic` (exact match)
    pub fn subscribe(&mut self, topic: &str, callback: impl FnMut(&Message) + 'static) {
        self.subscriptions.add(topic, Box::new(callback));

        if self.transport.is_connected() {
            if let Err(e) = self.transport.subscribe(topic) {
                warn!(topic, error = %e, "Subscribe failed, will retry on reconnect");
            }
        }
    }

    /// Whether a callback is registered for `topic`
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        if !self.subscriptions.remove(topic) {
            debug!(topic, "Unsubscribe for unknown topic");
            return;
        }

        if self.transport.is_connected() {
            if let Err(e) = self.transport.unsubscribe(topic) {
                warn!(topic, error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Announce departure (when active) and close the connection cleanly
    pub fn shutdown(&mut self) {
        if self.transport.is_connected() {
            if let (true, Some(topic)) = (self.is_initialized(), self.config.availability_topic.as_deref()) {
                let message = Message::availability(topic, false);
                if let Err(e) = self.transport.publish(&message) {
                    warn!(topic, error = %e, "Failed to announce departure");
                }
                // flush the announcement before the socket goes away
                for message in self.transport.pump() {
                    debug!(topic = %message.topic, "Discarding message received during shutdown");
                }
            }
            self.transport.disconnect();
        }

        self.mark_disconnected();
        info!(device = %self.identity.name(), "Client shut down");
    }

    fn connect_and_negotiate(&mut self, now: u64) -> ConnectOutcome {
        if !self.transport.is_connected() {
            if self.connected {
                warn!(device = %self.identity.name(), "Connection lost");
                self.mark_disconnected();
            }

            if !self.establish(now) {
                return ConnectOutcome::ConnectionFailed;
            }
        }

        if self.negotiation.is_done() {
            ConnectOutcome::ConnectionSuccessful
        } else {
            ConnectOutcome::Connecting
        }
    }

    /// Handle queued negotiation traffic, then apply the optimistic deadline.
    ///
    /// A rival's availability and status already waiting in the queue must be
    /// seen before the deadline can claim the name.
    fn settle_negotiation(&mut self, now: u64) -> ConnectOutcome {
        self.pump();
        if !self.transport.is_connected() {
            return ConnectOutcome::Rejected;
        }

        if self.negotiation.deadline_elapsed(now) {
            self.negotiate(NegotiationEvent::DeadlineElapsed, now);
        }

        if self.negotiation.is_done() {
            ConnectOutcome::ConnectionSuccessful
        } else {
            ConnectOutcome::Connecting
        }
    }

    /// Open a transport connection to the first accepting server and start
    /// negotiating. Returns false when nothing usable came up.
    fn establish(&mut self, now: u64) -> bool {
        let _span = connection_span!(device = %self.identity.name()).entered();

        let client_id = self.identity.client_id();
        let will = self
            .config
            .availability_topic
            .as_deref()
            .map(|topic| Message::availability(topic, false));

        let mut connected_to = None;
        for server in &self.config.servers {
            let params = ConnectParams {
                host: &server.address,
                port: server.port,
                username: server.username.as_deref(),
                password: server.password.as_deref(),
                client_id: &client_id,
                will: will.as_ref(),
            };

            match self.transport.connect(&params) {
                Ok(()) => {
                    connected_to = Some(format!("{}:{}", server.address, server.port));
                    break;
                }
                Err(e) => {
                    warn!(server = %server.address, port = server.port, error = %e, "Connect failed");
                }
            }
        }

        let Some(server) = connected_to else {
            return false;
        };
        info!(server = %server, client_id = %client_id, "Transport connected");

        if let Some(availability) = self.config.availability_topic.clone() {
            let topics = std::iter::once(availability).chain(self.config.status_topic.clone());
            for topic in topics {
                if let Err(e) = self.transport.subscribe(&topic) {
                    error!(topic = %topic, error = %e, "Negotiation subscribe failed, dropping connection");
                    self.transport.disconnect();
                    return false;
                }
            }
            self.negotiation.begin(now, self.config.negotiation_timeout_ms);
        } else {
            self.negotiation.complete();
        }

        for topic in self.subscriptions.topics() {
            if let Err(e) = self.transport.subscribe(topic) {
                warn!(topic, error = %e, "Resubscribe failed");
            }
        }

        self.connected = true;
        true
    }

    fn on_connection_successful(&mut self, now: u64) {
        if self.announced {
            if self.heartbeat.fire(now) {
                self.send_heartbeat(now, false);
            }
            return;
        }

        self.announced = true;
        info!(device = %self.identity.name(), "Device active on bus");

        for hook in &mut self.reconnect_hooks {
            hook();
        }

        self.heartbeat.reset(now);
        self.heartbeat.fire(now);
        self.send_heartbeat(now, true);
        self.schedule.reset();
    }

    fn pump(&mut self) {
        for message in self.transport.pump() {
            if !self.transport.is_connected() {
                debug!(topic = %message.topic, "Dropping message from closed connection");
                continue;
            }
            self.handle_message(message);
        }

        for topic in self.transport.take_rejected_subscriptions() {
            if self.is_negotiation_topic(&topic) && !self.negotiation.is_done() {
                error!(topic = %topic, "Broker refused negotiation subscribe, dropping connection");
                self.abandon_connection(self.platform.now_ms());
                return;
            }
            // replaying it after a reconnect would only be refused again
            if self.subscriptions.remove(&topic) {
                warn!(topic = %topic, "Broker refused subscribe, subscription dropped");
            } else {
                warn!(topic = %topic, "Broker refused subscribe");
            }
        }
    }

    fn is_negotiation_topic(&self, topic: &str) -> bool {
        self.config.availability_topic.as_deref() == Some(topic)
            || self.config.status_topic.as_deref() == Some(topic)
    }

    fn handle_message(&mut self, message: Message) {
        let now = self.platform.now_ms();

        if self.config.availability_topic.as_deref() == Some(message.topic.as_str()) {
            match parse_availability(&message.payload) {
                Some(available) => self.negotiate(NegotiationEvent::Availability(available), now),
                None => warn!(topic = %message.topic, "Malformed availability payload dropped"),
            }
            return;
        }

        if self.config.status_topic.as_deref() == Some(message.topic.as_str()) {
            match StatusIdentity::parse(&message.payload) {
                Ok(status) => {
                    let own = self.identity.is_own_mac(&status.mac);
                    self.negotiate(NegotiationEvent::Status { own }, now);
                }
                Err(e) => warn!(topic = %message.topic, error = %e, "Malformed status payload dropped"),
            }
            return;
        }

        if !self.subscriptions.dispatch(&message) {
            debug!(topic = %message.topic, "No subscription for topic, message dropped");
        }
    }

    fn negotiate(&mut self, event: NegotiationEvent, now: u64) {
        let _span = negotiation_span!(device = %self.identity.name()).entered();
        let state = self.negotiation.state();
        let status_topic = self.config.status_topic.is_some();

        match resolve(state, event, status_topic) {
            Resolution::Ignore => {
                debug!(?state, ?event, "Negotiation event ignored");
            }
            Resolution::Advance(next) => {
                info!(?state, ?event, ?next, "Negotiation advanced");
                self.negotiation.advance(next);
            }
            Resolution::Succeed => {
                info!(?state, ?event, "Name claimed");
                self.negotiation.complete();
            }
            Resolution::Refresh => {
                info!(?event, "Re-asserting name");
                self.send_heartbeat(now, false);
            }
            Resolution::Fail => {
                error!(
                    ?state,
                    ?event,
                    mac = %self.identity.mac_str(),
                    "Another device holds this name, disconnecting"
                );
                self.abandon_connection(now);
            }
        }
    }

    /// Drop the connection and count it as a failed attempt
    fn abandon_connection(&mut self, now: u64) {
        self.transport.disconnect();
        self.mark_disconnected();
        let delay = self.schedule.record_failure(now);
        debug!(retry_in_ms = delay, "Reconnect scheduled");
        self.retry.bad();
    }

    fn mark_disconnected(&mut self) {
        self.connected = false;
        self.announced = false;
        self.negotiation.reset();
    }

    fn send_heartbeat(&mut self, now: u64, restarted: bool) {
        let summary = self.stats.summary(now);

        if let Some(topic) = self.config.availability_topic.as_deref() {
            if let Err(e) = self.transport.publish(&Message::availability(topic, true)) {
                warn!(topic, error = %e, "Heartbeat availability publish failed");
            }
        }

        if let Some(topic) = self.config.status_topic.as_deref() {
            let status = StatusPayload {
                name: self.identity.name().to_string(),
                mac: self.identity.mac_str().to_string(),
                restarted,
                ip: self.platform.network_address(),
                uptime: now,
                free_memory: self.platform.free_memory(),
                avg_cycle_time: summary.avg_cycle_time_ms,
                max_cycle_time: summary.max_cycle_time_ms,
            };

            match status.to_json() {
                Ok(json) => {
                    if let Err(e) = self.transport.publish(&Message::new(topic, json, true)) {
                        warn!(topic, error = %e, "Heartbeat status publish failed");
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode status payload"),
            }
        }

        debug!(
            restarted,
            ticks = summary.tick_count,
            avg_cycle_ms = summary.avg_cycle_time_ms,
            max_cycle_ms = summary.max_cycle_time_ms,
            "Heartbeat sent"
        );
        self.stats.reset(now);
    }
}
