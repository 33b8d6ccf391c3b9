//! Mock implementations for testing
//!
//! Provides an in-memory broker with retained messages and last wills, a transport
//! attached to it, a controllable platform clock and a memory-backed counter store,
//! so the client can be driven tick by tick without a network or a device.

use crate::backoff::RetryPolicy;
use crate::platform::{CounterStore, Platform, StoreError};
use crate::protocol::Message;
use crate::transport::{ConnectParams, Transport};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use thiserror::Error;

/// Panic payload raised by [`MockPlatform::restart`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequested {
    pub at_ms: u64,
}

/// Run `f`, turning a mock restart into an `Err`. Other panics propagate.
pub fn catch_restart<R>(f: impl FnOnce() -> R) -> Result<R, RestartRequested> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<RestartRequested>() {
            Ok(restart) => Err(*restart),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

/// Platform with a manually advanced clock. Clones share the clock.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    now_ms: Rc<Cell<u64>>,
    free_memory: Rc<Cell<u64>>,
    address: Rc<RefCell<String>>,
    restarts: Rc<Cell<u32>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            now_ms: Rc::new(Cell::new(0)),
            free_memory: Rc::new(Cell::new(32_768)),
            address: Rc::new(RefCell::new("192.168.1.50".to_string())),
            restarts: Rc::new(Cell::new(0)),
        }
    }

    pub fn set_time(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms);
    }

    pub fn set_free_memory(&self, bytes: u64) {
        self.free_memory.set(bytes);
    }

    pub fn set_network_address(&self, address: &str) {
        *self.address.borrow_mut() = address.to_string();
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.get()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn restart(&self) -> ! {
        self.restarts.set(self.restarts.get() + 1);
        panic::panic_any(RestartRequested {
            at_ms: self.now_ms.get(),
        })
    }

    fn free_memory(&self) -> u64 {
        self.free_memory.get()
    }

    fn network_address(&self) -> String {
        self.address.borrow().clone()
    }
}

/// Counter store kept in memory. Clones share the values, so a clone taken
/// before a simulated reboot sees what the previous instance persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Rc<RefCell<BTreeMap<String, u64>>>,
    writes: Rc<Cell<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write/clear operations performed so far
    pub fn writes(&self) -> usize {
        self.writes.get()
    }
}

impl CounterStore for MemoryStore {
    fn read(&self, key: &str) -> Option<u64> {
        self.values.borrow().get(key).copied()
    }

    fn write(&mut self, key: &str, value: u64) -> Result<(), StoreError> {
        self.values.borrow_mut().insert(key.to_string(), value);
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }

    fn clear(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.borrow_mut().remove(key);
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }
}

/// Retry policy that only counts calls
#[derive(Debug, Clone, Default)]
pub struct RecordingRetryPolicy {
    good: Rc<Cell<u32>>,
    bad: Rc<Cell<u32>>,
}

impl RecordingRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn good_count(&self) -> u32 {
        self.good.get()
    }

    pub fn bad_count(&self) -> u32 {
        self.bad.get()
    }
}

impl RetryPolicy for RecordingRetryPolicy {
    fn good(&mut self) {
        self.good.set(self.good.get() + 1);
    }

    fn bad(&mut self) {
        self.bad.set(self.bad.get() + 1);
    }
}

#[derive(Debug, Default)]
struct Session {
    connected: bool,
    subscriptions: Vec<String>,
    inbox: VecDeque<Message>,
    will: Option<Message>,
    denied: Vec<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    retained: BTreeMap<String, Message>,
    sessions: BTreeMap<String, Session>,
    refused_hosts: HashSet<String>,
    rejected_subscriptions: HashSet<String>,
    denied_subscriptions: HashSet<String>,
    failing_publishes: bool,
    connect_attempts: Vec<(String, u16)>,
    credentials: Vec<(Option<String>, Option<String>)>,
    published: Vec<(String, Message)>,
}

impl BrokerState {
    fn route(&mut self, message: &Message) {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained.insert(message.topic.clone(), message.clone());
            }
        }

        for session in self.sessions.values_mut() {
            if session.connected && session.subscriptions.iter().any(|t| *t == message.topic) {
                session.inbox.push_back(message.clone());
            }
        }
    }
}

/// In-memory pub/sub broker with retained messages and last wills.
///
/// Handles are cheap clones over shared state. Every client connected through
/// [`MockBroker::transport`] sees the same topics, which makes two-device
/// collision scenarios straightforward to script.
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Rc<RefCell<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// New unconnected transport attached to this broker
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            broker: self.clone(),
            client_id: None,
        }
    }

    pub fn refuse_host(&self, host: &str) {
        self.state.borrow_mut().refused_hosts.insert(host.to_string());
    }

    pub fn accept_host(&self, host: &str) {
        self.state.borrow_mut().refused_hosts.remove(host);
    }

    pub fn reject_subscription(&self, topic: &str) {
        self.state
            .borrow_mut()
            .rejected_subscriptions
            .insert(topic.to_string());
    }

    /// Accept subscribe requests for `topic` but refuse them in the acknowledgement
    pub fn deny_subscription(&self, topic: &str) {
        self.state
            .borrow_mut()
            .denied_subscriptions
            .insert(topic.to_string());
    }

    pub fn set_failing_publishes(&self, failing: bool) {
        self.state.borrow_mut().failing_publishes = failing;
    }

    /// Publish on behalf of a client that is not under test
    pub fn publish_external(&self, message: Message) {
        self.state.borrow_mut().route(&message);
    }

    /// Push `message` straight into a session's inbox, bypassing subscriptions
    pub fn deliver(&self, client_id: &str, message: Message) {
        if let Some(session) = self.state.borrow_mut().sessions.get_mut(client_id) {
            session.inbox.push_back(message);
        }
    }

    /// Simulate an unclean disconnect: the session drops and its will fires
    pub fn drop_connection(&self, client_id: &str) {
        let mut state = self.state.borrow_mut();
        let will = match state.sessions.get_mut(client_id) {
            Some(session) if session.connected => {
                session.connected = false;
                session.inbox.clear();
                session.will.take()
            }
            _ => None,
        };

        if let Some(will) = will {
            state.route(&will);
        }
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state
            .borrow()
            .sessions
            .get(client_id)
            .is_some_and(|s| s.connected)
    }

    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.state.borrow().retained.get(topic).cloned()
    }

    /// Subscriptions of the session's current connection, in subscribe order
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.state
            .borrow()
            .sessions
            .get(client_id)
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn last_will(&self, client_id: &str) -> Option<Message> {
        self.state
            .borrow()
            .sessions
            .get(client_id)
            .and_then(|s| s.will.clone())
    }

    pub fn connect_attempts(&self) -> Vec<(String, u16)> {
        self.state.borrow().connect_attempts.clone()
    }

    /// (username, password) presented on each accepted connect
    pub fn credentials(&self) -> Vec<(Option<String>, Option<String>)> {
        self.state.borrow().credentials.clone()
    }

    /// Everything published by clients, in order
    pub fn published(&self) -> Vec<Message> {
        self.state
            .borrow()
            .published
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn published_by(&self, client_id: &str) -> Vec<Message> {
        self.state
            .borrow()
            .published
            .iter()
            .filter(|(id, _)| id == client_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Message> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Topics with a retained message
    pub fn retained_topics(&self) -> BTreeSet<String> {
        self.state.borrow().retained.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockTransportError {
    #[error("Connection refused by {host}:{port}")]
    Refused { host: String, port: u16 },
    #[error("Not connected")]
    NotConnected,
    #[error("Subscription to {0} rejected")]
    SubscriptionRejected(String),
    #[error("Publish to {0} failed")]
    PublishFailed(String),
}

/// Transport attached to a [`MockBroker`]
#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
    client_id: Option<String>,
}

impl MockTransport {
    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn connected_id(&self) -> Result<&str, MockTransportError> {
        match self.client_id.as_deref() {
            Some(id) if self.broker.is_connected(id) => Ok(id),
            _ => Err(MockTransportError::NotConnected),
        }
    }
}

impl Transport for MockTransport {
    type Error = MockTransportError;

    fn connect(&mut self, params: &ConnectParams<'_>) -> Result<(), Self::Error> {
        self.disconnect();

        let mut state = self.broker.state.borrow_mut();
        state
            .connect_attempts
            .push((params.host.to_string(), params.port));

        if state.refused_hosts.contains(params.host) {
            return Err(MockTransportError::Refused {
                host: params.host.to_string(),
                port: params.port,
            });
        }

        state.credentials.push((
            params.username.map(str::to_string),
            params.password.map(str::to_string),
        ));
        state.sessions.insert(
            params.client_id.to_string(),
            Session {
                connected: true,
                will: params.will.cloned(),
                ..Session::default()
            },
        );
        self.client_id = Some(params.client_id.to_string());
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(id) = self.client_id.take() {
            if let Some(session) = self.broker.state.borrow_mut().sessions.get_mut(&id) {
                session.connected = false;
                session.inbox.clear();
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected_id().is_ok()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        let id = self.connected_id()?.to_string();
        let mut state = self.broker.state.borrow_mut();

        if state.rejected_subscriptions.contains(topic) {
            return Err(MockTransportError::SubscriptionRejected(topic.to_string()));
        }

        if state.denied_subscriptions.contains(topic) {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.denied.push(topic.to_string());
            }
            return Ok(());
        }

        let retained = state.retained.get(topic).cloned();
        if let Some(session) = state.sessions.get_mut(&id) {
            if !session.subscriptions.iter().any(|t| t == topic) {
                session.subscriptions.push(topic.to_string());
            }
            if let Some(message) = retained {
                session.inbox.push_back(message);
            }
        }
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        let id = self.connected_id()?.to_string();
        if let Some(session) = self.broker.state.borrow_mut().sessions.get_mut(&id) {
            session.subscriptions.retain(|t| t != topic);
        }
        Ok(())
    }

    fn publish(&mut self, message: &Message) -> Result<(), Self::Error> {
        let id = self.connected_id()?.to_string();
        let mut state = self.broker.state.borrow_mut();

        if state.failing_publishes {
            return Err(MockTransportError::PublishFailed(message.topic.clone()));
        }

        state.published.push((id, message.clone()));
        state.route(message);
        Ok(())
    }

    fn pump(&mut self) -> Vec<Message> {
        let Ok(id) = self.connected_id().map(str::to_string) else {
            return Vec::new();
        };

        self.broker
            .state
            .borrow_mut()
            .sessions
            .get_mut(&id)
            .map(|s| s.inbox.drain(..).collect())
            .unwrap_or_default()
    }

    fn take_rejected_subscriptions(&mut self) -> Vec<String> {
        let Ok(id) = self.connected_id().map(str::to_string) else {
            return Vec::new();
        };

        self.broker
            .state
            .borrow_mut()
            .sessions
            .get_mut(&id)
            .map(|s| std::mem::take(&mut s.denied))
            .unwrap_or_default()
    }
}
