//! Application subscriptions, replayed on every reconnect

use crate::protocol::Message;
use tracing::debug;

/// Callback invoked for each message on a subscribed topic
pub type MessageCallback = Box<dyn FnMut(&Message)>;

pub struct Subscription {
    topic: String,
    callback: MessageCallback,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Ordered (topic, callback) list with exact-match dispatch
#[derive(Default)]
pub struct SubscriptionList {
    entries: Vec<Subscription>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`.
    ///
    /// Registering a topic twice replaces the callback and keeps the original
    /// position. Returns true when the topic is new.
    pub fn add(&mut self, topic: &str, callback: MessageCallback) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|s| s.topic == topic) {
            debug!(topic, "Replacing subscription callback");
            existing.callback = callback;
            return false;
        }

        self.entries.push(Subscription {
            topic: topic.to_string(),
            callback,
        });
        true
    }

    /// Returns true when the topic was registered
    pub fn remove(&mut self, topic: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.topic != topic);
        self.entries.len() != before
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.iter().any(|s| s.topic == topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|s| s.topic.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand `message` to the callback registered for its topic.
    ///
    /// Returns false when no subscription matches.
    pub fn dispatch(&mut self, message: &Message) -> bool {
        match self.entries.iter_mut().find(|s| s.topic == message.topic) {
            Some(subscription) => {
                (subscription.callback)(message);
                true
            }
            None => false,
        }
    }
}
