//! Topic-addressed pub/sub bus.
//!
//! Delivers broadcast events ("DB changed for table T") to every worker;
//! each worker filters locally by its own subscriptions. In a single
//! process this is an in-process channel fabric; a multi-worker
//! deployment swaps in a message-bus backend behind the same surface.
//!
//! Ordering guarantee: per topic and per publisher, messages reach a
//! given subscriber in publish order. Across topics there is no ordering.
//! A subscriber that falls too far behind skips the overwritten messages
//! rather than stalling publishers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Default per-topic channel capacity.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Well-known topics.
pub mod topics {
    /// Database change notifications.
    pub const DB_EVENT: &str = "dbevent";
    /// Whole-system announcements.
    pub const SYSTEM_BROADCAST: &str = "system.broadcast";

    /// Per-user notification topic.
    pub fn user_notify(user_id: &str) -> String {
        format!("user.{user_id}.notify")
    }
}

/// One published message.
#[derive(Clone, Debug)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// In-process topic bus. `Clone` shares the underlying topic table.
#[derive(Clone)]
pub struct TopicBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Event>>>>,
    capacity: usize,
}

impl TopicBus {
    pub fn new() -> TopicBus {
        TopicBus::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Bus with a custom per-topic buffer. When a subscriber lags past the
    /// buffer, it loses the overwritten messages (see [`Subscription::recv`]).
    pub fn with_capacity(capacity: usize) -> TopicBus {
        TopicBus {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    async fn channel(&self, topic: &str) -> broadcast::Sender<Event> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(topic) {
                return sender.clone();
            }
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a topic; only events published afterwards are seen.
    pub async fn subscribe(&self, topic: &str) -> Subscription {
        let sender = self.channel(topic).await;
        Subscription {
            topic: topic.to_string(),
            rx: sender.subscribe(),
        }
    }

    /// Publish to a topic. Returns how many subscribers the bus handed the
    /// event to; zero (and the event is dropped) when nobody listens.
    pub async fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        let sender = self.channel(topic).await;
        sender
            .send(Event {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0)
    }

    /// Drop topic entries nobody subscribes to anymore.
    pub async fn prune(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver end of one topic subscription.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the bus side is gone. A lagged
    /// subscriber skips what it missed and keeps going.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(topic = %self.topic, missed, "subscriber lagged");
                    continue;
                }
            }
        }
    }

    /// Non-blocking variant used by drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
