//! In-process topic pub/sub.
//!
//! Topics follow `team:<team_id>:events:<category>.<action>`. Delivery is
//! at-least-once within the process; per-topic ordering is preserved for a
//! single publisher; subscriber failure never blocks the publisher.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ids::now_iso;
use crate::store::StateStore;

const CHANNEL_CAPACITY: usize = 256;

/// One published event.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub topic: String,
    pub payload: Value,
    pub published_at: String,
}

impl EventEnvelope {
    /// `<category>.<action>` suffix of the topic, or the whole topic when it
    /// does not follow the team grammar.
    pub fn action(&self) -> &str {
        self.topic.rsplit(':').next().unwrap_or(&self.topic)
    }
}

struct PatternSubscriber {
    pattern: String,
    sender: broadcast::Sender<EventEnvelope>,
}

/// Receiving side of a subscription. Dropped receivers are pruned lazily on
/// the next publish to their pattern.
pub struct Subscription {
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl Subscription {
    /// Wait for the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // At-least-once within capacity; a lagging subscriber is
                    // told how much it missed and keeps going.
                    warn!(missed, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used by tests.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<PatternSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every topic matching `pattern`. A `*` segment matches
    /// exactly one segment; `role.*` matches any action in the category.
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        let pattern = pattern.into();
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .unwrap()
            .push(PatternSubscriber { pattern, sender });
        Subscription { receiver }
    }

    /// Publish `payload` on `topic`, fanning out to matching subscribers.
    pub fn publish(&self, topic: &str, payload: Value) {
        let envelope = EventEnvelope {
            topic: topic.to_string(),
            payload,
            published_at: now_iso(),
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| {
            if !topic_matches(&sub.pattern, topic) {
                return true;
            }
            // A send error only means every receiver is gone; drop the entry.
            sub.sender.send(envelope.clone()).is_ok() || sub.sender.receiver_count() > 0
        });
        debug!(topic, "event published");
    }

    /// Publish every committed-but-unpublished event from the store's outbox,
    /// in commit order. This is the only path by which state-mutation events
    /// reach subscribers, which keeps event order aligned with commit order.
    pub fn flush_outbox(&self, store: &StateStore) -> Result<usize> {
        let drained = store.drain_outbox()?;
        let count = drained.len();
        for (topic, payload) in drained {
            self.publish(&topic, payload);
        }
        Ok(count)
    }
}

/// Match a `:`-segmented pattern against a topic. The trailing
/// `<category>.<action>` segment is matched per `.`-part so `role.*` works.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split(':').collect();
    let topic_segments: Vec<&str> = topic.split(':').collect();
    if pattern_segments.len() != topic_segments.len() {
        return false;
    }
    for (p, t) in pattern_segments.iter().zip(topic_segments.iter()) {
        if p == t || *p == "*" {
            continue;
        }
        if p.contains('.') || t.contains('.') {
            let pp: Vec<&str> = p.split('.').collect();
            let tp: Vec<&str> = t.split('.').collect();
            if pp.len() != tp.len() {
                return false;
            }
            if pp.iter().zip(tp.iter()).all(|(a, b)| *a == "*" || a == b) {
                continue;
            }
        }
        return false;
    }
    true
}

/// Build a team event topic.
pub fn team_topic(team_id: &str, category: &str, action: &str) -> String {
    format!("team:{team_id}:events:{category}.{action}")
}
