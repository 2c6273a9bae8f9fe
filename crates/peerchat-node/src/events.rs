//! Local fan-out of store mutations to connected real-time sessions.
//!
//! Built on a `tokio::sync::broadcast` channel: emitting never blocks and
//! never fails, a session that is not subscribed simply misses the event and
//! re-fetches state when it reconnects.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use peerchat_shared::constants::{
    EVENT_NEW_CONVERSATION, EVENT_UPDATE_CONVERSATION, EVENT_UPDATE_MESSAGE,
};
use peerchat_shared::protocol::MessageUpdate;
use peerchat_shared::types::{Conversation, Message};

/// Frames buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget broadcast of `payload` under `name`.
    pub fn emit<S: Serialize>(&self, name: &str, payload: S) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(event = name, error = %e, "Failed to encode event payload");
                return;
            }
        };

        let event = Event {
            name: name.to_string(),
            payload,
        };
        // No subscribers is not an error.
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(event = name, delivered, "Event emitted");
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            names: None,
        }
    }

    /// Receive only the events called one of `names`.
    pub fn subscribe_to(&self, names: &[&str]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            names: Some(names.iter().map(|n| n.to_string()).collect()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    // -- typed helpers for the store mutations --

    pub fn conversation_updated(&self, conversation: &Conversation) {
        self.emit(EVENT_UPDATE_CONVERSATION, conversation.snapshot());
    }

    pub fn message_updated(&self, cid: &str, message: &Message) {
        self.emit(
            EVENT_UPDATE_MESSAGE,
            MessageUpdate {
                cid: cid.to_string(),
                message: message.clone(),
            },
        );
    }

    pub fn conversation_created(&self, cid: &str) {
        self.emit(EVENT_NEW_CONVERSATION, cid);
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    names: Option<Vec<String>>,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let wanted = match &self.names {
                        Some(names) => names.iter().any(|n| *n == event.name),
                        None => true,
                    };
                    if wanted {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session lagging behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit("update-message", "nobody listens");
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.conversation_created("c1");

        for sub in [&mut a, &mut b] {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.name, EVENT_NEW_CONVERSATION);
            assert_eq!(event.payload, Value::String("c1".into()));
        }
    }

    #[tokio::test]
    async fn test_filtered_subscription_skips_other_names() {
        let bus = EventBus::default();
        let mut messages = bus.subscribe_to(&[EVENT_UPDATE_MESSAGE]);

        bus.conversation_created("c1");
        bus.message_updated("c1", &Message::draft("hi"));

        let event = messages.recv().await.unwrap();
        assert_eq!(event.name, EVENT_UPDATE_MESSAGE);
        assert_eq!(event.payload["cid"], "c1");
        assert_eq!(event.payload["message"]["body"], "hi");
    }

    #[tokio::test]
    async fn test_conversation_payload_has_no_message_cache() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        let mut c = Conversation::with_id("c1", "peer", "name");
        c.messages.insert("0".into(), Message::draft("cached"));
        bus.conversation_updated(&c);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload["id"], "c1");
        assert!(event.payload.get("messages").is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit("update-message", i);
        }

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload, serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_dropped_bus_ends_subscription() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
