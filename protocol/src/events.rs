//! # Wallet Event Bus
//!
//! Typed publish/subscribe for "something changed" notifications. Any
//! number of subscribers (UI, daemon websocket, metrics) each get every
//! event in publish order. A subscriber that falls more than
//! [`EVENT_BUS_CAPACITY`] events behind gets `Lagged` on its next receive
//! instead of slowing publishers down; it is never silently skipped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::EVENT_BUS_CAPACITY;
use crate::messaging::message::{MessageId, MessageStatus};
use crate::token::object::TokenId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    /// The local token set changed.
    TokensChanged,
    TransferSent {
        token_id: TokenId,
        peer_id: String,
    },
    TransferReceived {
        token_id: TokenId,
        amount: String,
        sender: String,
    },
    SyncCompleted {
        sequence: u64,
        token_count: usize,
    },
    /// Remote sync is suspended. Persistent notice: "working offline, will
    /// retry sync".
    LocalModeEntered {
        reason: String,
    },
    LocalModeExited,
    MessageStatusChanged {
        message_id: MessageId,
        status: MessageStatus,
    },
}

/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes to current subscribers. Having none is not an error.
    pub fn publish(&self, event: WalletEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(WalletEvent::TokensChanged);
        bus.publish(WalletEvent::LocalModeExited);
        assert_eq!(rx.recv().await.unwrap(), WalletEvent::TokensChanged);
        assert_eq!(rx.recv().await.unwrap(), WalletEvent::LocalModeExited);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new().publish(WalletEvent::TokensChanged);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(WalletEvent::TokensChanged);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&WalletEvent::LocalModeEntered {
            reason: "storage".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"local_mode_entered\""));
    }
}
