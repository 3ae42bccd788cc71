//! In-process peer transport.
//!
//! A [`LoopbackHub`] connects any number of named endpoints. Every message
//! is kept in a delivery log so tests can replay it and exercise
//! at-least-once delivery. A successful enqueue is acknowledged to the
//! sender with [`TransportEvent::Delivered`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::INBOUND_QUEUE_CAPACITY;
use crate::messaging::message::MessageId;
use crate::messaging::transport::{InboundMessage, PeerTransport, TransportError, TransportEvent};

#[derive(Default)]
struct HubInner {
    peers: HashMap<String, mpsc::Sender<TransportEvent>>,
    delivered: Vec<(String, InboundMessage)>,
    offline: HashSet<String>,
}

impl HubInner {
    fn push(&self, peer: &str, event: TransportEvent) -> Result<(), TransportError> {
        let tx = self
            .peers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownRecipient(peer.to_string()))?;
        tx.try_send(event)
            .map_err(|e| TransportError::Other(format!("queue for {peer}: {e}")))
    }
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `peer` and returns its endpoint. Registering the same name
    /// again replaces the old endpoint's inbound queue.
    pub fn endpoint(&self, peer: &str) -> Arc<LoopbackTransport> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        self.inner.lock().peers.insert(peer.to_string(), tx);
        Arc::new(LoopbackTransport {
            peer: peer.to_string(),
            hub: self.inner.clone(),
            inbound: Mutex::new(Some(rx)),
        })
    }

    /// While offline, `peer` can neither send nor receive.
    pub fn set_offline(&self, peer: &str, offline: bool) {
        let mut inner = self.inner.lock();
        if offline {
            inner.offline.insert(peer.to_string());
        } else {
            inner.offline.remove(peer);
        }
    }

    /// Delivers every message ever sent to `peer` again, in original order.
    /// Returns how many were re-queued.
    pub fn redeliver_all(&self, peer: &str) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        for (recipient, message) in &inner.delivered {
            if recipient == peer && inner.push(peer, TransportEvent::Message(message.clone())).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Messages sent to `peer` so far.
    pub fn delivered_to(&self, peer: &str) -> Vec<InboundMessage> {
        self.inner
            .lock()
            .delivered
            .iter()
            .filter(|(recipient, _)| recipient == peer)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

pub struct LoopbackTransport {
    peer: String,
    hub: Arc<Mutex<HubInner>>,
    inbound: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send_private(&self, recipient: &str, bytes: Vec<u8>) -> Result<MessageId, TransportError> {
        let mut hub = self.hub.lock();
        if hub.offline.contains(&self.peer) || hub.offline.contains(recipient) {
            return Err(TransportError::Offline);
        }
        let message = InboundMessage {
            id: MessageId::random(),
            sender: self.peer.clone(),
            bytes,
        };
        hub.push(recipient, TransportEvent::Message(message.clone()))?;
        let id = message.id.clone();
        hub.delivered.push((recipient.to_string(), message));
        // Ack is best effort; the sender may not be listening.
        let _ = hub.push(&self.peer, TransportEvent::Delivered(id.clone()));
        trace!(from = %self.peer, to = recipient, message_id = %id, "loopback delivery");
        Ok(id)
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inbound.lock().take()
    }

    fn local_peer(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_reaches_recipient_and_sender_gets_ack() {
        let hub = LoopbackHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");
        let mut alice_rx = alice.take_inbound().unwrap();
        let mut bob_rx = bob.take_inbound().unwrap();
        assert!(bob.take_inbound().is_none());

        let id = alice.send_private("bob", b"hi".to_vec()).await.unwrap();
        match bob_rx.recv().await.unwrap() {
            TransportEvent::Message(m) => {
                assert_eq!(m.id, id);
                assert_eq!(m.sender, "alice");
                assert_eq!(m.bytes, b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(alice_rx.recv().await.unwrap(), TransportEvent::Delivered(id));
    }

    #[tokio::test]
    async fn redelivery_repeats_the_same_message_id() {
        let hub = LoopbackHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");
        let mut bob_rx = bob.take_inbound().unwrap();
        let id = alice.send_private("bob", b"x".to_vec()).await.unwrap();
        assert_eq!(hub.redeliver_all("bob"), 1);

        for _ in 0..2 {
            let TransportEvent::Message(m) = bob_rx.recv().await.unwrap() else {
                panic!("expected message");
            };
            assert_eq!(m.id, id);
        }
    }

    #[tokio::test]
    async fn offline_and_unknown_peers_fail() {
        let hub = LoopbackHub::new();
        let alice = hub.endpoint("alice");
        let _bob = hub.endpoint("bob");
        assert_eq!(
            alice.send_private("carol", vec![]).await,
            Err(TransportError::UnknownRecipient("carol".into()))
        );
        hub.set_offline("bob", true);
        assert_eq!(alice.send_private("bob", vec![]).await, Err(TransportError::Offline));
        hub.set_offline("bob", false);
        assert!(alice.send_private("bob", vec![]).await.is_ok());
    }
}
