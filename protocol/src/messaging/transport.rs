//! Peer transport seam.
//!
//! The channel only needs two things from whatever carries bytes between
//! peers: a way to send a private message and a stream of inbound events.
//! Delivery is at-least-once, in no particular order.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::message::MessageId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub sender: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The peer's side acknowledged a message we sent.
    Delivered(MessageId),
    /// The transport gave up on a message we sent.
    Failed(MessageId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport offline")]
    Offline,
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Sends an encrypted private message. Success means the transport
    /// accepted it, not that the peer has it.
    async fn send_private(
        &self,
        recipient: &str,
        bytes: Vec<u8>,
    ) -> Result<MessageId, TransportError>;

    /// Hands over the inbound event stream. Only the first caller gets it.
    fn take_inbound(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// This endpoint's peer identity.
    fn local_peer(&self) -> &str;
}
