//! Channel messages and the outbound message state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::token::predicate::Address;
use crate::token::{Amount, CoinId};
use crate::transfer::payload::TransferPayload;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub request_id: Uuid,
    pub coin_id: CoinId,
    pub amount: Amount,
    /// Where the requester wants to be paid.
    pub pay_to: Address,
    #[serde(default)]
    pub memo: Option<String>,
}

/// Everything that travels over the peer channel.
///
/// Encoded as JSON with a `type` tag. A transfer's fields sit at the top
/// level next to the tag, so the body is the plain
/// `{sourceToken, transferTx}` payload plus `"type"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    TokenTransfer(TransferPayload),
    PaymentRequest(PaymentRequest),
    PaymentResponse { request_id: Uuid, accepted: bool },
    ReadReceipt { message_id: MessageId },
}

#[derive(Debug, Error)]
#[error("undecodable channel message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl ChannelMessage {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes a tagged message. An untagged body that parses as a bare
    /// transfer payload is accepted as a transfer.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<ChannelMessage>(bytes) {
            Ok(message) => Ok(message),
            Err(tagged_err) => match serde_json::from_slice::<TransferPayload>(bytes) {
                Ok(payload) => Ok(ChannelMessage::TokenTransfer(payload)),
                Err(_) => Err(DecodeError(tagged_err)),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::TokenTransfer(_) => "token_transfer",
            ChannelMessage::PaymentRequest(_) => "payment_request",
            ChannelMessage::PaymentResponse { .. } => "payment_response",
            ChannelMessage::ReadReceipt { .. } => "read_receipt",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound status
// ---------------------------------------------------------------------------

/// Lifecycle of a message this wallet sent.
///
/// ```text
/// Pending ──> Sent ──> Delivered ──> Read
///    │          │
///    └──────────┴──> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    /// The transport accepted the message.
    Sent,
    /// The peer's transport acknowledged it.
    Delivered,
    /// The peer sent a read receipt.
    Read,
    /// The transport gave up.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid message transition: {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: MessageStatus,
    pub event: MessageEvent,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Applies `event`. Defined for every `(status, event)` pair:
    ///
    /// - forward moves succeed, skipping steps is allowed (a read receipt
    ///   implies delivery);
    /// - repeating the current step is a no-op;
    /// - moving backwards, or anything out of `Failed`, is an error;
    /// - `Failed` is only reachable before delivery.
    pub fn apply(self, event: MessageEvent) -> Result<MessageStatus, InvalidTransition> {
        let target = match event {
            MessageEvent::Sent => MessageStatus::Sent,
            MessageEvent::Delivered => MessageStatus::Delivered,
            MessageEvent::Read => MessageStatus::Read,
            MessageEvent::Failed => MessageStatus::Failed,
        };
        let invalid = InvalidTransition { from: self, event };

        match (self, target) {
            (MessageStatus::Failed, MessageStatus::Failed) => Ok(self),
            (MessageStatus::Failed, _) => Err(invalid),
            (MessageStatus::Pending | MessageStatus::Sent, MessageStatus::Failed) => Ok(target),
            (_, MessageStatus::Failed) => Err(invalid),
            (from, to) if to.rank() >= from.rank() => Ok(to),
            _ => Err(invalid),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }
}
