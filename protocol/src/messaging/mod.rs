//! # Peer Messaging
//!
//! At-least-once delivery in, at-most-once application out.

pub mod channel;
pub mod message;
pub mod processed;
pub mod transport;

pub use channel::{
    ChannelConfig, ChannelError, Disposition, DurableCommit, HandlerOutcome, MessageChannel,
    MessageHandler, PaymentRequestBook, PaymentRequestRecord, PaymentRequestStatus,
};
pub use message::{ChannelMessage, MessageEvent, MessageId, MessageStatus, PaymentRequest};
pub use processed::{ProcessedMessageSet, ProcessedState};
pub use transport::{InboundMessage, PeerTransport, TransportError, TransportEvent};
