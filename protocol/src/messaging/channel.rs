//! # Message Channel
//!
//! Peer-to-peer delivery of transfer payloads and control messages on top
//! of a [`PeerTransport`].
//!
//! ## Inbound processing
//!
//! The transport delivers at least once, so every inbound message goes
//! through the same steps, one message at a time:
//!
//! 1. Skip it if its ID is already in the [`ProcessedMessageSet`].
//! 2. Pin the ID so nothing else can process it concurrently.
//! 3. Dispatch: transfers go to the registered [`MessageHandler`], read
//!    receipts and payment requests are handled here.
//! 4. If the handler applied a change, run the [`DurableCommit`] hook (a
//!    sync of the new wallet state).
//! 5. Only when that succeeds is the ID settled. A failed handler or a
//!    failed commit unpins the ID, and the message stays re-deliverable.
//!    So does an ID that cannot be persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{
    ChannelMessage, MessageEvent, MessageId, MessageStatus, PaymentRequest,
};
use super::processed::ProcessedMessageSet;
use super::transport::{InboundMessage, PeerTransport, TransportError, TransportEvent};
use crate::clock::Clock;
use crate::config::{OUTBOUND_STATUS_CAPACITY, PROCESSED_MESSAGE_CAPACITY};
use crate::events::{EventBus, WalletEvent};
use crate::storage::db::{DbError, TreeName, WalletDb};
use crate::transfer::payload::TransferPayload;

const META_PAYMENT_REQUESTS: &[u8] = b"payment_requests";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("unknown payment request {0}")]
    UnknownPaymentRequest(Uuid),

    #[error("payment request {0} was already answered")]
    AlreadyAnswered(Uuid),

    #[error("inbound stream already taken")]
    InboundTaken,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub processed_capacity: usize,
    /// Send a read receipt after a transfer has been applied.
    pub send_read_receipts: bool,
    /// Outbound statuses remembered; the oldest are forgotten first.
    pub outbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            processed_capacity: PROCESSED_MESSAGE_CAPACITY,
            send_read_receipts: true,
            outbound_capacity: OUTBOUND_STATUS_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Local state changed and needs a durable commit.
    Applied,
    /// Well-formed but not for us. Settled without side effects.
    NotApplicable,
    /// Transient failure. Leave the message re-deliverable.
    Retry,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_transfer(&self, sender: &str, payload: TransferPayload) -> HandlerOutcome;
}

/// Makes applied changes durable before a message is settled.
#[async_trait]
pub trait DurableCommit: Send + Sync {
    async fn commit(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Result of processing one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Duplicate,
    Invalid,
    Applied,
    NotApplicable,
    /// Left unprocessed; a re-delivery will try again.
    Deferred,
}

// ---------------------------------------------------------------------------
// Payment requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentRequestStatus {
    Pending,
    Paid,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequestRecord {
    pub from: String,
    pub request: PaymentRequest,
    pub status: PaymentRequestStatus,
    pub received_at: DateTime<Utc>,
}

/// Incoming payment requests, persisted as one list in the meta tree.
pub struct PaymentRequestBook {
    db: Option<WalletDb>,
    records: Mutex<Vec<PaymentRequestRecord>>,
}

impl PaymentRequestBook {
    pub fn in_memory() -> Self {
        Self {
            db: None,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn load(db: WalletDb) -> Result<Self, DbError> {
        let records = db.get(TreeName::Meta, META_PAYMENT_REQUESTS)?.unwrap_or_default();
        Ok(Self {
            db: Some(db),
            records: Mutex::new(records),
        })
    }

    /// Records a request. A request ID seen before is left as it is.
    pub fn record(&self, from: &str, request: PaymentRequest, now: DateTime<Utc>) -> Result<bool, DbError> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.request.request_id == request.request_id) {
            return Ok(false);
        }
        records.push(PaymentRequestRecord {
            from: from.to_string(),
            request,
            status: PaymentRequestStatus::Pending,
            received_at: now,
        });
        self.persist(&records)?;
        Ok(true)
    }

    /// Moves a pending request to its final status.
    pub fn resolve(&self, request_id: &Uuid, status: PaymentRequestStatus) -> Result<PaymentRequestRecord, ChannelError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| &r.request.request_id == request_id)
            .ok_or(ChannelError::UnknownPaymentRequest(*request_id))?;
        if record.status != PaymentRequestStatus::Pending {
            return Err(ChannelError::AlreadyAnswered(*request_id));
        }
        record.status = status;
        let answered = record.clone();
        self.persist(&records)?;
        Ok(answered)
    }

    pub fn get(&self, request_id: &Uuid) -> Option<PaymentRequestRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| &r.request.request_id == request_id)
            .cloned()
    }

    pub fn pending(&self) -> Vec<PaymentRequestRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.status == PaymentRequestStatus::Pending)
            .cloned()
            .collect()
    }

    fn persist(&self, records: &[PaymentRequestRecord]) -> Result<(), DbError> {
        match &self.db {
            Some(db) => db.put(TreeName::Meta, META_PAYMENT_REQUESTS, &records.to_vec()),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageChannel
// ---------------------------------------------------------------------------

pub struct MessageChannel {
    transport: Arc<dyn PeerTransport>,
    processed: ProcessedMessageSet,
    payment_requests: PaymentRequestBook,
    outbound: DashMap<MessageId, MessageStatus>,
    outbound_order: Mutex<VecDeque<MessageId>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    durable: RwLock<Option<Arc<dyn DurableCommit>>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: ChannelConfig,
}

impl MessageChannel {
    /// A channel persisting its processed set and payment requests in `db`.
    pub fn open(
        transport: Arc<dyn PeerTransport>,
        db: WalletDb,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let processed = ProcessedMessageSet::load(db.clone(), config.processed_capacity)?;
        let payment_requests = PaymentRequestBook::load(db)?;
        Ok(Self::with_parts(transport, processed, payment_requests, events, clock, config))
    }

    pub fn with_parts(
        transport: Arc<dyn PeerTransport>,
        processed: ProcessedMessageSet,
        payment_requests: PaymentRequestBook,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            transport,
            processed,
            payment_requests,
            outbound: DashMap::new(),
            outbound_order: Mutex::new(VecDeque::new()),
            handler: RwLock::new(None),
            durable: RwLock::new(None),
            events,
            clock,
            config,
        }
    }

    /// Registers the consumer of inbound transfer payloads.
    pub fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn set_durable_commit(&self, commit: Arc<dyn DurableCommit>) {
        *self.durable.write() = Some(commit);
    }

    pub fn local_peer(&self) -> &str {
        self.transport.local_peer()
    }

    pub fn processed(&self) -> &ProcessedMessageSet {
        &self.processed
    }

    pub fn payment_requests(&self) -> &PaymentRequestBook {
        &self.payment_requests
    }

    // -- Outbound -----------------------------------------------------------

    pub async fn send(&self, recipient: &str, message: &ChannelMessage) -> Result<MessageId, ChannelError> {
        let id = self.transport.send_private(recipient, message.encode()).await?;
        self.track(&id);
        self.advance(&id, MessageEvent::Sent);
        debug!(message_id = %id, recipient, kind = message.kind(), "message sent");
        Ok(id)
    }

    /// Status of a message this channel sent.
    pub fn status(&self, id: &MessageId) -> Option<MessageStatus> {
        self.outbound.get(id).map(|s| *s)
    }

    /// Asks `recipient` to pay.
    pub async fn request_payment(&self, recipient: &str, request: PaymentRequest) -> Result<MessageId, ChannelError> {
        self.send(recipient, &ChannelMessage::PaymentRequest(request)).await
    }

    /// Answers a received payment request. Paying it is the caller's job;
    /// this only records the answer and tells the requester.
    pub async fn respond_payment_request(&self, request_id: &Uuid, accepted: bool) -> Result<MessageId, ChannelError> {
        let status = if accepted {
            PaymentRequestStatus::Paid
        } else {
            PaymentRequestStatus::Declined
        };
        let record = self.payment_requests.resolve(request_id, status)?;
        let response = ChannelMessage::PaymentResponse {
            request_id: *request_id,
            accepted,
        };
        self.send(&record.from, &response).await
    }

    fn track(&self, id: &MessageId) {
        self.outbound.insert(id.clone(), MessageStatus::Pending);
        let mut order = self.outbound_order.lock();
        order.push_back(id.clone());
        while order.len() > self.config.outbound_capacity {
            if let Some(oldest) = order.pop_front() {
                self.outbound.remove(&oldest);
            }
        }
    }

    fn advance(&self, id: &MessageId, event: MessageEvent) {
        let Some(mut status) = self.outbound.get_mut(id) else {
            debug!(message_id = %id, ?event, "status event for unknown message");
            return;
        };
        match status.apply(event) {
            Ok(next) if next != *status => {
                *status = next;
                drop(status);
                self.events.publish(WalletEvent::MessageStatusChanged {
                    message_id: id.clone(),
                    status: next,
                });
            }
            Ok(_) => {}
            Err(e) => debug!(message_id = %id, error = %e, "ignoring status event"),
        }
    }

    // -- Inbound ------------------------------------------------------------

    /// Consumes the transport's inbound stream until shutdown. Messages are
    /// processed strictly one after another.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), ChannelError> {
        let mut inbound = self.transport.take_inbound().ok_or(ChannelError::InboundTaken)?;
        info!(peer = self.local_peer(), "message channel started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("transport closed the inbound stream");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("message channel stopped");
        Ok(())
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                self.process_inbound(message).await;
            }
            TransportEvent::Delivered(id) => self.advance(&id, MessageEvent::Delivered),
            TransportEvent::Failed(id) => self.advance(&id, MessageEvent::Failed),
        }
    }

    pub async fn process_inbound(&self, message: InboundMessage) -> Disposition {
        let InboundMessage { id, sender, bytes } = message;
        if !self.processed.pin(&id) {
            debug!(message_id = %id, "duplicate message skipped");
            return Disposition::Duplicate;
        }

        let decoded = match ChannelMessage::decode(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(message_id = %id, %sender, error = %e, "dropping malformed message");
                return self.settle(&id, Disposition::Invalid);
            }
        };

        let disposition = match decoded {
            ChannelMessage::TokenTransfer(payload) => self.apply_transfer(&id, &sender, payload).await,
            ChannelMessage::ReadReceipt { message_id } => {
                self.advance(&message_id, MessageEvent::Read);
                Disposition::Applied
            }
            ChannelMessage::PaymentRequest(request) => {
                let request_id = request.request_id;
                match self.payment_requests.record(&sender, request, self.clock.now()) {
                    Ok(_) => {
                        info!(%request_id, from = %sender, "payment request received");
                        Disposition::Applied
                    }
                    Err(e) => {
                        warn!(%request_id, error = %e, "failed to record payment request");
                        Disposition::Deferred
                    }
                }
            }
            ChannelMessage::PaymentResponse { request_id, accepted } => {
                info!(%request_id, accepted, from = %sender, "payment request answered");
                Disposition::Applied
            }
        };

        self.settle(&id, disposition)
    }

    /// Records the outcome in the processed set. A message whose ID could
    /// not be persisted is reported as deferred since it will be re-delivered.
    fn settle(&self, id: &MessageId, disposition: Disposition) -> Disposition {
        if disposition == Disposition::Deferred {
            self.processed.unpin(id);
            return disposition;
        }
        match self.processed.confirm(id) {
            Ok(()) => disposition,
            Err(_) => Disposition::Deferred,
        }
    }

    async fn apply_transfer(&self, id: &MessageId, sender: &str, payload: TransferPayload) -> Disposition {
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            warn!(message_id = %id, "no transfer handler registered, deferring");
            return Disposition::Deferred;
        };

        match handler.handle_transfer(sender, payload).await {
            HandlerOutcome::NotApplicable => Disposition::NotApplicable,
            HandlerOutcome::Retry => Disposition::Deferred,
            HandlerOutcome::Applied => {
                let durable = self.durable.read().clone();
                if let Some(durable) = durable {
                    if let Err(e) = durable.commit().await {
                        warn!(message_id = %id, error = %e, "durable commit failed, message left unprocessed");
                        return Disposition::Deferred;
                    }
                }
                if self.config.send_read_receipts {
                    let receipt = ChannelMessage::ReadReceipt {
                        message_id: id.clone(),
                    };
                    // Receipts are fire-and-forget; their status is not tracked.
                    if let Err(e) = self.transport.send_private(sender, receipt.encode()).await {
                        debug!(message_id = %id, error = %e, "read receipt not sent");
                    }
                }
                Disposition::Applied
            }
        }
    }
}
