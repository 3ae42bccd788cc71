//! # Transfer Protocol
//!
//! Moves ownership of tokens between wallets.
//!
//! ## Sending
//!
//! ```text
//! plan ──> [split] ──> commit ──> submit ──> proof ──> payload ──> channel ──> retire
//!                        │                     │                     │
//!                    tx_log: Submitted   tx_log: AwaitingDelivery   tx_log removed
//! ```
//!
//! The spent token is only retired once the payload has been handed to the
//! channel. Until then it stays in the store as `Pending`, so it still
//! counts as owned, and its log entry lets [`TransferProtocol::recover_pending`]
//! finish the job after a restart. A definitive network refusal restores
//! the token to `Confirmed` and drops the log entry.
//!
//! ## Receiving
//!
//! [`TransferProtocol::finalize`] accepts `{sourceToken, transferTx}`.
//! Direct transfers to this wallet are stored as they are. Transfers to a
//! nametag this wallet owns are claimed on the network first, using the
//! nametag token as witness. Anything else is "not for me": `Ok(false)`,
//! nothing stored. Deduplication is the channel's job.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DOMAIN_NAMETAG;
use crate::crypto::hash::domain_hash;
use crate::events::{EventBus, WalletEvent};
use crate::messaging::channel::{ChannelError, HandlerOutcome, MessageChannel, MessageHandler};
use crate::messaging::message::{ChannelMessage, MessageId};
use crate::storage::store::{PendingOp, SendStage, StoreError, TokenStore, TxLogEntry};
use crate::token::object::{Genesis, MintReason, TokenError, TokenId, TokenKind, TokenObject, TokenState};
use crate::token::owned::{Token, TokenStatus};
use crate::token::predicate::{normalize_nametag, Address};
use crate::token::{Amount, CoinId};
use crate::transfer::calculator::{PlanError, SplitCalculator, SplitConfig};
use crate::transfer::executor::{SplitError, SplitExecutor};
use crate::transfer::network::{submit_and_confirm, CommitError, ProofPolling, TransitionNetwork};
use crate::transfer::payload::{Recipient, TransferPayload};
use crate::transfer::signer::{CommitmentSigner, SignerError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Coarse classification of failures for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Not retried.
    Validation,
    /// The wallet can't cover the amount.
    InsufficientFunds,
    /// The network refused the commitment or never confirmed it. Local
    /// state is unchanged; the user may retry.
    NetworkSubmission,
    /// The transfer isn't addressed to this wallet.
    NotApplicable,
    /// Local or remote storage failed.
    StorageFailure,
    /// Divergent concurrent state.
    Conflict,
    /// Cancelled by the caller before anything was submitted.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("transfer cancelled before submission")]
    Cancelled,

    #[error("token {0} is not available for sending")]
    NotSpendable(TokenId),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("commitment for token {token_id} failed: {source}")]
    Commit {
        token_id: TokenId,
        #[source]
        source: CommitError,
    },

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("payload for token {token_id} not delivered: {source}")]
    Delivery {
        token_id: TokenId,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Plan(PlanError::ZeroAmount) => ErrorKind::Validation,
            TransferError::Plan(_) => ErrorKind::InsufficientFunds,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::NotSpendable(_)
            | TransferError::InvalidRecipient(_)
            | TransferError::Signer(_)
            | TransferError::Token(_) => ErrorKind::Validation,
            TransferError::Commit { .. } | TransferError::Delivery { .. } => {
                ErrorKind::NetworkSubmission
            }
            TransferError::Split(e) => match e {
                SplitError::Burn(_) | SplitError::Mint { .. } => ErrorKind::NetworkSubmission,
                SplitError::Store(_) => ErrorKind::StorageFailure,
                _ => ErrorKind::Validation,
            },
            TransferError::Store(_) => ErrorKind::StorageFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("finalization commitment failed: {0}")]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FinalizeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FinalizeError::Commit(CommitError::Conflict(_)) => ErrorKind::Conflict,
            FinalizeError::Commit(_) => ErrorKind::NetworkSubmission,
            FinalizeError::Store(_) => ErrorKind::StorageFailure,
            FinalizeError::Signer(_) | FinalizeError::Token(_) => ErrorKind::Validation,
        }
    }
}

// ---------------------------------------------------------------------------
// Config / results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TransferConfig {
    pub polling: ProofPolling,
    pub split: SplitConfig,
}

/// What to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// One specific token, whole.
    Token(TokenId),
    /// An exact amount of a coin, split if needed.
    Amount { coin_id: CoinId, amount: Amount },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentToken {
    pub token_id: TokenId,
    pub amount: Amount,
    pub message_id: MessageId,
}

#[derive(Debug, Clone)]
pub struct Confirmation {
    pub recipient: Recipient,
    pub sent: Vec<SentToken>,
    /// Change token kept by this wallet after a split.
    pub change: Option<TokenId>,
    /// Tokens burned by a split.
    pub burned: Vec<TokenId>,
}

impl Confirmation {
    pub fn total_sent(&self) -> Amount {
        self.sent.iter().map(|s| &s.amount).sum()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub completed: usize,
    pub still_pending: usize,
    pub dropped: usize,
}

// ---------------------------------------------------------------------------
// TransferProtocol
// ---------------------------------------------------------------------------

pub struct TransferProtocol {
    signer: Arc<CommitmentSigner>,
    network: Arc<dyn TransitionNetwork>,
    store: Arc<TokenStore>,
    channel: Arc<MessageChannel>,
    executor: SplitExecutor,
    calculator: SplitCalculator,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: TransferConfig,
}

impl TransferProtocol {
    pub fn new(
        signer: Arc<CommitmentSigner>,
        network: Arc<dyn TransitionNetwork>,
        store: Arc<TokenStore>,
        channel: Arc<MessageChannel>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: TransferConfig,
    ) -> Self {
        let executor = SplitExecutor::new(
            signer.clone(),
            network.clone(),
            store.clone(),
            clock.clone(),
            config.polling.clone(),
        );
        Self {
            signer,
            network,
            store,
            channel,
            executor,
            calculator: SplitCalculator::new(config.split.clone()),
            events,
            clock,
            config,
        }
    }

    /// Registers this protocol as the channel's transfer handler. The
    /// channel only holds a weak reference.
    pub fn attach(self: &Arc<Self>) {
        self.channel.on_message(Arc::new(TransferInbox {
            protocol: Arc::downgrade(self),
        }));
    }

    pub fn signer(&self) -> &CommitmentSigner {
        &self.signer
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    // -- Sending ------------------------------------------------------------

    pub async fn send(&self, target: TransferTarget, recipient: &Recipient) -> Result<Confirmation, TransferError> {
        let (_tx, rx) = watch::channel(false);
        self.send_cancellable(target, recipient, rx).await
    }

    /// Like [`send`](Self::send), but gives up if `cancel` is set before the
    /// first commitment is submitted. Past that point the transfer runs to
    /// completion or to a definitive failure.
    pub async fn send_cancellable(
        &self,
        target: TransferTarget,
        recipient: &Recipient,
        cancel: watch::Receiver<bool>,
    ) -> Result<Confirmation, TransferError> {
        if let Address::Burn(_) = recipient.address {
            return Err(TransferError::InvalidRecipient("burn address".into()));
        }
        if recipient.address == self.signer.direct_address() {
            return Err(TransferError::InvalidRecipient("cannot send to self".into()));
        }

        let (direct, split) = match target {
            TransferTarget::Token(token_id) => {
                let token = self
                    .store
                    .get(&token_id)?
                    .filter(|t| t.status == TokenStatus::Confirmed)
                    .ok_or(TransferError::NotSpendable(token_id))?;
                (vec![token], None)
            }
            TransferTarget::Amount { coin_id, amount } => {
                let owned = self.store.spendable(&coin_id)?;
                let plan = self.calculator.try_plan(&owned, &amount, &coin_id)?;
                debug!(
                    direct = plan.direct.len(),
                    split = plan.requires_split(),
                    %amount,
                    "transfer planned"
                );
                (plan.direct, plan.split)
            }
        };

        if *cancel.borrow() {
            info!(peer = %recipient.peer_id, "transfer cancelled before submission");
            return Err(TransferError::Cancelled);
        }

        let mut confirmation = Confirmation {
            recipient: recipient.clone(),
            sent: Vec::new(),
            change: None,
            burned: Vec::new(),
        };
        for token in &direct {
            confirmation.sent.push(self.send_whole(token, recipient).await?);
        }
        if let Some(split) = split {
            let mut burned = Vec::new();
            let result = self
                .executor
                .execute(&split, recipient, |id| burned.push(id))
                .await?;
            confirmation.burned = burned;
            confirmation.change = Some(result.sender_share.token_id());
            self.events.publish(WalletEvent::TokensChanged);
            confirmation
                .sent
                .push(self.send_whole(&result.recipient_share, recipient).await?);
        }

        info!(
            peer = %recipient.peer_id,
            tokens = confirmation.sent.len(),
            amount = %confirmation.total_sent(),
            "transfer complete"
        );
        Ok(confirmation)
    }

    async fn send_whole(&self, token: &Token, recipient: &Recipient) -> Result<SentToken, TransferError> {
        let token_id = token.token_id();
        let commitment = self.signer.create_transfer(
            token.object(),
            recipient.address,
            CommitmentSigner::fresh_salt(),
            None,
        )?;
        let entry = TxLogEntry {
            id: Uuid::new_v4(),
            created_at: self.clock.now(),
            op: PendingOp::Send {
                token_id,
                peer_id: recipient.peer_id.clone(),
                commitment,
                stage: SendStage::Submitted,
            },
        };
        self.store.log_put(&entry)?;
        self.store.set_status(&token_id, TokenStatus::Pending)?;
        self.drive_send(entry).await
    }

    /// Advances a logged send as far as it will go.
    async fn drive_send(&self, mut entry: TxLogEntry) -> Result<SentToken, TransferError> {
        let PendingOp::Send {
            token_id,
            peer_id,
            commitment,
            stage,
        } = entry.op.clone()
        else {
            return Err(TransferError::InvalidRecipient("log entry is not a send".into()));
        };
        let token = self
            .store
            .get(&token_id)?
            .ok_or(TransferError::NotSpendable(token_id))?;

        let payload = match stage {
            SendStage::AwaitingDelivery { payload } => TransferPayload::from_json(&payload)
                .map_err(|e| TransferError::Token(TokenError::Json(e)))?,
            SendStage::Submitted => {
                let confirmed = submit_and_confirm(
                    self.network.as_ref(),
                    &commitment.submit_request(),
                    &self.config.polling,
                )
                .await
                .and_then(|proof| Ok(commitment.clone().into_transaction(proof)?));
                let transfer_tx = match confirmed {
                    Ok(tx) => tx,
                    Err(e) if e.is_definitive() => {
                        warn!(%token_id, error = %e, "commitment refused, token restored");
                        self.store.set_status(&token_id, TokenStatus::Confirmed)?;
                        self.store.log_remove(&entry.id)?;
                        return Err(TransferError::Commit { token_id, source: e });
                    }
                    Err(e) => {
                        warn!(%token_id, error = %e, "commitment outcome unknown, left pending");
                        return Err(TransferError::Commit { token_id, source: e });
                    }
                };
                let payload = TransferPayload {
                    source_token: token.object().clone(),
                    transfer_tx,
                };
                if let PendingOp::Send { stage, .. } = &mut entry.op {
                    *stage = SendStage::AwaitingDelivery {
                        payload: payload.to_json(),
                    };
                }
                self.store.log_put(&entry)?;
                payload
            }
        };

        let message_id = self
            .channel
            .send(&peer_id, &ChannelMessage::TokenTransfer(payload))
            .await
            .map_err(|source| {
                warn!(%token_id, peer = %peer_id, error = %source, "payload delivery failed, will retry");
                TransferError::Delivery { token_id, source }
            })?;

        self.store
            .retire(&token_id, TokenStatus::Transferred, self.clock.now())?;
        self.store.log_remove(&entry.id)?;
        self.events.publish(WalletEvent::TransferSent {
            token_id,
            peer_id: peer_id.clone(),
        });
        self.events.publish(WalletEvent::TokensChanged);
        info!(%token_id, peer = %peer_id, amount = %token.amount(), "token sent");
        Ok(SentToken {
            token_id,
            amount: token.amount().clone(),
            message_id,
        })
    }

    /// Re-drives every open transaction log entry. Safe to call repeatedly.
    pub async fn recover_pending(&self) -> Result<RecoveryReport, TransferError> {
        let mut report = RecoveryReport::default();
        for entry in self.store.log_entries()? {
            match &entry.op {
                PendingOp::Send {
                    token_id,
                    commitment,
                    ..
                } => {
                    let current = self.store.get(token_id)?;
                    let matches = current
                        .as_ref()
                        .is_some_and(|t| t.object().state == commitment.data.source_state);
                    if !matches {
                        debug!(%token_id, "dropping log entry for a token that moved on");
                        self.store.log_remove(&entry.id)?;
                        report.dropped += 1;
                        continue;
                    }
                    if current.is_some_and(|t| t.status == TokenStatus::Confirmed) {
                        self.store.set_status(token_id, TokenStatus::Pending)?;
                    }
                    match self.drive_send(entry.clone()).await {
                        Ok(_) => report.completed += 1,
                        Err(TransferError::Commit { source, .. }) if source.is_definitive() => {
                            report.dropped += 1
                        }
                        Err(e) => {
                            warn!(%token_id, error = %e, "send still pending");
                            report.still_pending += 1;
                        }
                    }
                }
                PendingOp::Split { source_token_id, .. } => {
                    let source_token_id = *source_token_id;
                    match self.executor.resume(entry.clone(), |_| {}).await {
                        Ok(result) => {
                            self.events.publish(WalletEvent::TokensChanged);
                            match self.send_whole(&result.recipient_share, &result.recipient).await {
                                Ok(_) => report.completed += 1,
                                Err(e) => {
                                    warn!(token_id = %result.recipient_share.token_id(), error = %e, "split share not sent");
                                    report.still_pending += 1;
                                }
                            }
                        }
                        Err(e) if e.is_in_flight() => {
                            warn!(token_id = %source_token_id, error = %e, "split still pending");
                            report.still_pending += 1;
                        }
                        Err(e) => {
                            warn!(token_id = %source_token_id, error = %e, "split abandoned");
                            self.store.log_remove(&entry.id)?;
                            report.dropped += 1;
                        }
                    }
                }
            }
        }
        if report != RecoveryReport::default() {
            info!(
                completed = report.completed,
                still_pending = report.still_pending,
                dropped = report.dropped,
                "transaction log recovery"
            );
        }
        Ok(report)
    }

    // -- Receiving ----------------------------------------------------------

    /// Accepts a JSON transfer payload from `sender`. Malformed payloads
    /// return `Ok(false)`.
    pub async fn finalize(&self, payload: &str, sender: &str) -> Result<bool, FinalizeError> {
        match TransferPayload::from_json(payload) {
            Ok(payload) => self.finalize_payload(payload, sender).await,
            Err(e) => {
                warn!(%sender, error = %e, "unparseable transfer payload");
                Ok(false)
            }
        }
    }

    pub async fn finalize_payload(&self, payload: TransferPayload, sender: &str) -> Result<bool, FinalizeError> {
        let TransferPayload {
            source_token,
            transfer_tx,
        } = payload;
        let token_id = source_token.id();

        if let Err(e) = source_token.verify() {
            warn!(%token_id, %sender, error = %e, "source token does not verify");
            return Ok(false);
        }
        if let Err(e) = transfer_tx.verify() {
            warn!(%token_id, %sender, error = %e, "transfer transaction does not verify");
            return Ok(false);
        }
        if transfer_tx.data.token_id != token_id || transfer_tx.data.source_state != source_token.state {
            warn!(%token_id, %sender, "transfer does not spend the source token's state");
            return Ok(false);
        }

        let new_state = match transfer_tx.data.recipient {
            direct @ Address::Direct(_) => {
                if direct != self.signer.direct_address() {
                    info!(%token_id, %sender, "direct transfer not addressed to this wallet");
                    return Ok(false);
                }
                TokenState::new(self.signer.unmasked_predicate())
            }
            proxy @ Address::Proxy(_) => {
                let Some(nametag) = self.store.nametag_for(&proxy)? else {
                    info!(%token_id, %sender, address = %proxy, "no nametag for proxy address, not for us");
                    return Ok(false);
                };
                let (commitment, new_state) = self.signer.create_finalize(&transfer_tx, nametag.object())?;
                submit_and_confirm(
                    self.network.as_ref(),
                    &commitment.submit_request(),
                    &self.config.polling,
                )
                .await?;
                new_state
            }
            Address::Burn(_) => {
                debug!(%token_id, "ignoring transfer to a burn address");
                return Ok(false);
            }
        };

        let object = source_token.with_transfer(transfer_tx, new_state);
        if self.store.is_tombstoned(&token_id, &object.state.hash())? {
            info!(%token_id, "received token already spent here, ignoring");
            return Ok(false);
        }
        let token = match Token::from_object(object, self.clock.now()) {
            Ok(t) => t,
            Err(e) => {
                warn!(%token_id, error = %e, "finalized token does not verify");
                return Ok(false);
            }
        };
        if let Some(existing) = self.store.get(&token_id)? {
            if existing.serialized() == token.serialized() {
                debug!(%token_id, "token already stored");
                return Ok(true);
            }
        }

        self.store.put(&token)?;
        info!(%token_id, amount = %token.amount(), %sender, "transfer finalized");
        self.events.publish(WalletEvent::TransferReceived {
            token_id,
            amount: token.amount().to_string(),
            sender: sender.to_string(),
        });
        self.events.publish(WalletEvent::TokensChanged);
        Ok(true)
    }

    // -- Nametags -----------------------------------------------------------

    /// Mints a nametag token for `name`. Returns the existing token if this
    /// wallet already owns the name. Another wallet holding the name makes
    /// the mint conflict on the network.
    pub async fn register_nametag(&self, name: &str) -> Result<Token, TransferError> {
        let normalized = normalize_nametag(name);
        if normalized.is_empty() {
            return Err(TransferError::InvalidRecipient("empty nametag".into()));
        }
        if let Some(existing) = self.store.nametag_for(&Address::for_nametag(&normalized))? {
            return Ok(existing);
        }

        let token_id = TokenId::from_bytes(domain_hash(DOMAIN_NAMETAG, &[b"token", normalized.as_bytes()]));
        let commitment = self.signer.create_mint(
            token_id,
            TokenKind::Nametag,
            None,
            MintReason::Nametag {
                name: normalized.clone(),
            },
            CommitmentSigner::fresh_salt(),
        );
        let proof = submit_and_confirm(
            self.network.as_ref(),
            &commitment.submit_request(),
            &self.config.polling,
        )
        .await
        .map_err(|source| TransferError::Commit { token_id, source })?;

        let object = TokenObject {
            genesis: Genesis {
                data: commitment.data,
                inclusion_proof: proof,
            },
            transactions: Vec::new(),
            state: TokenState::new(self.signer.unmasked_predicate()),
        };
        let token = Token::from_object(object, self.clock.now())?;
        self.store.put(&token)?;
        self.events.publish(WalletEvent::TokensChanged);
        info!(nametag = %normalized, %token_id, "nametag registered");
        Ok(token)
    }
}

/// Channel-facing adapter. Holds the protocol weakly so the channel does
/// not keep it alive.
struct TransferInbox {
    protocol: Weak<TransferProtocol>,
}

#[async_trait]
impl MessageHandler for TransferInbox {
    async fn handle_transfer(&self, sender: &str, payload: TransferPayload) -> HandlerOutcome {
        let Some(protocol) = self.protocol.upgrade() else {
            return HandlerOutcome::Retry;
        };
        match protocol.finalize_payload(payload, sender).await {
            Ok(true) => HandlerOutcome::Applied,
            Ok(false) => HandlerOutcome::NotApplicable,
            // The finalize commitment is deterministic, so a later attempt
            // either lands or finds the first one already recorded.
            Err(e @ (FinalizeError::Commit(_) | FinalizeError::Store(_))) => {
                warn!(%sender, error = %e, "finalization failed, will retry");
                HandlerOutcome::Retry
            }
            Err(e) => {
                warn!(%sender, error = %e, "finalization failed permanently");
                HandlerOutcome::NotApplicable
            }
        }
    }
}
