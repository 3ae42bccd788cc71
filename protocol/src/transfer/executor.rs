//! # Split Executor
//!
//! Turns one token into two: the payment share and the change. The source
//! is burned to a `BURN://` address that commits to the output list, then
//! each output is minted back to this wallet with the burned source as its
//! genesis evidence.
//!
//! ```text
//! source (Confirmed)
//!   │ tx_log: Split/Burning, source -> Pending
//!   ▼
//! burn ──proof──> tx_log: Split/Minting
//!   │
//!   ▼
//! mint[0] (payment share), mint[1] (change) ──proofs──> verify, persist
//!   │
//!   ▼
//! source retired, on_burn(source), tx_log entry removed
//! ```
//!
//! A definitive burn rejection puts the source back to `Confirmed`. Any
//! other failure leaves the source visible as `Pending` with its log entry
//! in place, and [`SplitExecutor::resume`] picks it up again. Every
//! submission after the burn salt is drawn is deterministic, so resuming
//! re-submits identical requests and gets `AlreadyExists` back.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DOMAIN_SPLIT;
use crate::crypto::hash::domain_hash;
use crate::storage::store::{PendingOp, SplitStage, StoreError, TokenStore, TxLogEntry};
use crate::token::object::{
    CoinBalance, Genesis, MintReason, SplitOutput, TokenError, TokenId, TokenKind, TokenObject,
    TokenState,
};
use crate::token::owned::{Token, TokenStatus};
use crate::token::predicate::Address;
use crate::token::Amount;
use crate::transfer::calculator::SplitSpec;
use crate::transfer::network::{submit_and_confirm, CommitError, ProofPolling, TransitionNetwork};
use crate::transfer::payload::Recipient;
use crate::transfer::signer::{CommitmentSigner, SignerError};

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("invalid split: {0}")]
    InvalidPlan(String),

    #[error("token {0} changed since the plan was computed")]
    StalePlan(TokenId),

    #[error("split would not conserve value: inputs {inputs}, outputs {outputs}")]
    Conservation { inputs: Amount, outputs: Amount },

    #[error("burn failed: {0}")]
    Burn(CommitError),

    #[error("mint of output {token_id} failed: {source}")]
    Mint {
        token_id: TokenId,
        #[source]
        source: CommitError,
    },

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SplitError {
    /// True if the source token is still `Pending` with a log entry that
    /// [`SplitExecutor::resume`] can drive to completion.
    pub fn is_in_flight(&self) -> bool {
        match self {
            SplitError::Burn(e) => !e.is_definitive(),
            SplitError::Mint { .. } => true,
            _ => false,
        }
    }
}

/// Outcome of a completed split. Both shares are persisted as `Confirmed`
/// tokens of this wallet; the source is retired.
#[derive(Debug, Clone)]
pub struct SplitResult {
    pub burned: TokenId,
    /// Carries the split amount. Meant for `recipient`.
    pub recipient_share: Token,
    /// Carries the remainder. Stays here.
    pub sender_share: Token,
    pub recipient: Recipient,
}

pub struct SplitExecutor {
    signer: Arc<CommitmentSigner>,
    network: Arc<dyn TransitionNetwork>,
    store: Arc<TokenStore>,
    clock: Arc<dyn Clock>,
    polling: ProofPolling,
}

impl SplitExecutor {
    pub fn new(
        signer: Arc<CommitmentSigner>,
        network: Arc<dyn TransitionNetwork>,
        store: Arc<TokenStore>,
        clock: Arc<dyn Clock>,
        polling: ProofPolling,
    ) -> Self {
        Self {
            signer,
            network,
            store,
            clock,
            polling,
        }
    }

    /// Executes the split in `split`. `on_burn` is called exactly once with
    /// the source token ID, after the outputs are persisted and before this
    /// returns.
    pub async fn execute<F>(
        &self,
        split: &SplitSpec,
        recipient: &Recipient,
        mut on_burn: F,
    ) -> Result<SplitResult, SplitError>
    where
        F: FnMut(TokenId) + Send,
    {
        let source_id = split.token.token_id();
        if split.split_amount.is_zero() || split.remainder_amount.is_zero() {
            return Err(SplitError::InvalidPlan(
                "both split shares must be non-zero".into(),
            ));
        }
        let inputs = split.token.amount().clone();
        let outputs_total = &split.split_amount + &split.remainder_amount;
        if outputs_total != inputs {
            return Err(SplitError::Conservation {
                inputs,
                outputs: outputs_total,
            });
        }
        if matches!(recipient.address, Address::Burn(_)) {
            return Err(SplitError::InvalidPlan("cannot pay to a burn address".into()));
        }

        let current = self
            .store
            .get(&source_id)?
            .filter(|t| t.status == TokenStatus::Confirmed && t.serialized() == split.token.serialized())
            .ok_or(SplitError::StalePlan(source_id))?;

        let burn_salt = CommitmentSigner::fresh_salt();
        let outputs = vec![
            SplitOutput {
                token_id: TokenId::for_split_output(&source_id, &burn_salt, 0),
                amount: split.split_amount.clone(),
            },
            SplitOutput {
                token_id: TokenId::for_split_output(&source_id, &burn_salt, 1),
                amount: split.remainder_amount.clone(),
            },
        ];
        let burn = self.signer.create_transfer(
            current.object(),
            Address::Burn(SplitOutput::commitment(&outputs)),
            burn_salt,
            None,
        )?;

        let entry = TxLogEntry {
            id: Uuid::new_v4(),
            created_at: self.clock.now(),
            op: PendingOp::Split {
                source_token_id: source_id,
                burn,
                outputs,
                recipient: recipient.clone(),
                stage: SplitStage::Burning,
            },
        };
        self.store.log_put(&entry)?;
        self.store.set_status(&source_id, TokenStatus::Pending)?;
        info!(
            token_id = %source_id,
            split_amount = %split.split_amount,
            remainder = %split.remainder_amount,
            "split started"
        );

        self.drive(entry, &mut on_burn).await
    }

    /// Continues a split from its persisted log entry.
    pub async fn resume<F>(&self, entry: TxLogEntry, mut on_burn: F) -> Result<SplitResult, SplitError>
    where
        F: FnMut(TokenId) + Send,
    {
        self.drive(entry, &mut on_burn).await
    }

    async fn drive<F>(&self, mut entry: TxLogEntry, on_burn: &mut F) -> Result<SplitResult, SplitError>
    where
        F: FnMut(TokenId) + Send,
    {
        let PendingOp::Split {
            source_token_id,
            burn,
            outputs,
            recipient,
            stage,
        } = entry.op.clone()
        else {
            return Err(SplitError::InvalidPlan("log entry is not a split".into()));
        };

        let Some(source) = self.store.get(&source_token_id)? else {
            return self.finish_from_store(&entry, source_token_id, &outputs, recipient);
        };

        let burn_tx = match stage {
            SplitStage::Minting { burn } => burn,
            SplitStage::Burning => {
                let confirmed =
                    submit_and_confirm(self.network.as_ref(), &burn.submit_request(), &self.polling)
                        .await
                        .and_then(|proof| Ok(burn.clone().into_transaction(proof)?));
                match confirmed {
                    Ok(tx) => {
                        if let PendingOp::Split { stage, .. } = &mut entry.op {
                            *stage = SplitStage::Minting { burn: tx.clone() };
                        }
                        self.store.log_put(&entry)?;
                        tx
                    }
                    Err(e) if e.is_definitive() => {
                        warn!(token_id = %source_token_id, error = %e, "burn rejected, token restored");
                        self.store.set_status(&source_token_id, TokenStatus::Confirmed)?;
                        self.store.log_remove(&entry.id)?;
                        return Err(SplitError::Burn(e));
                    }
                    Err(e) => {
                        warn!(token_id = %source_token_id, error = %e, "burn outcome unknown, left in flight");
                        return Err(SplitError::Burn(e));
                    }
                }
            }
        };

        let coin_id = source
            .coin_id()
            .ok_or_else(|| SplitError::InvalidPlan("source token carries no coins".into()))?;
        let burned_object = source
            .object()
            .with_transfer(burn_tx, source.object().state.clone());

        let mut minted = Vec::with_capacity(outputs.len());
        for (index, output) in outputs.iter().enumerate() {
            let commitment = self.signer.create_mint(
                output.token_id,
                TokenKind::Fungible,
                Some(CoinBalance {
                    coin_id,
                    amount: output.amount.clone(),
                }),
                MintReason::Split {
                    source: Box::new(burned_object.clone()),
                    outputs: outputs.clone(),
                },
                mint_salt(&burn.data.salt, index),
            );
            let proof = submit_and_confirm(
                self.network.as_ref(),
                &commitment.submit_request(),
                &self.polling,
            )
            .await
            .map_err(|source| {
                warn!(token_id = %output.token_id, error = %source, "split mint failed, left in flight");
                SplitError::Mint {
                    token_id: output.token_id,
                    source,
                }
            })?;
            let object = TokenObject {
                genesis: Genesis {
                    data: commitment.data,
                    inclusion_proof: proof,
                },
                transactions: Vec::new(),
                state: TokenState::new(self.signer.unmasked_predicate()),
            };
            minted.push(Token::from_object(object, self.clock.now())?);
        }

        // Local conservation check before anything is persisted.
        let produced: Amount = minted.iter().map(|t| t.amount()).sum();
        if &produced != source.amount() {
            return Err(SplitError::Conservation {
                inputs: source.amount().clone(),
                outputs: produced,
            });
        }

        for token in &minted {
            self.store.put(token)?;
        }
        self.store
            .retire(&source_token_id, TokenStatus::Burned, self.clock.now())?;
        self.store.log_remove(&entry.id)?;
        on_burn(source_token_id);

        let mut shares = minted.into_iter();
        let (Some(recipient_share), Some(sender_share)) = (shares.next(), shares.next()) else {
            return Err(SplitError::InvalidPlan("split must produce two outputs".into()));
        };
        info!(
            burned = %source_token_id,
            payment = %recipient_share.amount(),
            change = %sender_share.amount(),
            "split completed"
        );
        Ok(SplitResult {
            burned: source_token_id,
            recipient_share,
            sender_share,
            recipient,
        })
    }

    /// The source is already gone: an earlier run got as far as retiring
    /// it. If both outputs are stored, the split is done.
    fn finish_from_store(
        &self,
        entry: &TxLogEntry,
        source_token_id: TokenId,
        outputs: &[SplitOutput],
        recipient: Recipient,
    ) -> Result<SplitResult, SplitError> {
        let mut stored = Vec::with_capacity(outputs.len());
        for output in outputs {
            match self.store.get(&output.token_id)? {
                Some(token) => stored.push(token),
                None => return Err(SplitError::StalePlan(source_token_id)),
            }
        }
        self.store.log_remove(&entry.id)?;
        let mut shares = stored.into_iter();
        let (Some(recipient_share), Some(sender_share)) = (shares.next(), shares.next()) else {
            return Err(SplitError::InvalidPlan("split must produce two outputs".into()));
        };
        Ok(SplitResult {
            burned: source_token_id,
            recipient_share,
            sender_share,
            recipient,
        })
    }
}

/// Mint salts derive from the burn salt so a resumed split re-submits
/// byte-identical mint requests.
fn mint_salt(burn_salt: &[u8; 32], index: usize) -> [u8; 32] {
    domain_hash(
        DOMAIN_SPLIT,
        &[b"mint-salt", burn_salt, &(index as u64).to_le_bytes()],
    )
}
