//! # Commitments, Inclusion Proofs and Transactions
//!
//! A commitment is a signed statement of intent. The transition network
//! only ever sees a [`SubmitRequest`]: the request ID (which state is being
//! spent), the transaction hash (what it is being spent into) and the
//! authenticator (who signed it). Once the network has recorded the pair it
//! hands back an [`InclusionProof`], and commitment plus proof together
//! become a final transaction.
//!
//! ```text
//! TransferCommitment ──submit──> network ──proof──> TransferTransaction
//! MintCommitment     ──submit──> network ──proof──> Genesis
//! FinalizeCommitment ──submit──> network ──proof──> (proxy transfer settled)
//! ```
//!
//! Request IDs are what make double spends detectable: spending the same
//! state twice yields the same request ID with a different transaction
//! hash, and the network refuses the second one.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::{DOMAIN_INCLUSION, DOMAIN_REQUEST_ID, DOMAIN_TRANSACTION};
use crate::crypto::hash::domain_hash;
use crate::crypto::hex_serde;
use crate::crypto::keys::{PublicKey, Signature, WalletKeypair};
use crate::token::object::{CoinBalance, MintReason, TokenId, TokenKind, TokenState};
use crate::token::predicate::Address;

/// Deterministic JSON encoding for hashing. Every type hashed through here
/// is built from structs, enums and vectors only (no maps), so field order
/// is fixed by the type definition.
pub(crate) fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(#[serde(with = "hex_serde")] [u8; 32]);

impl RequestId {
    /// Request ID for spending the state with hash `state_hash`, owned by `key`.
    pub fn for_state(key: &PublicKey, state_hash: &[u8; 32]) -> Self {
        Self(domain_hash(
            DOMAIN_REQUEST_ID,
            &[b"state", key.as_bytes(), state_hash],
        ))
    }

    /// Request ID for minting a token. One mint per token ID, ever.
    pub fn for_mint(token_id: &TokenId) -> Self {
        Self(domain_hash(DOMAIN_REQUEST_ID, &[b"mint", token_id.as_bytes()]))
    }

    /// Request ID for settling a proxy transfer. One finalization per transfer.
    pub fn for_finalization(transfer_hash: &[u8; 32]) -> Self {
        Self(domain_hash(DOMAIN_REQUEST_ID, &[b"finalize", transfer_hash]))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({}..)", &self.to_hex()[..12])
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Signature of the state owner over a transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticator {
    pub public_key: PublicKey,
    pub signature: Signature,
    /// Hash of the state being spent (or the token ID, for mints).
    #[serde(with = "hex_serde")]
    pub state_hash: [u8; 32],
}

impl Authenticator {
    pub fn sign(keypair: &WalletKeypair, transaction_hash: &[u8; 32], state_hash: [u8; 32]) -> Self {
        Self {
            public_key: keypair.public_key(),
            signature: keypair.sign(transaction_hash),
            state_hash,
        }
    }

    pub fn verify(&self, transaction_hash: &[u8; 32]) -> bool {
        self.public_key.verify(transaction_hash, &self.signature)
    }
}

// ---------------------------------------------------------------------------
// SubmitRequest / InclusionProof
// ---------------------------------------------------------------------------

/// What actually goes over the wire to the transition network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub request_id: RequestId,
    #[serde(with = "hex_serde")]
    pub transaction_hash: [u8; 32],
    pub authenticator: Authenticator,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("proof is for request {found}, expected {expected}")]
    RequestIdMismatch { expected: RequestId, found: RequestId },

    #[error("proof commits to a different transaction hash")]
    TransactionHashMismatch,

    #[error("authenticator signature does not verify")]
    BadAuthenticator,

    #[error("inclusion leaf does not match its contents")]
    LeafMismatch,
}

/// Evidence that the network recorded `request_id -> transaction_hash`.
///
/// The leaf binds request, transaction and signature together; tampering
/// with any of them breaks it. Checking the network's own signature over
/// the round root requires the network's trust base, which the engine
/// consumes from the `TransitionNetwork` implementation rather than
/// re-deriving here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    pub request_id: RequestId,
    #[serde(with = "hex_serde")]
    pub transaction_hash: [u8; 32],
    pub authenticator: Authenticator,
    pub round: u64,
    #[serde(with = "hex_serde")]
    pub leaf: [u8; 32],
}

impl InclusionProof {
    /// Builds the proof a network issues for an accepted request.
    pub fn issue(request: &SubmitRequest, round: u64) -> Self {
        Self {
            request_id: request.request_id,
            transaction_hash: request.transaction_hash,
            authenticator: request.authenticator.clone(),
            round,
            leaf: Self::compute_leaf(request),
        }
    }

    fn compute_leaf(request: &SubmitRequest) -> [u8; 32] {
        domain_hash(
            DOMAIN_INCLUSION,
            &[
                request.request_id.as_bytes(),
                &request.transaction_hash,
                request.authenticator.public_key.as_bytes(),
                request.authenticator.signature.as_bytes(),
                &request.authenticator.state_hash,
            ],
        )
    }

    /// Checks that this proof covers exactly `(request_id, transaction_hash)`.
    pub fn verify(
        &self,
        request_id: &RequestId,
        transaction_hash: &[u8; 32],
    ) -> Result<(), ProofError> {
        if &self.request_id != request_id {
            return Err(ProofError::RequestIdMismatch {
                expected: *request_id,
                found: self.request_id,
            });
        }
        if &self.transaction_hash != transaction_hash {
            return Err(ProofError::TransactionHashMismatch);
        }
        if !self.authenticator.verify(transaction_hash) {
            return Err(ProofError::BadAuthenticator);
        }
        let expected_leaf = Self::compute_leaf(&SubmitRequest {
            request_id: self.request_id,
            transaction_hash: self.transaction_hash,
            authenticator: self.authenticator.clone(),
        });
        if expected_leaf != self.leaf {
            return Err(ProofError::LeafMismatch);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// The signed-over body of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    pub token_id: TokenId,
    pub source_state: TokenState,
    pub recipient: Address,
    /// 32 unpredictable bytes. For proxy transfers the recipient derives its
    /// new owner nonce from this value.
    #[serde(with = "hex_serde")]
    pub salt: [u8; 32],
    #[serde(default, with = "hex_serde::opt_vec")]
    pub message: Option<Vec<u8>>,
}

impl TransactionData {
    pub fn hash(&self) -> [u8; 32] {
        let recipient = self.recipient.to_string();
        let message = self.message.as_deref().unwrap_or_default();
        domain_hash(
            DOMAIN_TRANSACTION,
            &[
                b"transfer",
                self.token_id.as_bytes(),
                &self.source_state.hash(),
                recipient.as_bytes(),
                &self.salt,
                message,
            ],
        )
    }

    pub fn request_id(&self) -> RequestId {
        RequestId::for_state(&self.source_state.predicate.public_key, &self.source_state.hash())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCommitment {
    pub data: TransactionData,
    pub authenticator: Authenticator,
}

impl TransferCommitment {
    pub fn request_id(&self) -> RequestId {
        self.data.request_id()
    }

    pub fn transaction_hash(&self) -> [u8; 32] {
        self.data.hash()
    }

    pub fn submit_request(&self) -> SubmitRequest {
        SubmitRequest {
            request_id: self.request_id(),
            transaction_hash: self.transaction_hash(),
            authenticator: self.authenticator.clone(),
        }
    }

    /// Attaches the network's proof, producing a final transaction.
    pub fn into_transaction(
        self,
        proof: InclusionProof,
    ) -> Result<TransferTransaction, ProofError> {
        proof.verify(&self.request_id(), &self.transaction_hash())?;
        Ok(TransferTransaction {
            data: self.data,
            inclusion_proof: proof,
        })
    }
}

/// A transfer the network has accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTransaction {
    pub data: TransactionData,
    pub inclusion_proof: InclusionProof,
}

impl TransferTransaction {
    pub fn hash(&self) -> [u8; 32] {
        self.data.hash()
    }

    /// Verifies the proof and that the spender actually owned the source state.
    pub fn verify(&self) -> Result<(), ProofError> {
        let auth = &self.inclusion_proof.authenticator;
        if !self.data.source_state.predicate.is_owned_by(&auth.public_key)
            || auth.state_hash != self.data.source_state.hash()
        {
            return Err(ProofError::BadAuthenticator);
        }
        self.inclusion_proof
            .verify(&self.data.request_id(), &self.data.hash())
    }
}

// ---------------------------------------------------------------------------
// Mint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintData {
    pub token_id: TokenId,
    pub kind: TokenKind,
    pub coins: Option<CoinBalance>,
    pub recipient: Address,
    #[serde(with = "hex_serde")]
    pub salt: [u8; 32],
    pub reason: MintReason,
}

impl MintData {
    pub fn hash(&self) -> [u8; 32] {
        domain_hash(DOMAIN_TRANSACTION, &[b"mint", &canonical_bytes(self)])
    }

    pub fn request_id(&self) -> RequestId {
        RequestId::for_mint(&self.token_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintCommitment {
    pub data: MintData,
    pub authenticator: Authenticator,
}

impl MintCommitment {
    pub fn submit_request(&self) -> SubmitRequest {
        SubmitRequest {
            request_id: self.data.request_id(),
            transaction_hash: self.data.hash(),
            authenticator: self.authenticator.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy finalization
// ---------------------------------------------------------------------------

/// Settles a transfer sent to a proxy address. Signed by the nametag owner;
/// the nametag token is the witness that the signer may claim the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeData {
    pub token_id: TokenId,
    #[serde(with = "hex_serde")]
    pub transfer_hash: [u8; 32],
    pub nametag_token_id: TokenId,
    pub new_state: TokenState,
}

impl FinalizeData {
    pub fn hash(&self) -> [u8; 32] {
        domain_hash(DOMAIN_TRANSACTION, &[b"finalize", &canonical_bytes(self)])
    }

    pub fn request_id(&self) -> RequestId {
        RequestId::for_finalization(&self.transfer_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeCommitment {
    pub data: FinalizeData,
    pub authenticator: Authenticator,
}

impl FinalizeCommitment {
    pub fn submit_request(&self) -> SubmitRequest {
        SubmitRequest {
            request_id: self.data.request_id(),
            transaction_hash: self.data.hash(),
            authenticator: self.authenticator.clone(),
        }
    }
}
