//! # Token Objects
//!
//! A [`TokenObject`] is the self-contained, verifiable form of a token: its
//! genesis (mint + inclusion proof), every transfer it has been through, and
//! its current state. Anyone holding the object can check the whole history
//! offline against the proofs; nobody has to be trusted about the amount.
//!
//! ```text
//! Genesis ──> tx[0] ──> tx[1] ──> ... ──> tx[n-1] ──> state
//!   │           │                            │
//!   recipient   source_state must reach      recipient must match
//!               the previous recipient       the current state
//! ```
//!
//! Split outputs carry the burned source object inside their genesis, so a
//! split token's value is checked against the value that was destroyed to
//! create it.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::{DOMAIN_SPLIT, DOMAIN_STATE};
use crate::crypto::hash::domain_hash;
use crate::crypto::hex_serde;
use crate::crypto::keys::PublicKey;
use crate::token::amount::{Amount, CoinId};
use crate::token::predicate::{Address, Predicate};
use crate::transfer::commitment::{
    canonical_bytes, InclusionProof, MintData, ProofError, TransferTransaction,
};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Consensus-level token identifier, fixed at mint time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(#[serde(with = "hex_serde")] [u8; 32]);

impl TokenId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// ID of the `index`-th output of splitting `source` under `salt`.
    pub fn for_split_output(source: &TokenId, salt: &[u8; 32], index: u32) -> Self {
        Self(domain_hash(
            DOMAIN_SPLIT,
            &[b"output", source.as_bytes(), salt, &index.to_le_bytes()],
        ))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({}..)", &self.to_hex()[..12])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Fungible,
    Nametag,
}

/// Value carried by a fungible token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinBalance {
    pub coin_id: CoinId,
    pub amount: Amount,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenState {
    pub predicate: Predicate,
    #[serde(default, with = "hex_serde::opt_vec")]
    pub data: Option<Vec<u8>>,
}

impl TokenState {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            data: None,
        }
    }

    pub fn hash(&self) -> [u8; 32] {
        let data = self.data.as_deref().unwrap_or_default();
        domain_hash(DOMAIN_STATE, &[&self.predicate.reference(), data])
    }

    pub fn address(&self) -> Address {
        self.predicate.address()
    }
}

// ---------------------------------------------------------------------------
// Genesis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitOutput {
    pub token_id: TokenId,
    pub amount: Amount,
}

impl SplitOutput {
    /// Hash of a full output list. A burn transaction commits to it through
    /// its `BURN://` recipient, so outputs can't be swapped after the fact.
    pub fn commitment(outputs: &[SplitOutput]) -> [u8; 32] {
        domain_hash(DOMAIN_SPLIT, &[b"outputs", &canonical_bytes(&outputs)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MintReason {
    /// Fresh value from an issuer.
    Issuance,
    /// Reissue of part of a burned token.
    Split {
        source: Box<TokenObject>,
        outputs: Vec<SplitOutput>,
    },
    /// A nametag claim. The name is bound to the proxy address it derives.
    Nametag { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
    pub data: MintData,
    pub inclusion_proof: InclusionProof,
}

impl Genesis {
    fn verify(&self) -> Result<(), TokenError> {
        self.inclusion_proof
            .verify(&self.data.request_id(), &self.data.hash())?;
        if self.inclusion_proof.authenticator.state_hash != *self.data.token_id.as_bytes() {
            return Err(TokenError::MintSignature);
        }

        match (&self.data.kind, &self.data.coins, &self.data.reason) {
            (TokenKind::Fungible, Some(_), MintReason::Issuance) => Ok(()),
            (TokenKind::Nametag, None, MintReason::Nametag { name }) => {
                if name.trim().is_empty() {
                    return Err(TokenError::Invalid("empty nametag".into()));
                }
                Ok(())
            }
            (TokenKind::Fungible, Some(coins), MintReason::Split { source, outputs }) => {
                self.verify_split(coins, source, outputs)
            }
            _ => Err(TokenError::Invalid(
                "token kind, coins and mint reason disagree".into(),
            )),
        }
    }

    fn verify_split(
        &self,
        coins: &CoinBalance,
        source: &TokenObject,
        outputs: &[SplitOutput],
    ) -> Result<(), TokenError> {
        let terminal = source.verify_history()?;
        if terminal != Address::Burn(SplitOutput::commitment(outputs)) {
            return Err(TokenError::NotBurned);
        }

        let source_coins = source.coins().ok_or(TokenError::MissingCoins)?;
        if source_coins.coin_id != coins.coin_id {
            return Err(TokenError::CoinMismatch);
        }
        let total: Amount = outputs.iter().map(|o| &o.amount).sum();
        if total != source_coins.amount {
            return Err(TokenError::Conservation {
                inputs: source_coins.amount.clone(),
                outputs: total,
            });
        }
        if !outputs
            .iter()
            .any(|o| o.token_id == self.data.token_id && o.amount == coins.amount)
        {
            return Err(TokenError::NotAnOutput);
        }

        // Only whoever burned the source may mint its outputs.
        let burner = source
            .transactions
            .last()
            .map(|tx| tx.inclusion_proof.authenticator.public_key);
        if burner != Some(self.inclusion_proof.authenticator.public_key) {
            return Err(TokenError::MintSignature);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TokenObject
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("inclusion proof invalid: {0}")]
    Proof(#[from] ProofError),

    #[error("transaction {index} belongs to a different token")]
    WrongToken { index: usize },

    #[error("transaction {index} does not spend the state its predecessor created")]
    BrokenChain { index: usize },

    #[error("current state does not match the last recipient")]
    StateMismatch,

    #[error("token has been burned")]
    Burned,

    #[error("split source was not burned into these outputs")]
    NotBurned,

    #[error("split does not conserve value: inputs {inputs}, outputs {outputs}")]
    Conservation { inputs: Amount, outputs: Amount },

    #[error("token is not among the split outputs")]
    NotAnOutput,

    #[error("mint authenticator is not authorized")]
    MintSignature,

    #[error("coin id differs from the split source")]
    CoinMismatch,

    #[error("token carries no coin balance")]
    MissingCoins,

    #[error("invalid token: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenObject {
    pub genesis: Genesis,
    #[serde(default)]
    pub transactions: Vec<TransferTransaction>,
    pub state: TokenState,
}

impl TokenObject {
    pub fn id(&self) -> TokenId {
        self.genesis.data.token_id
    }

    pub fn kind(&self) -> TokenKind {
        self.genesis.data.kind
    }

    pub fn coins(&self) -> Option<&CoinBalance> {
        self.genesis.data.coins.as_ref()
    }

    pub fn nametag(&self) -> Option<&str> {
        match &self.genesis.data.reason {
            MintReason::Nametag { name } => Some(name),
            _ => None,
        }
    }

    pub fn is_owned_by(&self, key: &PublicKey) -> bool {
        self.state.predicate.is_owned_by(key)
    }

    /// Full verification of a live token: genesis, every transfer, and that
    /// the current state is the one the last transfer pointed at.
    ///
    /// A hop to a `PROXY://` address is settled by the nametag owner's
    /// finalization on the network. The object does not carry that proof,
    /// so the state after a proxy hop is accepted as the finalizer chose it.
    pub fn verify(&self) -> Result<(), TokenError> {
        match self.verify_history()? {
            Address::Burn(_) => Err(TokenError::Burned),
            Address::Proxy(_) => Ok(()),
            direct @ Address::Direct(_) => {
                if self.state.address() != direct {
                    return Err(TokenError::StateMismatch);
                }
                Ok(())
            }
        }
    }

    /// Verifies genesis and the transfer chain, returning the address the
    /// last step sent the token to.
    fn verify_history(&self) -> Result<Address, TokenError> {
        self.genesis.verify()?;

        let mut reached = self.genesis.data.recipient;
        for (index, tx) in self.transactions.iter().enumerate() {
            if tx.data.token_id != self.id() {
                return Err(TokenError::WrongToken { index });
            }
            if !state_reaches(&tx.data.source_state, &reached) {
                return Err(TokenError::BrokenChain { index });
            }
            tx.verify()?;
            reached = tx.data.recipient;
        }
        Ok(reached)
    }

    /// A new object with `tx` appended and ownership moved to `new_state`.
    /// The original is left untouched.
    pub fn with_transfer(&self, tx: TransferTransaction, new_state: TokenState) -> TokenObject {
        let mut next = self.clone();
        next.transactions.push(tx);
        next.state = new_state;
        next
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, TokenError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Proxy hops can land on any state; direct hops must land on the exact
/// predicate the address commits to; nothing leaves a burn.
fn state_reaches(state: &TokenState, address: &Address) -> bool {
    match address {
        Address::Direct(_) => state.address() == *address,
        Address::Proxy(_) => true,
        Address::Burn(_) => false,
    }
}
