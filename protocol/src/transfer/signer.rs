//! # Commitment Signer
//!
//! The only component that touches the wallet secret. It builds and signs
//! every commitment the wallet submits, and derives the owner predicates
//! the wallet receives into.
//!
//! Given the same inputs (including the salt) the signer produces the same
//! commitment byte for byte: Ed25519 signing is deterministic and nonces
//! are derived, not drawn. That makes a retried finalization submit the
//! identical request, which the network answers with "already exists".

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::config::{DOMAIN_NONCE, SALT_LENGTH};
use crate::crypto::hash::keyed_hash;
use crate::crypto::keys::{PublicKey, WalletKeypair};
use crate::token::amount::CoinId;
use crate::token::object::{CoinBalance, MintReason, TokenId, TokenKind, TokenObject, TokenState};
use crate::token::predicate::{Address, Predicate};
use crate::token::Amount;
use crate::transfer::commitment::{
    Authenticator, FinalizeCommitment, FinalizeData, MintCommitment, MintData, TransactionData,
    TransferCommitment, TransferTransaction,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("token {0} is not owned by this wallet")]
    NotOwner(TokenId),

    #[error("token {0} is not a nametag")]
    NotANametag(TokenId),

    #[error("nametag does not bind the transfer's proxy address")]
    NametagMismatch,
}

pub struct CommitmentSigner {
    keypair: WalletKeypair,
}

impl CommitmentSigner {
    pub fn new(keypair: WalletKeypair) -> Self {
        Self { keypair }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn unmasked_predicate(&self) -> Predicate {
        Predicate::unmasked(self.public_key())
    }

    /// The wallet's stable receiving address.
    pub fn direct_address(&self) -> Address {
        self.unmasked_predicate().address()
    }

    /// 32 bytes from the OS RNG.
    pub fn fresh_salt() -> [u8; SALT_LENGTH] {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Owner nonce for a transfer received under `salt`. Keyed by the wallet
    /// secret, so only this wallet can derive it, and stable across retries.
    pub fn derive_nonce(&self, salt: &[u8; 32]) -> [u8; 32] {
        let mut input = Vec::with_capacity(DOMAIN_NONCE.len() + salt.len());
        input.extend_from_slice(DOMAIN_NONCE);
        input.extend_from_slice(salt);
        keyed_hash(&self.keypair.secret_key_bytes(), &input)
    }

    pub fn masked_predicate(&self, salt: &[u8; 32]) -> Predicate {
        Predicate::masked(self.public_key(), self.derive_nonce(salt))
    }

    pub fn create_transfer(
        &self,
        token: &TokenObject,
        recipient: Address,
        salt: [u8; 32],
        message: Option<Vec<u8>>,
    ) -> Result<TransferCommitment, SignerError> {
        if !token.is_owned_by(&self.public_key()) {
            return Err(SignerError::NotOwner(token.id()));
        }
        let data = TransactionData {
            token_id: token.id(),
            source_state: token.state.clone(),
            recipient,
            salt,
            message,
        };
        let authenticator = Authenticator::sign(&self.keypair, &data.hash(), token.state.hash());
        Ok(TransferCommitment {
            data,
            authenticator,
        })
    }

    /// Mint to this wallet's direct address.
    pub fn create_mint(
        &self,
        token_id: TokenId,
        kind: TokenKind,
        coins: Option<CoinBalance>,
        reason: MintReason,
        salt: [u8; 32],
    ) -> MintCommitment {
        let data = MintData {
            token_id,
            kind,
            coins,
            recipient: self.direct_address(),
            salt,
            reason,
        };
        let authenticator =
            Authenticator::sign(&self.keypair, &data.hash(), *data.token_id.as_bytes());
        MintCommitment {
            data,
            authenticator,
        }
    }

    /// Convenience for issuing fresh fungible value.
    pub fn create_issuance(&self, coin_id: CoinId, amount: Amount) -> MintCommitment {
        self.create_mint(
            TokenId::random(),
            TokenKind::Fungible,
            Some(CoinBalance { coin_id, amount }),
            MintReason::Issuance,
            Self::fresh_salt(),
        )
    }

    /// Claims a proxy transfer using an owned nametag as witness. Returns the
    /// commitment and the state the token will be in once it is accepted.
    pub fn create_finalize(
        &self,
        transfer: &TransferTransaction,
        nametag: &TokenObject,
    ) -> Result<(FinalizeCommitment, TokenState), SignerError> {
        let name = nametag
            .nametag()
            .ok_or_else(|| SignerError::NotANametag(nametag.id()))?;
        if !nametag.is_owned_by(&self.public_key()) {
            return Err(SignerError::NotOwner(nametag.id()));
        }
        if Address::for_nametag(name) != transfer.data.recipient {
            return Err(SignerError::NametagMismatch);
        }

        let new_state = TokenState::new(self.masked_predicate(&transfer.data.salt));
        let data = FinalizeData {
            token_id: transfer.data.token_id,
            transfer_hash: transfer.hash(),
            nametag_token_id: nametag.id(),
            new_state: new_state.clone(),
        };
        let authenticator = Authenticator::sign(&self.keypair, &data.hash(), nametag.state.hash());
        Ok((
            FinalizeCommitment {
                data,
                authenticator,
            },
            new_state,
        ))
    }
}

impl std::fmt::Debug for CommitmentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommitmentSigner(pub={})", self.public_key().to_hex())
    }
}
