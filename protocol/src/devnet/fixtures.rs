//! Ready-made tokens for tests and devnets.
//!
//! These mint through [`InclusionProof::issue`] directly instead of going
//! through a network, which is what a devnet's issuer would do anyway.

use chrono::Utc;

use crate::crypto::keys::WalletKeypair;
use crate::token::object::{Genesis, MintReason, TokenId, TokenKind, TokenObject, TokenState};
use crate::token::owned::Token;
use crate::token::{Amount, CoinId};
use crate::transfer::commitment::{InclusionProof, MintCommitment};
use crate::transfer::payload::TransferPayload;
use crate::transfer::signer::CommitmentSigner;

/// Wraps an accepted mint commitment into the object it creates.
pub fn object_from_mint(signer: &CommitmentSigner, commitment: MintCommitment, round: u64) -> TokenObject {
    let inclusion_proof = InclusionProof::issue(&commitment.submit_request(), round);
    TokenObject {
        genesis: Genesis {
            data: commitment.data,
            inclusion_proof,
        },
        transactions: Vec::new(),
        state: TokenState::new(signer.unmasked_predicate()),
    }
}

/// A fresh fungible token of `amount` owned by `signer`.
///
/// # Panics
///
/// Never in practice: the object is built from a valid mint and verifies.
pub fn issue_token(signer: &CommitmentSigner, coin_id: CoinId, amount: u64) -> Token {
    let commitment = signer.create_issuance(coin_id, Amount::from(amount));
    let object = object_from_mint(signer, commitment, 0);
    Token::from_object(object, Utc::now()).expect("freshly issued token verifies")
}

/// A nametag token for `name` owned by `signer`.
///
/// # Panics
///
/// Never in practice: the object is built from a valid mint and verifies.
pub fn nametag_token(signer: &CommitmentSigner, name: &str) -> Token {
    let commitment = signer.create_mint(
        TokenId::random(),
        TokenKind::Nametag,
        None,
        MintReason::Nametag {
            name: name.to_string(),
        },
        CommitmentSigner::fresh_salt(),
    );
    let object = object_from_mint(signer, commitment, 0);
    Token::from_object(object, Utc::now()).expect("freshly minted nametag verifies")
}

/// A finalized direct transfer of a fresh `amount`-unit token from `from`
/// to `to`, packaged the way a sender pushes it through the channel.
///
/// # Panics
///
/// Never in practice: `from` owns the token it just issued.
pub fn transfer_payload(from: &CommitmentSigner, to: &CommitmentSigner, amount: u64) -> TransferPayload {
    let token = issue_token(from, CoinId::from_name("UCT"), amount);
    let commitment = from
        .create_transfer(
            token.object(),
            to.direct_address(),
            CommitmentSigner::fresh_salt(),
            None,
        )
        .expect("issuer owns the token");
    let proof = InclusionProof::issue(&commitment.submit_request(), 1);
    let transfer_tx = commitment
        .into_transaction(proof)
        .expect("proof was issued for this commitment");
    TransferPayload {
        source_token: token.object().clone(),
        transfer_tx,
    }
}

/// A payload between two throwaway wallets.
pub fn sample_payload() -> TransferPayload {
    let from = CommitmentSigner::new(WalletKeypair::generate());
    let to = CommitmentSigner::new(WalletKeypair::generate());
    transfer_payload(&from, &to, 10)
}
