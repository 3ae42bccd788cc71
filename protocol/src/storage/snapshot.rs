//! # Wallet Snapshots
//!
//! The unit of remote sync: every token and tombstone the wallet knows,
//! JSON-encoded and stored under a content address.
//!
//! ## Merge
//!
//! ```text
//! local ∪ remote by token id
//!   ├─ remote records are re-verified; failures are counted and dropped
//!   ├─ tokens not owned by this wallet are dropped
//!   ├─ same id on both sides: longer history wins, ties keep local
//!   ├─ tombstones: union, latest retired_at per id
//!   └─ a token in exactly a tombstoned state is removed
//! ```
//!
//! Merging is pure; the sync engine decides what to write back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::warn;

use super::store::Tombstone;
use crate::config::SNAPSHOT_FORMAT_VERSION;
use crate::crypto::keys::PublicKey;
use crate::token::object::TokenId;
use crate::token::owned::{Token, TokenRecord, TokenStatus};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported snapshot format version {0}")]
    Version(u16),

    #[error("snapshot belongs to {found}, expected {expected}")]
    Owner { expected: PublicKey, found: PublicKey },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub version: u16,
    pub owner: PublicKey,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub tokens: Vec<TokenRecord>,
    pub tombstones: Vec<Tombstone>,
}

impl WalletSnapshot {
    pub fn build(
        owner: PublicKey,
        sequence: u64,
        created_at: DateTime<Utc>,
        tokens: &[Token],
        tombstones: &[Tombstone],
    ) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            owner,
            sequence,
            created_at,
            tokens: tokens.iter().map(Token::to_record).collect(),
            tombstones: tombstones.to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes and checks the format version and owner.
    pub fn decode(bytes: &[u8], owner: &PublicKey) -> Result<Self, SnapshotError> {
        let snapshot: WalletSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version > SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::Version(snapshot.version));
        }
        if &snapshot.owner != owner {
            return Err(SnapshotError::Owner {
                expected: *owner,
                found: snapshot.owner,
            });
        }
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// The merged token set; what the next snapshot should contain.
    pub tokens: Vec<Token>,
    pub tombstones: Vec<Tombstone>,
    /// Remote tokens the local store does not have, or has a shorter
    /// history for.
    pub incoming: Vec<Token>,
    /// Remote tombstones that are new or newer than the local ones.
    pub incoming_tombstones: Vec<Tombstone>,
    /// Remote records that failed verification or ownership checks.
    pub rejected: usize,
    /// The remote snapshot already holds exactly the merged view.
    pub remote_is_current: bool,
}

impl MergeOutcome {
    pub fn changes_local(&self) -> bool {
        !self.incoming.is_empty() || !self.incoming_tombstones.is_empty()
    }
}

/// Merges the local view with an optional remote snapshot for `owner`.
pub fn merge(
    owner: &PublicKey,
    local_tokens: &[Token],
    local_tombstones: &[Tombstone],
    remote: Option<&WalletSnapshot>,
) -> MergeOutcome {
    let mut rejected = 0usize;
    let mut remote_tokens = Vec::new();
    if let Some(snapshot) = remote {
        for record in &snapshot.tokens {
            let token = match Token::from_record(record.clone()) {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "remote snapshot token failed verification");
                    rejected += 1;
                    continue;
                }
            };
            if !token.is_owned_by(owner) {
                rejected += 1;
                continue;
            }
            // The remote device's in-flight state means nothing here.
            remote_tokens.push(token.with_status(TokenStatus::Confirmed));
        }
    }

    // Tombstones: latest retirement per id.
    let mut tombstones: BTreeMap<TokenId, Tombstone> = local_tombstones
        .iter()
        .map(|t| (t.token_id, t.clone()))
        .collect();
    let mut incoming_tombstones = Vec::new();
    for t in remote.map(|s| s.tombstones.as_slice()).unwrap_or_default() {
        match tombstones.get(&t.token_id) {
            Some(local) if local.retired_at >= t.retired_at => {}
            _ => {
                tombstones.insert(t.token_id, t.clone());
                incoming_tombstones.push(t.clone());
            }
        }
    }
    let buried = |token: &Token| {
        tombstones
            .get(&token.token_id())
            .is_some_and(|t| t.state_hash == token.object().state.hash())
    };

    let mut merged: BTreeMap<TokenId, Token> = local_tokens
        .iter()
        .filter(|t| t.is_owned_by(owner))
        .map(|t| (t.token_id(), t.clone()))
        .collect();
    let mut incoming = Vec::new();
    for token in remote_tokens.iter() {
        if buried(token) {
            continue;
        }
        let take = merged.get(&token.token_id()).map_or(true, |local| {
            token.object().transactions.len() > local.object().transactions.len()
        });
        if take {
            merged.insert(token.token_id(), token.clone());
            incoming.push(token.clone());
        }
    }
    merged.retain(|_, t| !buried(t));

    let fingerprint = |t: &Token| (t.token_id(), t.object().state.hash());
    let remote_live: BTreeSet<_> = remote_tokens
        .iter()
        .filter(|t| !buried(t))
        .map(fingerprint)
        .collect();

    let tokens: Vec<Token> = merged.into_values().collect();
    let tombstones: Vec<Tombstone> = tombstones.into_values().collect();

    let remote_is_current = match remote {
        Some(_) if rejected > 0 || remote_live.len() != remote_tokens.len() => false,
        Some(snapshot) => {
            let merged_set: BTreeSet<_> = tokens.iter().map(fingerprint).collect();
            let remote_stones: BTreeSet<_> = snapshot
                .tombstones
                .iter()
                .map(|t| (t.token_id, t.state_hash))
                .collect();
            let merged_stones: BTreeSet<_> =
                tombstones.iter().map(|t| (t.token_id, t.state_hash)).collect();
            remote_live == merged_set && remote_stones == merged_stones
        }
        None => tokens.is_empty() && tombstones.is_empty(),
    };

    MergeOutcome {
        tokens,
        tombstones,
        incoming,
        incoming_tombstones,
        rejected,
        remote_is_current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::WalletKeypair;
    use crate::devnet::fixtures::issue_token;
    use crate::token::CoinId;
    use crate::transfer::signer::CommitmentSigner;

    fn signer() -> CommitmentSigner {
        CommitmentSigner::new(WalletKeypair::generate())
    }

    fn tombstone(token: &Token) -> Tombstone {
        Tombstone {
            token_id: token.token_id(),
            state_hash: token.object().state.hash(),
            retired_at: Utc::now(),
        }
    }

    #[test]
    fn union_of_disjoint_sides() {
        let s = signer();
        let owner = s.public_key();
        let coin = CoinId::from_name("UCT");
        let local = issue_token(&s, coin, 10);
        let remote_only = issue_token(&s, coin, 20);
        let snap = WalletSnapshot::build(owner, 1, Utc::now(), &[remote_only.clone()], &[]);

        let out = merge(&owner, &[local], &[], Some(&snap));
        assert_eq!(out.tokens.len(), 2);
        assert_eq!(out.incoming.len(), 1);
        assert_eq!(out.incoming[0].token_id(), remote_only.token_id());
        assert!(!out.remote_is_current);
    }

    #[test]
    fn remote_tombstone_removes_local_token() {
        let s = signer();
        let owner = s.public_key();
        let token = issue_token(&s, CoinId::from_name("UCT"), 10);
        let snap = WalletSnapshot::build(owner, 2, Utc::now(), &[], &[tombstone(&token)]);

        let out = merge(&owner, &[token], &[], Some(&snap));
        assert!(out.tokens.is_empty());
        assert_eq!(out.incoming_tombstones.len(), 1);
        assert!(out.remote_is_current);
        assert!(out.changes_local());
    }

    #[test]
    fn local_tombstone_keeps_spent_token_out() {
        let s = signer();
        let owner = s.public_key();
        let token = issue_token(&s, CoinId::from_name("UCT"), 10);
        let snap = WalletSnapshot::build(owner, 2, Utc::now(), &[token.clone()], &[]);

        let out = merge(&owner, &[], &[tombstone(&token)], Some(&snap));
        assert!(out.tokens.is_empty());
        assert!(out.incoming.is_empty());
        assert!(!out.remote_is_current);
    }

    #[test]
    fn foreign_and_forged_tokens_are_rejected() {
        let s = signer();
        let other = signer();
        let owner = s.public_key();
        let foreign = issue_token(&other, CoinId::from_name("UCT"), 10);
        let mut snap = WalletSnapshot::build(owner, 1, Utc::now(), &[foreign], &[]);
        let mut forged = snap.tokens[0].clone();
        forged.serialized = forged.serialized.replace("10", "99");
        snap.tokens.push(forged);

        let out = merge(&owner, &[], &[], Some(&snap));
        assert!(out.tokens.is_empty());
        assert_eq!(out.rejected, 2);
    }

    #[test]
    fn identical_sides_are_current() {
        let s = signer();
        let owner = s.public_key();
        let token = issue_token(&s, CoinId::from_name("UCT"), 10);
        let snap = WalletSnapshot::build(owner, 3, Utc::now(), &[token.clone()], &[]);
        let out = merge(&owner, &[token], &[], Some(&snap));
        assert!(out.remote_is_current);
        assert!(!out.changes_local());
    }

    #[test]
    fn decode_checks_owner_and_version() {
        let s = signer();
        let snap = WalletSnapshot::build(s.public_key(), 1, Utc::now(), &[], &[]);
        let bytes = snap.encode().unwrap();
        assert_eq!(WalletSnapshot::decode(&bytes, &s.public_key()).unwrap(), snap);
        assert!(matches!(
            WalletSnapshot::decode(&bytes, &signer().public_key()),
            Err(SnapshotError::Owner { .. })
        ));

        let mut future = snap;
        future.version = SNAPSHOT_FORMAT_VERSION + 1;
        let bytes = future.encode().unwrap();
        assert!(matches!(
            WalletSnapshot::decode(&bytes, &s.public_key()),
            Err(SnapshotError::Version(_))
        ));
    }
}
