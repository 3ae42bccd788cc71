//! Storage node seam and the signed pointer records it serves.
//!
//! A wallet's snapshot lives at a content address; a mutable pointer named
//! after the wallet key points at the current one. Pointer records carry a
//! monotonic sequence number and the owner's signature, so a node can
//! withhold or serve stale records but cannot forge new ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::content::ContentAddress;
use crate::config::DOMAIN_POINTER;
use crate::crypto::hash::domain_hash;
use crate::crypto::keys::{PublicKey, Signature, WalletKeypair};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("node timed out")]
    Timeout,

    #[error("node rejected the request: {0}")]
    Rejected(String),

    #[error("node returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerRecord {
    pub name: String,
    pub address: ContentAddress,
    pub sequence: u64,
    pub owner: PublicKey,
    pub signature: Signature,
}

impl PointerRecord {
    /// The pointer name owned by `key`.
    pub fn name_for(key: &PublicKey) -> String {
        bs58::encode(domain_hash(DOMAIN_POINTER, &[b"name", key.as_bytes()])).into_string()
    }

    pub fn sign(keypair: &WalletKeypair, address: ContentAddress, sequence: u64) -> Self {
        let owner = keypair.public_key();
        let name = Self::name_for(&owner);
        let signature = keypair.sign(&Self::signing_bytes(&name, &address, sequence));
        Self {
            name,
            address,
            sequence,
            owner,
            signature,
        }
    }

    /// True if the record is signed by its owner and the name belongs to
    /// that owner.
    pub fn verify(&self) -> bool {
        self.name == Self::name_for(&self.owner)
            && self.owner.verify(
                &Self::signing_bytes(&self.name, &self.address, self.sequence),
                &self.signature,
            )
    }

    fn signing_bytes(name: &str, address: &ContentAddress, sequence: u64) -> [u8; 32] {
        domain_hash(
            DOMAIN_POINTER,
            &[
                name.as_bytes(),
                address.to_string().as_bytes(),
                &sequence.to_le_bytes(),
            ],
        )
    }
}

/// One content-addressed storage endpoint. Nodes are interchangeable and
/// none is trusted more than another.
#[async_trait]
pub trait StorageNode: Send + Sync {
    fn id(&self) -> &str;

    /// Current record for `name`, or `None` if the node has never seen it.
    async fn resolve(&self, name: &str) -> Result<Option<PointerRecord>, NodeError>;

    /// Bytes at `address`, or `None` if the node doesn't have them.
    async fn fetch(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, NodeError>;

    /// Stores `bytes` and returns the address the node filed them under.
    async fn store(&self, bytes: Vec<u8>) -> Result<ContentAddress, NodeError>;

    /// Publishes a pointer update. Nodes refuse records older than the one
    /// they hold.
    async fn publish(&self, record: &PointerRecord) -> Result<(), NodeError>;
}
