//! In-memory transition network.
//!
//! Records `request_id -> transaction_hash` and hands out proofs, with
//! knobs to make it misbehave: reject the next submission, go offline, or
//! sit on proofs so callers hit their timeout.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::transfer::commitment::{InclusionProof, RequestId, SubmitRequest};
use crate::transfer::network::{NetworkError, SubmitStatus, TransitionNetwork};

#[derive(Default)]
struct Inner {
    records: HashMap<RequestId, InclusionProof>,
    round: u64,
    submissions: u64,
    withhold_proofs: bool,
    reject_next: Option<String>,
    offline: bool,
}

#[derive(Default)]
pub struct InMemoryNetwork {
    inner: Mutex<Inner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, submissions are recorded but proofs are never returned.
    pub fn withhold_proofs(&self, withhold: bool) {
        self.inner.lock().withhold_proofs = withhold;
    }

    /// The next submission is rejected with `reason`.
    pub fn reject_next(&self, reason: &str) {
        self.inner.lock().reject_next = Some(reason.to_string());
    }

    /// While offline every call fails with [`NetworkError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Total submit calls seen, including duplicates.
    pub fn submissions(&self) -> u64 {
        self.inner.lock().submissions
    }

    pub fn is_spent(&self, request_id: &RequestId) -> bool {
        self.inner.lock().records.contains_key(request_id)
    }
}

#[async_trait]
impl TransitionNetwork for InMemoryNetwork {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitStatus, NetworkError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(NetworkError::Unavailable("devnet offline".into()));
        }
        inner.submissions += 1;

        if let Some(reason) = inner.reject_next.take() {
            return Ok(SubmitStatus::Rejected(reason));
        }
        if !request.authenticator.verify(&request.transaction_hash) {
            return Ok(SubmitStatus::Rejected("bad signature".into()));
        }

        if let Some(existing) = inner.records.get(&request.request_id) {
            return Ok(if existing.transaction_hash == request.transaction_hash {
                SubmitStatus::AlreadyExists
            } else {
                SubmitStatus::Conflict
            });
        }

        inner.round += 1;
        let proof = InclusionProof::issue(request, inner.round);
        inner.records.insert(request.request_id, proof);
        Ok(SubmitStatus::Accepted)
    }

    async fn inclusion_proof(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<InclusionProof>, NetworkError> {
        let inner = self.inner.lock();
        if inner.offline {
            return Err(NetworkError::Unavailable("devnet offline".into()));
        }
        if inner.withhold_proofs {
            return Ok(None);
        }
        Ok(inner.records.get(request_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::WalletKeypair;
    use crate::devnet::fixtures::issue_token;
    use crate::token::predicate::Address;
    use crate::token::CoinId;
    use crate::transfer::signer::CommitmentSigner;

    #[tokio::test]
    async fn double_spend_is_a_conflict() {
        let signer = CommitmentSigner::new(WalletKeypair::generate());
        let token = issue_token(&signer, CoinId::from_name("UCT"), 10);
        let to_bob = signer
            .create_transfer(token.object(), Address::Direct([1u8; 32]), [1u8; 32], None)
            .unwrap();
        let to_carol = signer
            .create_transfer(token.object(), Address::Direct([2u8; 32]), [2u8; 32], None)
            .unwrap();

        let network = InMemoryNetwork::new();
        assert_eq!(
            network.submit(&to_bob.submit_request()).await.unwrap(),
            SubmitStatus::Accepted
        );
        assert_eq!(
            network.submit(&to_bob.submit_request()).await.unwrap(),
            SubmitStatus::AlreadyExists
        );
        assert_eq!(
            network.submit(&to_carol.submit_request()).await.unwrap(),
            SubmitStatus::Conflict
        );
        assert_eq!(network.submissions(), 3);
    }

    #[tokio::test]
    async fn offline_network_errors() {
        let network = InMemoryNetwork::new();
        network.set_offline(true);
        let id = RequestId::for_finalization(&[0u8; 32]);
        assert!(network.inclusion_proof(&id).await.is_err());
    }
}
