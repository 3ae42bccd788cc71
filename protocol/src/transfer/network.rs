//! # Transition Network
//!
//! The state-transition network is the only authority on whether a token
//! state has been spent. The engine talks to it through the
//! [`TransitionNetwork`] trait: submit a request, then poll for the
//! inclusion proof.
//!
//! Submissions are idempotent. Re-submitting an identical request reports
//! [`SubmitStatus::AlreadyExists`], which callers treat exactly like
//! `Accepted`. Submitting a *different* transaction for a request ID that
//! is already taken reports [`SubmitStatus::Conflict`]: that is a double
//! spend, and it is final.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{PROOF_POLL_INTERVAL, PROOF_TIMEOUT};
use crate::transfer::commitment::{InclusionProof, ProofError, RequestId, SubmitRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    /// The identical request was recorded before.
    AlreadyExists,
    /// The network refused the request (bad signature, unknown state...).
    Rejected(String),
    /// The request ID is already bound to a different transaction.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("transition network unavailable: {0}")]
    Unavailable(String),

    #[error("transition network returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait TransitionNetwork: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitStatus, NetworkError>;

    /// The proof for `request_id`, or `None` if it has not been included yet.
    async fn inclusion_proof(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<InclusionProof>, NetworkError>;
}

/// Why a commitment did not become final.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("commitment rejected: {0}")]
    Rejected(String),

    #[error("conflicting spend for request {0}")]
    Conflict(RequestId),

    #[error("no inclusion proof for request {0} before the deadline")]
    ProofTimeout(RequestId),

    #[error("network returned an invalid proof: {0}")]
    InvalidProof(#[from] ProofError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl CommitError {
    /// True when the network has definitively refused the commitment. Any
    /// other failure leaves the outcome unknown: it may still be included.
    pub fn is_definitive(&self) -> bool {
        matches!(self, CommitError::Rejected(_) | CommitError::Conflict(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProofPolling {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProofPolling {
    fn default() -> Self {
        Self {
            interval: PROOF_POLL_INTERVAL,
            timeout: PROOF_TIMEOUT,
        }
    }
}

/// Submits `request` and waits for its inclusion proof.
pub async fn submit_and_confirm(
    network: &dyn TransitionNetwork,
    request: &SubmitRequest,
    polling: &ProofPolling,
) -> Result<InclusionProof, CommitError> {
    match network.submit(request).await? {
        SubmitStatus::Accepted | SubmitStatus::AlreadyExists => {}
        SubmitStatus::Rejected(reason) => return Err(CommitError::Rejected(reason)),
        SubmitStatus::Conflict => return Err(CommitError::Conflict(request.request_id)),
    }
    await_inclusion_proof(network, request, polling).await
}

/// Polls for the proof of an already submitted request until it arrives or
/// `polling.timeout` elapses. Transient network errors while polling are
/// logged and retried; the proof itself must match the request exactly.
pub async fn await_inclusion_proof(
    network: &dyn TransitionNetwork,
    request: &SubmitRequest,
    polling: &ProofPolling,
) -> Result<InclusionProof, CommitError> {
    let deadline = Instant::now() + polling.timeout;
    loop {
        match network.inclusion_proof(&request.request_id).await {
            Ok(Some(proof)) => {
                proof.verify(&request.request_id, &request.transaction_hash)?;
                debug!(request_id = %request.request_id, round = proof.round, "inclusion proof received");
                return Ok(proof);
            }
            Ok(None) => {}
            Err(e) => warn!(request_id = %request.request_id, error = %e, "proof poll failed"),
        }

        if Instant::now() + polling.interval > deadline {
            return Err(CommitError::ProofTimeout(request.request_id));
        }
        tokio::time::sleep(polling.interval).await;
    }
}
