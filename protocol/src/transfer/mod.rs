//! # Transfers
//!
//! Commitments, the signer that produces them, the transition network
//! seam, and the orchestration on top: plan, split, send, finalize.

pub mod calculator;
pub mod commitment;
pub mod executor;
pub mod network;
pub mod payload;
pub mod protocol;
pub mod signer;

pub use calculator::{PlanError, SplitCalculator, SplitConfig, SplitPlan, SplitSpec};
pub use commitment::{
    InclusionProof, RequestId, SubmitRequest, TransferCommitment, TransferTransaction,
};
pub use executor::{SplitError, SplitExecutor, SplitResult};
pub use network::{CommitError, NetworkError, ProofPolling, SubmitStatus, TransitionNetwork};
pub use payload::{Recipient, TransferPayload};
pub use protocol::{
    Confirmation, ErrorKind, FinalizeError, RecoveryReport, SentToken, TransferConfig,
    TransferError, TransferProtocol, TransferTarget,
};
pub use signer::{CommitmentSigner, SignerError};
