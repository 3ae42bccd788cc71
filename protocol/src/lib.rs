// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera Protocol: Core Library
//!
//! An off-chain token wallet engine. Tokens are self-contained, verifiable
//! objects that the wallet holds locally; a transition network only records
//! which token states have been spent. On top of that this crate moves
//! tokens between peers and keeps a wallet's state durable across devices.
//!
//! ## Architecture
//!
//! - **token**: amounts, addresses, predicates and the token object itself.
//! - **transfer**: commitments, planning and executing splits, sending and
//!   finalizing transfers.
//! - **messaging**: the peer channel. At-least-once in, exactly-once applied.
//! - **storage**: the local sled store, and remote sync through
//!   content-addressed storage nodes behind a circuit breaker.
//! - **events**: typed notifications for UIs and daemons.
//! - **devnet**: in-memory collaborators for tests and local runs.
//! - **wallet**: wires the above together for one identity.
//!
//! ## Ground rules
//!
//! 1. Local state changes only after the network step it depends on has
//!    succeeded.
//! 2. Anything half-done is written down first (the transaction log) so it
//!    can be driven to completion after a crash.
//! 3. Amounts are arbitrary precision. Nothing here does floating point.
//! 4. Public entry points return typed errors; bad input never panics.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod devnet;
pub mod events;
pub mod messaging;
pub mod storage;
pub mod token;
pub mod transfer;
pub mod wallet;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{EventBus, WalletEvent};
pub use wallet::{Collaborators, Wallet, WalletConfig, WalletError, WalletStatus};
