//! # Cryptographic Primitives
//!
//! Everything security-related in the engine flows through here:
//!
//! - **Ed25519** for commitment signatures. Deterministic, so signing the
//!   same commitment twice yields the same bytes.
//! - **BLAKE3** for request IDs, transaction hashes and content addresses.
//! - **SHA-256** where a storage gateway insists on it.
//!
//! Thin, type-safe wrappers around audited implementations. No novel crypto.

pub mod hash;
pub mod hex_serde;
pub mod keys;

pub use hash::{blake3_hash, domain_hash, keyed_hash, sha256};
pub use keys::{KeyError, PublicKey, Signature, WalletKeypair};
