//! # Hashing Utilities
//!
//! Two hash functions, no more:
//!
//! - **BLAKE3** for everything tessera defines itself: request IDs,
//!   transaction hashes, predicate references, content addresses.
//! - **SHA-256** for content that has to line up with storage gateways
//!   that only speak SHA-256 (see `storage::content`).
//!
//! Most protocol hashes go through [`domain_hash`], which prefixes a domain
//! tag and length-prefixes every part. Two different objects can't be made
//! to hash the same by sliding bytes from one field into the next.

use sha2::{Digest, Sha256};

/// Compute the BLAKE3 hash of the input data.
///
/// # Example
///
/// ```
/// use tessera_protocol::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"tessera");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Compute the SHA-256 hash and return a fixed-size array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Domain-separated BLAKE3 over a list of parts.
///
/// Layout: `domain || (len(part) as u64 LE || part)*`. The length prefix is
/// what makes `["ab", "c"]` and `["a", "bc"]` hash differently.
pub fn domain_hash(domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Keyed BLAKE3. Used to derive per-transfer nonces from the wallet secret
/// without ever exposing the secret itself.
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// Constant-time equality for 32-byte digests.
pub fn digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
