//! # Content Addresses
//!
//! An address is a codec byte followed by a SHA-256 digest, rendered as
//! base58. Two codecs exist:
//!
//! - [`Codec::Raw`]: the digest is over the bytes themselves. Anyone can
//!   recompute it, so fetched content is always checked.
//! - [`Codec::Wrapped`]: the digest is over the gateway's internal
//!   envelope around the bytes (chunking, framing). The client never sees
//!   that envelope and cannot recompute the digest.
//!
//! ## Trust boundary
//!
//! Wrapped content is **trusted by construction**: whatever the node
//! returns for a wrapped address is accepted without an integrity check.
//! An honest-but-buggy or malicious node can serve arbitrary bytes for a
//! wrapped address. Snapshots published by this engine always use
//! `Raw`; `Wrapped` is only accepted when reading addresses written by
//! other tools. [`ContentAddress::verify`] reports `Trusted` for these so
//! callers can see where the boundary was crossed.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::crypto::hash::{digest_eq, sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Codec {
    Raw,
    Wrapped,
}

impl Codec {
    fn byte(self) -> u8 {
        match self {
            Codec::Raw => 0x55,
            Codec::Wrapped => 0x70,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x55 => Some(Codec::Raw),
            0x70 => Some(Codec::Wrapped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress {
    codec: Codec,
    digest: [u8; 32],
}

/// Outcome of checking fetched bytes against their address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// Not checkable client-side; accepted on the node's word.
    Trusted,
    Mismatch,
}

impl Verification {
    pub fn is_acceptable(self) -> bool {
        !matches!(self, Verification::Mismatch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("content address is not base58: {0}")]
    Encoding(String),
    #[error("content address has the wrong length")]
    Length,
    #[error("unknown codec byte {0:#04x}")]
    Codec(u8),
}

impl ContentAddress {
    /// The raw address of `bytes`.
    pub fn for_content(bytes: &[u8]) -> Self {
        Self {
            codec: Codec::Raw,
            digest: sha256(bytes),
        }
    }

    pub fn wrapped(digest: [u8; 32]) -> Self {
        Self {
            codec: Codec::Wrapped,
            digest,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn verify(&self, bytes: &[u8]) -> Verification {
        match self.codec {
            Codec::Raw if digest_eq(&sha256(bytes), &self.digest) => Verification::Verified,
            Codec::Raw => Verification::Mismatch,
            Codec::Wrapped => Verification::Trusted,
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = Vec::with_capacity(33);
        raw.push(self.codec.byte());
        raw.extend_from_slice(&self.digest);
        f.write_str(&bs58::encode(raw).into_string())
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({self})")
    }
}

impl FromStr for ContentAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressParseError::Encoding(e.to_string()))?;
        let (&codec, digest) = raw.split_first().ok_or(AddressParseError::Length)?;
        let codec = Codec::from_byte(codec).ok_or(AddressParseError::Codec(codec))?;
        let digest: [u8; 32] = digest.try_into().map_err(|_| AddressParseError::Length)?;
        Ok(Self { codec, digest })
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_addresses_verify_their_content() {
        let addr = ContentAddress::for_content(b"snapshot");
        assert_eq!(addr.verify(b"snapshot"), Verification::Verified);
        assert_eq!(addr.verify(b"tampered"), Verification::Mismatch);
    }

    #[test]
    fn wrapped_addresses_are_trusted_not_verified() {
        let addr = ContentAddress::wrapped([7u8; 32]);
        assert_eq!(addr.verify(b"anything"), Verification::Trusted);
        assert!(addr.verify(b"anything").is_acceptable());
    }

    #[test]
    fn string_form_parses_back() {
        let addr = ContentAddress::for_content(b"x");
        let parsed: ContentAddress = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert!("0OIl".parse::<ContentAddress>().is_err());
        assert!(bs58::encode([0x55u8; 5]).into_string().parse::<ContentAddress>().is_err());
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let mut raw = vec![0x01u8];
        raw.extend_from_slice(&[0u8; 32]);
        let s = bs58::encode(raw).into_string();
        assert_eq!(s.parse::<ContentAddress>(), Err(AddressParseError::Codec(0x01)));
    }
}
