//! # Predicates and Addresses
//!
//! A token's state carries a [`Predicate`]: the condition its next spender
//! must satisfy. Every predicate here is a signature check against one
//! Ed25519 key, in two flavours:
//!
//! - **Unmasked**: nonce is all zeros. The resulting address is stable for
//!   the key, which makes it the wallet's public receiving address.
//! - **Masked**: nonce is a 32-byte value, so each state gets a one-time
//!   address that can't be linked back to the key by observers.
//!
//! An [`Address`] is what a sender points a transfer at. There are three
//! schemes:
//!
//! ```text
//! DIRECT://<hex>  hash of a concrete predicate
//! PROXY://<hex>   hash of a nametag; the nametag's owner finalizes the transfer
//! BURN://<hex>    hash of the split outputs a burned token is reissued into
//! ```

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::config::{DOMAIN_NAMETAG, DOMAIN_PREDICATE};
use crate::crypto::hash::domain_hash;
use crate::crypto::hex_serde;
use crate::crypto::keys::PublicKey;

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredicateKind {
    Unmasked,
    Masked,
}

impl PredicateKind {
    fn tag(self) -> u8 {
        match self {
            PredicateKind::Unmasked => 0x01,
            PredicateKind::Masked => 0x02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub kind: PredicateKind,
    pub public_key: PublicKey,
    #[serde(with = "hex_serde")]
    pub nonce: [u8; 32],
}

impl Predicate {
    pub fn unmasked(public_key: PublicKey) -> Self {
        Self {
            kind: PredicateKind::Unmasked,
            public_key,
            nonce: [0u8; 32],
        }
    }

    pub fn masked(public_key: PublicKey, nonce: [u8; 32]) -> Self {
        Self {
            kind: PredicateKind::Masked,
            public_key,
            nonce,
        }
    }

    /// Canonical hash of the predicate. This is what a direct address commits to.
    pub fn reference(&self) -> [u8; 32] {
        domain_hash(
            DOMAIN_PREDICATE,
            &[&[self.kind.tag()], self.public_key.as_bytes(), &self.nonce],
        )
    }

    pub fn address(&self) -> Address {
        Address::Direct(self.reference())
    }

    pub fn is_owned_by(&self, key: &PublicKey) -> bool {
        &self.public_key == key
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressScheme {
    Direct,
    Proxy,
    Burn,
}

impl AddressScheme {
    fn prefix(self) -> &'static str {
        match self {
            AddressScheme::Direct => "DIRECT://",
            AddressScheme::Proxy => "PROXY://",
            AddressScheme::Burn => "BURN://",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    Direct([u8; 32]),
    Proxy([u8; 32]),
    Burn([u8; 32]),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("unknown address scheme in {0:?}")]
    UnknownScheme(String),

    #[error("malformed address body in {0:?}")]
    MalformedBody(String),
}

impl Address {
    /// The proxy address bound to a nametag. Nametags are case-insensitive
    /// and surrounding whitespace is ignored.
    pub fn for_nametag(name: &str) -> Self {
        let normalized = normalize_nametag(name);
        Address::Proxy(domain_hash(DOMAIN_NAMETAG, &[normalized.as_bytes()]))
    }

    pub fn scheme(&self) -> AddressScheme {
        match self {
            Address::Direct(_) => AddressScheme::Direct,
            Address::Proxy(_) => AddressScheme::Proxy,
            Address::Burn(_) => AddressScheme::Burn,
        }
    }

    pub fn body(&self) -> &[u8; 32] {
        match self {
            Address::Direct(b) | Address::Proxy(b) | Address::Burn(b) => b,
        }
    }
}

/// Lowercases and trims a nametag, dropping an optional leading `@`.
pub fn normalize_nametag(name: &str) -> String {
    name.trim().trim_start_matches('@').to_lowercase()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scheme().prefix(), hex::encode(self.body()))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = self.to_string();
        let cut = full.len().min(self.scheme().prefix().len() + 12);
        write!(f, "Address({}..)", &full[..cut])
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, body) = [AddressScheme::Direct, AddressScheme::Proxy, AddressScheme::Burn]
            .into_iter()
            .find_map(|scheme| s.strip_prefix(scheme.prefix()).map(|body| (scheme, body)))
            .ok_or_else(|| AddressError::UnknownScheme(s.to_string()))?;

        let bytes = hex::decode(body).map_err(|_| AddressError::MalformedBody(s.to_string()))?;
        let body: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::MalformedBody(s.to_string()))?;

        Ok(match scheme {
            AddressScheme::Direct => Address::Direct(body),
            AddressScheme::Proxy => Address::Proxy(body),
            AddressScheme::Burn => Address::Burn(body),
        })
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
