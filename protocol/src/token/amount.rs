//! Token amounts and coin identifiers.
//!
//! Amounts are arbitrary-precision unsigned integers in the coin's smallest
//! unit. No floating point, no implicit decimals: the `decimals` field of a
//! [`TokenDefinition`](super::registry::TokenDefinition) is display-only.
//! On the wire an amount is a decimal string, because JSON numbers stop
//! being exact at 2^53.

use num_bigint::BigUint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use crate::crypto::hash::blake3_hash;
use crate::crypto::hex_serde;

// ---------------------------------------------------------------------------
// Amount
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(BigUint);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount: {0:?}")]
pub struct ParseAmountError(pub String);

impl Amount {
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// `self - rhs`, or `None` if that would go negative.
    pub fn checked_sub(&self, rhs: &Amount) -> Option<Amount> {
        if self.0 >= rhs.0 {
            Some(Amount(&self.0 - &rhs.0))
        } else {
            None
        }
    }

    /// Little-endian magnitude bytes. Canonical: no trailing zero bytes,
    /// and zero encodes as a single `0x00`.
    pub fn to_bytes_le(&self) -> Vec<u8> {
        self.0.to_bytes_le()
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Self(BigUint::from(v))
    }
}

impl From<u128> for Amount {
    fn from(v: u128) -> Self {
        Self(BigUint::from(v))
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for &'a Amount {
    type Output = Amount;

    fn add(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::zero(), |acc, a| acc + a)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.fold(Amount::zero(), |acc, a| &acc + a)
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Digits only. `BigUint::from_str` would also accept a leading `+`.
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError(s.to_string()));
        }
        BigUint::from_str(s)
            .map(Amount)
            .map_err(|_| ParseAmountError(s.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// CoinId
// ---------------------------------------------------------------------------

/// Identifies an asset class. Tokens with the same `CoinId` are fungible
/// with each other and can be combined or split.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoinId(#[serde(with = "hex_serde")] [u8; 32]);

impl CoinId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives a coin ID from a ticker-like name. Convenient for devnets and
    /// tests; production coin IDs come from the issuer.
    pub fn from_name(name: &str) -> Self {
        Self(blake3_hash(name.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for CoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for CoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoinId({}..)", &self.to_hex()[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_beyond_u64_survive_json() {
        let big: Amount = "340282366920938463463374607431768211457".parse().unwrap();
        let json = serde_json::to_string(&big).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211457\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, big);
    }

    #[test]
    fn parse_rejects_signs_and_garbage() {
        assert!("".parse::<Amount>().is_err());
        assert!("+5".parse::<Amount>().is_err());
        assert!("-5".parse::<Amount>().is_err());
        assert!("1.5".parse::<Amount>().is_err());
        assert_eq!("007".parse::<Amount>().unwrap(), Amount::from(7u64));
    }

    #[test]
    fn checked_sub_never_goes_negative() {
        let a = Amount::from(30u64);
        let b = Amount::from(100u64);
        assert_eq!(b.checked_sub(&a), Some(Amount::from(70u64)));
        assert_eq!(a.checked_sub(&b), None);
        assert_eq!(a.checked_sub(&a), Some(Amount::zero()));
    }

    #[test]
    fn sum_over_references() {
        let v = vec![Amount::from(1u64), Amount::from(2u64), Amount::from(3u64)];
        let total: Amount = v.iter().sum();
        assert_eq!(total, Amount::from(6u64));
    }

    #[test]
    fn amount_roundtrips_through_bincode() {
        let a = Amount::from(u64::MAX) + Amount::from(1u64);
        let bytes = bincode::serialize(&a).unwrap();
        assert_eq!(bincode::deserialize::<Amount>(&bytes).unwrap(), a);
    }

    #[test]
    fn coin_id_from_name_is_stable() {
        assert_eq!(CoinId::from_name("UCT"), CoinId::from_name("UCT"));
        assert_ne!(CoinId::from_name("UCT"), CoinId::from_name("USDU"));
        let id = CoinId::from_name("UCT");
        assert_eq!(CoinId::from_hex(&id.to_hex()).unwrap(), id);
    }
}
