//! # Wallet Tokens
//!
//! [`Token`] is the wallet's view of a token it holds (or held). The
//! serialized [`TokenObject`] JSON is the only source of truth: coin,
//! amount and owner are re-derived from it, after full verification,
//! every time a `Token` is constructed. There is no constructor that takes
//! an amount.
//!
//! Tokens are never mutated in place. A status change or a new owner state
//! produces a new `Token` value and the old one is retired by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::crypto::keys::PublicKey;
use crate::token::amount::{Amount, CoinId};
use crate::token::object::{TokenError, TokenId, TokenKind, TokenObject};

/// Where a token is in its local lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenStatus {
    /// Owned and spendable.
    Confirmed,
    /// A commitment spending it is in flight. Still shown as owned.
    Pending,
    /// Sent away. Kept only until the store retires it.
    Transferred,
    /// Burned by a split.
    Burned,
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenStatus::Confirmed => "confirmed",
            TokenStatus::Pending => "pending",
            TokenStatus::Transferred => "transferred",
            TokenStatus::Burned => "burned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Local identifier for UI lists. Not part of consensus.
    pub id: Uuid,
    pub status: TokenStatus,
    pub received_at: DateTime<Utc>,
    token_id: TokenId,
    kind: TokenKind,
    coin_id: Option<CoinId>,
    amount: Amount,
    object: TokenObject,
    serialized: String,
}

/// On-disk form of a [`Token`]. Only the serialized object and local
/// bookkeeping are stored; everything else is re-derived on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: Uuid,
    pub status: TokenStatus,
    pub received_at: DateTime<Utc>,
    pub serialized: String,
}

impl Token {
    /// Verifies `object` and wraps it as a freshly received token.
    pub fn from_object(object: TokenObject, received_at: DateTime<Utc>) -> Result<Self, TokenError> {
        let serialized = serde_json::to_string(&object)?;
        Self::build(Uuid::new_v4(), TokenStatus::Confirmed, received_at, object, serialized)
    }

    /// Parses and verifies a serialized token object.
    pub fn from_serialized(serialized: &str, received_at: DateTime<Utc>) -> Result<Self, TokenError> {
        let object = TokenObject::from_json(serialized)?;
        Self::build(
            Uuid::new_v4(),
            TokenStatus::Confirmed,
            received_at,
            object,
            serialized.to_string(),
        )
    }

    pub fn from_record(record: TokenRecord) -> Result<Self, TokenError> {
        let object = TokenObject::from_json(&record.serialized)?;
        Self::build(
            record.id,
            record.status,
            record.received_at,
            object,
            record.serialized,
        )
    }

    fn build(
        id: Uuid,
        status: TokenStatus,
        received_at: DateTime<Utc>,
        object: TokenObject,
        serialized: String,
    ) -> Result<Self, TokenError> {
        object.verify()?;
        let (coin_id, amount) = match object.coins() {
            Some(c) => (Some(c.coin_id), c.amount.clone()),
            None => (None, Amount::zero()),
        };
        Ok(Self {
            id,
            status,
            received_at,
            token_id: object.id(),
            kind: object.kind(),
            coin_id,
            amount,
            object,
            serialized,
        })
    }

    pub fn to_record(&self) -> TokenRecord {
        TokenRecord {
            id: self.id,
            status: self.status,
            received_at: self.received_at,
            serialized: self.serialized.clone(),
        }
    }

    /// Same token, different local status.
    pub fn with_status(&self, status: TokenStatus) -> Token {
        Token {
            status,
            ..self.clone()
        }
    }

    pub fn token_id(&self) -> TokenId {
        self.token_id
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn coin_id(&self) -> Option<CoinId> {
        self.coin_id
    }

    pub fn amount(&self) -> &Amount {
        &self.amount
    }

    pub fn object(&self) -> &TokenObject {
        &self.object
    }

    pub fn serialized(&self) -> &str {
        &self.serialized
    }

    pub fn nametag(&self) -> Option<&str> {
        self.object.nametag()
    }

    pub fn is_owned_by(&self, key: &PublicKey) -> bool {
        self.object.is_owned_by(key)
    }

    /// Confirmed fungible tokens of `coin_id`. Nothing else is planned over.
    pub fn is_spendable(&self, coin_id: &CoinId) -> bool {
        self.status == TokenStatus::Confirmed
            && self.kind == TokenKind::Fungible
            && self.coin_id.as_ref() == Some(coin_id)
    }
}
