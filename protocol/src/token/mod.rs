//! # Tokens
//!
//! The data model of the engine:
//!
//! - [`amount`]: arbitrary-precision [`Amount`] and [`CoinId`].
//! - [`predicate`]: ownership predicates and `DIRECT`/`PROXY`/`BURN` addresses.
//! - [`object`]: the verifiable [`TokenObject`] and its history.
//! - [`owned`]: the wallet's [`Token`] view with local status.
//! - [`registry`]: display-only coin metadata.

pub mod amount;
pub mod object;
pub mod owned;
pub mod predicate;
pub mod registry;

pub use amount::{Amount, CoinId, ParseAmountError};
pub use object::{
    CoinBalance, Genesis, MintReason, SplitOutput, TokenError, TokenId, TokenKind, TokenObject,
    TokenState,
};
pub use owned::{Token, TokenRecord, TokenStatus};
pub use predicate::{normalize_nametag, Address, AddressError, AddressScheme, Predicate, PredicateKind};
pub use registry::{format_amount, StaticTokenRegistry, TokenDefinition, TokenRegistry};
