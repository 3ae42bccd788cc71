//! # Token Registry
//!
//! Display metadata for coins: symbol, name, decimals. The registry is a
//! read-only collaborator and is never consulted for correctness. Amounts
//! are always integers in the smallest unit; `decimals` only decides where
//! the UI puts the dot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::token::amount::{Amount, CoinId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDefinition {
    /// Trading symbol / ticker (e.g., "UCT").
    pub symbol: String,
    /// Human-readable name.
    pub name: String,
    /// Number of decimal places for display purposes.
    ///
    /// A coin with `decimals = 2` and raw amount `12345` displays as
    /// `123.45`. The engine never divides.
    pub decimals: u8,
}

pub trait TokenRegistry: Send + Sync {
    fn get_definition(&self, coin_id: &CoinId) -> Option<TokenDefinition>;
}

/// Fixed in-memory registry, populated at startup.
#[derive(Default)]
pub struct StaticTokenRegistry {
    definitions: RwLock<HashMap<CoinId, TokenDefinition>>,
}

impl StaticTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, coin_id: CoinId, definition: TokenDefinition) {
        self.definitions.write().insert(coin_id, definition);
    }

    /// Builder-style registration keyed by `CoinId::from_name(symbol)`.
    pub fn with_symbol(self, symbol: &str, name: &str, decimals: u8) -> Self {
        self.register(
            CoinId::from_name(symbol),
            TokenDefinition {
                symbol: symbol.to_string(),
                name: name.to_string(),
                decimals,
            },
        );
        self
    }
}

impl TokenRegistry for StaticTokenRegistry {
    fn get_definition(&self, coin_id: &CoinId) -> Option<TokenDefinition> {
        self.definitions.read().get(coin_id).cloned()
    }
}

/// Renders an integer amount with `decimals` fractional digits, trimming
/// trailing zeros. `format_amount(12345, 2) == "123.45"`.
pub fn format_amount(amount: &Amount, decimals: u8) -> String {
    let digits = amount.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }

    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}
