//! # Split Calculator
//!
//! Decides which tokens pay a target amount. Pure: no I/O, no clock, no
//! randomness. Identical inputs give identical plans, because candidates
//! are ordered by `(amount, token_id)` before anything is chosen.
//!
//! Strategy, in order:
//!
//! 1. A single token worth exactly the target.
//! 2. The first combination of up to [`MAX_EXACT_COMBINATION`] whole
//!    tokens summing exactly to the target (small wallets only).
//! 3. Greedy, largest first, taking every token that still fits; whatever
//!    is left is carved out of the smallest unused token big enough to
//!    cover it.
//!
//! Whole tokens never overshoot: the value above the target always comes
//! back as split change, so `sum(direct) + split_amount == target` holds for
//! every plan.

use thiserror::Error;

use crate::config::{MAX_EXACT_COMBINATION, MAX_EXACT_SEARCH_TOKENS};
use crate::token::amount::{Amount, CoinId};
use crate::token::owned::Token;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("no spendable tokens of coin {0}")]
    NoSpendableTokens(CoinId),

    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: Amount, required: Amount },
}

#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub max_exact_combination: usize,
    pub max_exact_search_tokens: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_exact_combination: MAX_EXACT_COMBINATION,
            max_exact_search_tokens: MAX_EXACT_SEARCH_TOKENS,
        }
    }
}

/// One token to be split into a payment share and change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSpec {
    pub token: Token,
    pub split_amount: Amount,
    pub remainder_amount: Amount,
}

/// A computed payment plan. Only valid for the token set it was computed
/// from; recompute after any wallet mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub coin_id: CoinId,
    pub target: Amount,
    pub direct: Vec<Token>,
    pub split: Option<SplitSpec>,
}

impl SplitPlan {
    pub fn direct_total(&self) -> Amount {
        self.direct.iter().map(|t| t.amount()).sum()
    }

    pub fn requires_split(&self) -> bool {
        self.split.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SplitCalculator {
    config: SplitConfig,
}

impl SplitCalculator {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// `None` when the plan can't be made (zero target, nothing owned, or
    /// not enough owned). Use [`try_plan`](Self::try_plan) to tell which.
    pub fn plan(&self, owned: &[Token], target: &Amount, coin_id: &CoinId) -> Option<SplitPlan> {
        self.try_plan(owned, target, coin_id).ok()
    }

    pub fn try_plan(
        &self,
        owned: &[Token],
        target: &Amount,
        coin_id: &CoinId,
    ) -> Result<SplitPlan, PlanError> {
        if target.is_zero() {
            return Err(PlanError::ZeroAmount);
        }

        let mut candidates: Vec<&Token> = owned.iter().filter(|t| t.is_spendable(coin_id)).collect();
        if candidates.is_empty() {
            return Err(PlanError::NoSpendableTokens(*coin_id));
        }
        candidates.sort_by(|a, b| {
            a.amount()
                .cmp(b.amount())
                .then_with(|| a.token_id().cmp(&b.token_id()))
        });

        let available: Amount = candidates.iter().map(|t| t.amount()).sum();
        if &available < target {
            return Err(PlanError::InsufficientFunds {
                available,
                required: target.clone(),
            });
        }

        let plan = |direct: Vec<&Token>, split: Option<SplitSpec>| SplitPlan {
            coin_id: *coin_id,
            target: target.clone(),
            direct: direct.into_iter().cloned().collect(),
            split,
        };

        if let Some(exact) = candidates.iter().find(|t| t.amount() == target) {
            return Ok(plan(vec![*exact], None));
        }

        if candidates.len() <= self.config.max_exact_search_tokens {
            for size in 2..=self.config.max_exact_combination.min(candidates.len()) {
                if let Some(combo) = first_exact_combination(&candidates, size, target) {
                    return Ok(plan(combo, None));
                }
            }
        }

        // Greedy, largest first.
        let mut remaining = target.clone();
        let mut used = vec![false; candidates.len()];
        let mut direct = Vec::new();
        for (i, token) in candidates.iter().enumerate().rev() {
            if remaining.is_zero() {
                break;
            }
            if let Some(rest) = remaining.checked_sub(token.amount()) {
                remaining = rest;
                used[i] = true;
                direct.push(*token);
            }
        }
        if remaining.is_zero() {
            return Ok(plan(direct, None));
        }

        // Every unused token was skipped for being larger than what was
        // left at the time, so the smallest unused one covers the rest.
        let (_, split_token) = candidates
            .iter()
            .enumerate()
            .find(|(i, t)| !used[*i] && t.amount() > &remaining)
            .ok_or_else(|| PlanError::InsufficientFunds {
                available: available.clone(),
                required: target.clone(),
            })?;
        let remainder_amount = split_token
            .amount()
            .checked_sub(&remaining)
            .unwrap_or_default();

        Ok(plan(
            direct,
            Some(SplitSpec {
                token: (*split_token).clone(),
                split_amount: remaining,
                remainder_amount,
            }),
        ))
    }
}

/// First `size`-combination (in index order) summing exactly to `target`.
fn first_exact_combination<'a>(
    candidates: &[&'a Token],
    size: usize,
    target: &Amount,
) -> Option<Vec<&'a Token>> {
    let mut indices: Vec<usize> = (0..size).collect();
    let n = candidates.len();
    loop {
        let sum: Amount = indices.iter().map(|&i| candidates[i].amount()).sum();
        if &sum == target {
            return Some(indices.iter().map(|&i| candidates[i]).collect());
        }

        // Advance to the next combination in lexicographic order.
        let mut pos = size;
        loop {
            if pos == 0 {
                return None;
            }
            pos -= 1;
            if indices[pos] != pos + n - size {
                break;
            }
        }
        indices[pos] += 1;
        for j in pos + 1..size {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::WalletKeypair;
    use crate::devnet::fixtures::issue_token;
    use crate::token::owned::TokenStatus;
    use crate::transfer::signer::CommitmentSigner;

    fn wallet(amounts: &[u64]) -> (Vec<Token>, CoinId) {
        let signer = CommitmentSigner::new(WalletKeypair::generate());
        let coin = CoinId::from_name("UCT");
        let tokens = amounts.iter().map(|&a| issue_token(&signer, coin, a)).collect();
        (tokens, coin)
    }

    fn amounts(tokens: &[Token]) -> Vec<u64> {
        let mut v: Vec<u64> = tokens
            .iter()
            .map(|t| t.amount().to_string().parse().unwrap())
            .collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn exact_single_token_no_split() {
        let (tokens, coin) = wallet(&[100]);
        let plan = SplitCalculator::default()
            .plan(&tokens, &Amount::from(100u64), &coin)
            .unwrap();
        assert_eq!(plan.direct.len(), 1);
        assert!(plan.split.is_none());
    }

    #[test]
    fn partial_amount_splits_the_token() {
        let (tokens, coin) = wallet(&[100]);
        let plan = SplitCalculator::default()
            .plan(&tokens, &Amount::from(30u64), &coin)
            .unwrap();
        assert!(plan.direct.is_empty());
        let split = plan.split.unwrap();
        assert_eq!(split.split_amount, Amount::from(30u64));
        assert_eq!(split.remainder_amount, Amount::from(70u64));
    }

    #[test]
    fn exact_combination_preferred_over_split() {
        let (tokens, coin) = wallet(&[50, 20, 30, 7]);
        let plan = SplitCalculator::default()
            .plan(&tokens, &Amount::from(57u64), &coin)
            .unwrap();
        assert!(plan.split.is_none());
        assert_eq!(amounts(&plan.direct), vec![7, 50]);
    }

    #[test]
    fn greedy_then_split_remainder() {
        let (tokens, coin) = wallet(&[40, 40, 40]);
        let plan = SplitCalculator::default()
            .plan(&tokens, &Amount::from(100u64), &coin)
            .unwrap();
        assert_eq!(plan.direct_total(), Amount::from(80u64));
        let split = plan.split.unwrap();
        assert_eq!(split.split_amount, Amount::from(20u64));
        assert_eq!(split.remainder_amount, Amount::from(20u64));
    }

    #[test]
    fn split_uses_smallest_sufficient_token() {
        let (tokens, coin) = wallet(&[500, 60, 1000]);
        let plan = SplitCalculator::default()
            .plan(&tokens, &Amount::from(55u64), &coin)
            .unwrap();
        assert!(plan.direct.is_empty());
        assert_eq!(plan.split.unwrap().token.amount(), &Amount::from(60u64));
    }

    #[test]
    fn insufficient_funds_distinct_from_no_tokens() {
        let (tokens, coin) = wallet(&[10, 20]);
        let calc = SplitCalculator::default();
        assert!(matches!(
            calc.try_plan(&tokens, &Amount::from(31u64), &coin),
            Err(PlanError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            calc.try_plan(&[], &Amount::from(1u64), &coin),
            Err(PlanError::NoSpendableTokens(_))
        ));
        assert!(calc.plan(&tokens, &Amount::from(31u64), &coin).is_none());
    }

    #[test]
    fn pending_and_foreign_tokens_are_ignored() {
        let (mut tokens, coin) = wallet(&[100, 50]);
        tokens[0] = tokens[0].with_status(TokenStatus::Pending);
        let other = CoinId::from_name("OTHER");
        let calc = SplitCalculator::default();
        assert!(calc.plan(&tokens, &Amount::from(100u64), &coin).is_none());
        assert!(matches!(
            calc.try_plan(&tokens, &Amount::from(1u64), &other),
            Err(PlanError::NoSpendableTokens(_))
        ));
    }

    #[test]
    fn zero_target_is_rejected() {
        let (tokens, coin) = wallet(&[1]);
        assert_eq!(
            SplitCalculator::default().try_plan(&tokens, &Amount::zero(), &coin),
            Err(PlanError::ZeroAmount)
        );
    }

    #[test]
    fn plan_is_deterministic_under_input_order() {
        let (mut tokens, coin) = wallet(&[25, 25, 25, 25, 90]);
        let calc = SplitCalculator::default();
        let a = calc.plan(&tokens, &Amount::from(60u64), &coin).unwrap();
        tokens.reverse();
        let b = calc.plan(&tokens, &Amount::from(60u64), &coin).unwrap();
        assert_eq!(a, b);
    }
}
