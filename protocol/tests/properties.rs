use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use tessera_protocol::clock::{Clock, ManualClock};
use tessera_protocol::crypto::keys::WalletKeypair;
use tessera_protocol::devnet::fixtures::issue_token;
use tessera_protocol::devnet::InMemoryNetwork;
use tessera_protocol::storage::{
    BreakerConfig, CircuitBreaker, CircuitBreakerState, ContentAddress, PointerRecord,
    ResolutionCache, TokenStore, WalletDb,
};
use tessera_protocol::token::{Address, Amount, CoinId, Token};
use tessera_protocol::transfer::{
    CommitmentSigner, ProofPolling, Recipient, SplitCalculator, SplitExecutor, SplitSpec,
};

fn wallet_tokens(signer: &CommitmentSigner, amounts: &[u64]) -> Vec<Token> {
    let coin = CoinId::from_name("UCT");
    amounts.iter().map(|a| issue_token(signer, coin, *a)).collect()
}

/// Token amounts plus a target the wallet can afford.
fn affordable() -> impl Strategy<Value = (Vec<u64>, u64)> {
    prop::collection::vec(1u64..1_000, 1..8).prop_flat_map(|amounts| {
        let total: u64 = amounts.iter().sum();
        (Just(amounts), 1..=total)
    })
}

#[derive(Debug, Clone, Copy)]
enum BreakerOp {
    StorageFailure,
    StorageSuccess,
    Conflict,
    MergeSuccess,
}

fn breaker_op() -> impl Strategy<Value = BreakerOp> {
    prop_oneof![
        Just(BreakerOp::StorageFailure),
        Just(BreakerOp::StorageSuccess),
        Just(BreakerOp::Conflict),
        Just(BreakerOp::MergeSuccess),
    ]
}

fn apply(breaker: &CircuitBreaker, op: BreakerOp) {
    match op {
        BreakerOp::StorageFailure => {
            breaker.record_storage_failure();
        }
        BreakerOp::StorageSuccess => breaker.record_storage_success(),
        BreakerOp::Conflict => {
            breaker.record_conflict();
        }
        BreakerOp::MergeSuccess => breaker.record_merge_success(),
    }
}

fn manual_breaker() -> (Arc<ManualClock>, CircuitBreaker) {
    let clock = Arc::new(ManualClock::starting_now());
    let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
    (clock, breaker)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn plans_pay_exactly_the_target((amounts, target) in affordable()) {
        let signer = CommitmentSigner::new(WalletKeypair::generate());
        let tokens = wallet_tokens(&signer, &amounts);
        let target = Amount::from(target);

        let plan = SplitCalculator::default()
            .plan(&tokens, &target, &CoinId::from_name("UCT"))
            .expect("affordable target has a plan");

        let split_amount = plan.split.as_ref().map(|s| s.split_amount.clone()).unwrap_or_default();
        prop_assert_eq!(&plan.direct_total() + &split_amount, target);
        if let Some(split) = &plan.split {
            prop_assert!(!split.split_amount.is_zero());
            prop_assert!(!split.remainder_amount.is_zero());
            prop_assert_eq!(&split.split_amount + &split.remainder_amount, split.token.amount().clone());
            prop_assert!(plan.direct.iter().all(|t| t.token_id() != split.token.token_id()));
        }
    }

    #[test]
    fn unaffordable_targets_have_no_plan(
        amounts in prop::collection::vec(1u64..1_000, 0..6),
        excess in 1u64..1_000,
    ) {
        let signer = CommitmentSigner::new(WalletKeypair::generate());
        let tokens = wallet_tokens(&signer, &amounts);
        let target = Amount::from(amounts.iter().sum::<u64>() + excess);
        prop_assert!(SplitCalculator::default()
            .plan(&tokens, &target, &CoinId::from_name("UCT"))
            .is_none());
    }

    #[test]
    fn plans_ignore_input_order((amounts, target) in affordable()) {
        let signer = CommitmentSigner::new(WalletKeypair::generate());
        let tokens = wallet_tokens(&signer, &amounts);
        let mut reversed = tokens.clone();
        reversed.reverse();
        let coin = CoinId::from_name("UCT");
        let target = Amount::from(target);

        let calculator = SplitCalculator::default();
        prop_assert_eq!(
            calculator.plan(&tokens, &target, &coin),
            calculator.plan(&reversed, &target, &coin)
        );
    }

    #[test]
    fn breaker_enters_local_at_the_failure_threshold(
        prefix in prop::collection::vec(breaker_op(), 0..20),
    ) {
        let (_clock, breaker) = manual_breaker();
        for op in prefix {
            apply(&breaker, op);
        }
        for _ in 0..BreakerConfig::default().storage_failure_threshold {
            breaker.record_storage_failure();
        }
        prop_assert!(breaker.is_local_mode_active());
    }

    #[test]
    fn breaker_stays_normal_below_thresholds(
        rounds in prop::collection::vec((0u32..10, 0u32..5), 1..20),
    ) {
        let (_clock, breaker) = manual_breaker();
        for (failures, conflicts) in rounds {
            for _ in 0..failures {
                breaker.record_storage_failure();
            }
            for _ in 0..conflicts {
                breaker.record_conflict();
            }
            breaker.record_storage_success();
            breaker.record_merge_success();
        }
        prop_assert!(!breaker.is_local_mode_active());
    }

    #[test]
    fn full_sync_success_clears_everything(
        ops in prop::collection::vec(breaker_op(), 0..40),
        hours in 0u64..3,
    ) {
        let (clock, breaker) = manual_breaker();
        for op in ops {
            apply(&breaker, op);
        }
        clock.advance(chrono::Duration::hours(hours as i64));
        breaker.record_full_sync_success();
        prop_assert_eq!(breaker.state(), CircuitBreakerState::default());
        prop_assert!(!breaker.is_local_mode_active());
    }

    #[test]
    fn cache_keeps_the_highest_sequence(
        sequences in prop::collection::vec(0u64..50, 1..20),
    ) {
        let keypair = WalletKeypair::generate();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let cache = ResolutionCache::new(Duration::from_secs(60), Duration::from_secs(30), 8, clock);

        let mut highest = 0;
        for seq in &sequences {
            let record = PointerRecord::sign(
                &keypair,
                ContentAddress::for_content(&seq.to_be_bytes()),
                *seq,
            );
            let name = record.name.clone();
            cache.offer(record);
            highest = highest.max(*seq);
            prop_assert_eq!(cache.sequence(&name), Some(highest));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn splits_conserve_value(amount in 2u64..10_000, pay_fraction in 1u64..100) {
        let pay = (amount * pay_fraction / 100).clamp(1, amount - 1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (source, result, balance) = runtime.block_on(async {
            let signer = Arc::new(CommitmentSigner::new(WalletKeypair::generate()));
            let store = Arc::new(TokenStore::new(WalletDb::open_temporary().unwrap()));
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
            let executor = SplitExecutor::new(
                signer.clone(),
                Arc::new(InMemoryNetwork::new()),
                store.clone(),
                clock,
                ProofPolling {
                    interval: Duration::from_millis(1),
                    timeout: Duration::from_millis(200),
                },
            );

            let coin = CoinId::from_name("UCT");
            let source = issue_token(&signer, coin, amount);
            store.put(&source).unwrap();
            let split = SplitSpec {
                token: source.clone(),
                split_amount: Amount::from(pay),
                remainder_amount: Amount::from(amount - pay),
            };
            let result = executor
                .execute(&split, &Recipient::new("bob", Address::Direct([7u8; 32])), |_| {})
                .await
                .unwrap();
            (source, result, store.balance(&coin).unwrap())
        });

        prop_assert_eq!(result.burned, source.token_id());
        prop_assert_eq!(result.recipient_share.amount().clone(), Amount::from(pay));
        prop_assert_eq!(
            result.recipient_share.amount() + result.sender_share.amount(),
            source.amount().clone()
        );
        prop_assert_eq!(balance, Amount::from(amount));
    }
}
