//! End-to-end tests for the tessera engine.
//!
//! Every wallet here is assembled through [`Wallet::open`] against the
//! devnet collaborators: one shared in-memory transition network, a
//! loopback hub for peer messages and, where sync is involved, in-memory
//! storage nodes over a shared backend. Each test builds its own world.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use tessera_protocol::clock::{Clock, ManualClock, SystemClock};
use tessera_protocol::crypto::keys::WalletKeypair;
use tessera_protocol::devnet::fixtures::issue_token;
use tessera_protocol::devnet::{InMemoryNetwork, InMemoryStorageNode, LoopbackHub, StorageBackend};
use tessera_protocol::events::WalletEvent;
use tessera_protocol::messaging::{Disposition, ProcessedState};
use tessera_protocol::storage::node::{PointerRecord, StorageNode};
use tessera_protocol::storage::resolver::{ResolveError, ResolverConfig};
use tessera_protocol::storage::{BreakerMode, WalletDb};
use tessera_protocol::token::predicate::{Address, PredicateKind};
use tessera_protocol::token::registry::StaticTokenRegistry;
use tessera_protocol::token::{Amount, CoinId, TokenStatus};
use tessera_protocol::transfer::network::ProofPolling;
use tessera_protocol::transfer::payload::Recipient;
use tessera_protocol::transfer::protocol::{TransferConfig, TransferTarget};
use tessera_protocol::transfer::signer::CommitmentSigner;
use tessera_protocol::wallet::{Collaborators, Wallet, WalletConfig};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct World {
    network: Arc<InMemoryNetwork>,
    hub: LoopbackHub,
    backend: StorageBackend,
}

/// `RUST_LOG=tessera_protocol=debug cargo test` shows the engine's logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl World {
    fn new() -> Self {
        init_tracing();
        Self {
            network: Arc::new(InMemoryNetwork::new()),
            hub: LoopbackHub::new(),
            backend: StorageBackend::new(),
        }
    }

    fn wallet(&self, peer: &str, keypair: &WalletKeypair, nodes: Vec<Arc<dyn StorageNode>>, clock: Arc<dyn Clock>) -> Wallet {
        Wallet::open(
            keypair.clone(),
            WalletDb::open_temporary().expect("temp db"),
            Collaborators {
                network: self.network.clone(),
                transport: self.hub.endpoint(peer),
                storage_nodes: nodes,
                registry: Arc::new(StaticTokenRegistry::new()),
            },
            clock,
            quick_config(),
        )
        .expect("wallet opens")
    }

    fn local_wallet(&self, peer: &str) -> (Wallet, CommitmentSigner) {
        let keypair = WalletKeypair::generate();
        let wallet = self.wallet(peer, &keypair, Vec::new(), Arc::new(SystemClock));
        (wallet, CommitmentSigner::new(keypair))
    }

    fn storage_node(&self, id: &str) -> Arc<InMemoryStorageNode> {
        Arc::new(InMemoryStorageNode::new(id, self.backend.clone()))
    }

    fn shared_node(&self, id: &str) -> Arc<dyn StorageNode> {
        self.storage_node(id)
    }
}

fn quick_config() -> WalletConfig {
    WalletConfig {
        transfer: TransferConfig {
            polling: ProofPolling {
                interval: Duration::from_millis(5),
                timeout: Duration::from_millis(200),
            },
            ..TransferConfig::default()
        },
        resolver: ResolverConfig {
            request_timeout: Duration::from_millis(200),
            grace_period: Duration::from_millis(5),
            verify_initial_backoff: Duration::from_millis(5),
            ..ResolverConfig::default()
        },
        ..WalletConfig::default()
    }
}

fn uct() -> CoinId {
    CoinId::from_name("UCT")
}

async fn next_received(events: &mut broadcast::Receiver<WalletEvent>) -> WalletEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event @ WalletEvent::TransferReceived { .. }) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("transfer received in time")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

// ---------------------------------------------------------------------------
// Scenario A: whole-token transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exact_amount_moves_one_whole_token() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let (bob, bob_signer) = world.local_wallet("bob");
    let token = issue_token(&alice_signer, uct(), 100);
    alice.store.put(&token).unwrap();

    let (_stop, shutdown) = watch::channel(false);
    let mut bob_events = bob.events.subscribe();
    bob.start(shutdown);

    let to_bob = Recipient::new("bob", bob_signer.direct_address());
    let confirmation = alice
        .protocol
        .send(
            TransferTarget::Amount {
                coin_id: uct(),
                amount: Amount::from(100u64),
            },
            &to_bob,
        )
        .await
        .unwrap();
    assert_eq!(confirmation.sent.len(), 1);
    assert_eq!(confirmation.sent[0].token_id, token.token_id());
    assert!(confirmation.burned.is_empty());
    assert!(confirmation.change.is_none());

    let WalletEvent::TransferReceived { amount, sender, .. } = next_received(&mut bob_events).await else {
        unreachable!()
    };
    assert_eq!(amount, "100");
    assert_eq!(sender, "alice");

    assert_eq!(bob.balance(&uct()).unwrap(), Amount::from(100u64));
    assert_eq!(bob.store.tokens().unwrap().len(), 1);
    assert_eq!(alice.balance(&uct()).unwrap(), Amount::zero());
    assert!(alice
        .store
        .is_tombstoned(&token.token_id(), &token.object().state.hash())
        .unwrap());
}

// ---------------------------------------------------------------------------
// Scenario B: split transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn partial_amount_splits_and_keeps_change() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let (bob, bob_signer) = world.local_wallet("bob");
    let token = issue_token(&alice_signer, uct(), 100);
    alice.store.put(&token).unwrap();

    let (_stop, shutdown) = watch::channel(false);
    let mut bob_events = bob.events.subscribe();
    bob.start(shutdown);

    let confirmation = alice
        .protocol
        .send(
            TransferTarget::Amount {
                coin_id: uct(),
                amount: Amount::from(30u64),
            },
            &Recipient::new("bob", bob_signer.direct_address()),
        )
        .await
        .unwrap();
    assert_eq!(confirmation.burned, vec![token.token_id()]);
    assert_eq!(confirmation.total_sent(), Amount::from(30u64));

    next_received(&mut bob_events).await;

    let change_id = confirmation.change.expect("change token");
    let change = alice.store.get(&change_id).unwrap().expect("change stored");
    assert_eq!(change.amount(), &Amount::from(70u64));
    assert_eq!(change.status, TokenStatus::Confirmed);
    assert_eq!(alice.balance(&uct()).unwrap(), Amount::from(70u64));
    assert!(alice.store.get(&token.token_id()).unwrap().is_none());

    assert_eq!(bob.balance(&uct()).unwrap(), Amount::from(30u64));
    assert!(alice.store.log_entries().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario C: circuit breaker under a storage outage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outage_enters_local_mode_and_recovers_after_an_hour() {
    let world = World::new();
    let clock = Arc::new(ManualClock::starting_now());
    let node = world.storage_node("gw-1");
    node.set_offline(true);
    let keypair = WalletKeypair::generate();
    let wallet = world.wallet("alice", &keypair, vec![node.clone() as Arc<dyn StorageNode>], clock.clone());
    let name = PointerRecord::name_for(&keypair.public_key());

    for attempt in 1..=10 {
        clock.advance(chrono::Duration::seconds(31));
        let result = wallet.resolver.resolve(&name).await;
        assert_eq!(result, Err(ResolveError::AllNodesFailed(1)), "attempt {attempt}");
    }
    clock.advance(chrono::Duration::seconds(31));
    assert_eq!(wallet.resolver.resolve(&name).await, Err(ResolveError::LocalMode));
    assert_eq!(wallet.breaker.mode(), BreakerMode::Local);
    assert!(wallet.status().unwrap().breaker.local_mode_active);

    // An hour later the next resolve goes to the network again, even though
    // no success has been seen. The counters survive, so it falls straight
    // back into LOCAL.
    clock.advance(chrono::Duration::hours(1));
    assert_eq!(wallet.resolver.resolve(&name).await, Err(ResolveError::AllNodesFailed(1)));
    assert_eq!(wallet.breaker.state().consecutive_storage_failures, 11);
    assert_eq!(wallet.breaker.mode(), BreakerMode::Local);

    // With the node back, the next probe succeeds and a full sync clears it.
    node.set_offline(false);
    clock.advance(chrono::Duration::hours(1));
    let outcome = wallet.sync.sync_now().await.unwrap();
    assert!(!outcome.published);
    assert_eq!(wallet.breaker.mode(), BreakerMode::Normal);
    assert_eq!(wallet.breaker.state().consecutive_storage_failures, 0);
}

// ---------------------------------------------------------------------------
// Scenario D: transfer to someone else's nametag
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payload_for_unowned_nametag_is_not_applicable() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let (bob, _) = world.local_wallet("bob");
    bob.protocol.register_nametag("bob").await.unwrap();
    let bob_before = bob.store.tokens().unwrap().len();
    let token = issue_token(&alice_signer, uct(), 25);
    alice.store.put(&token).unwrap();

    // Routed to bob's peer, committed to carol's name.
    let misaddressed = Recipient::new("bob", Address::for_nametag("carol"));
    alice
        .protocol
        .send(TransferTarget::Token(token.token_id()), &misaddressed)
        .await
        .unwrap();

    let delivered = world.hub.delivered_to("bob");
    assert_eq!(delivered.len(), 1);
    let disposition = bob.channel.process_inbound(delivered[0].clone()).await;
    assert_eq!(disposition, Disposition::NotApplicable);
    assert_eq!(
        bob.channel.processed().state(&delivered[0].id),
        Some(ProcessedState::Done)
    );
    assert_eq!(bob.store.tokens().unwrap().len(), bob_before);
    assert_eq!(bob.balance(&uct()).unwrap(), Amount::zero());
}

#[tokio::test]
async fn nametag_transfer_is_claimed_and_spent_again() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let (bob, bob_signer) = world.local_wallet("bob");
    let (carol, carol_signer) = world.local_wallet("carol");
    bob.protocol.register_nametag("bob").await.unwrap();
    let token = issue_token(&alice_signer, uct(), 25);
    alice.store.put(&token).unwrap();

    alice
        .protocol
        .send(TransferTarget::Token(token.token_id()), &Recipient::nametag("bob"))
        .await
        .unwrap();
    let delivered = world.hub.delivered_to("bob");
    assert_eq!(delivered.len(), 1);
    assert_eq!(bob.channel.process_inbound(delivered[0].clone()).await, Disposition::Applied);

    let claimed = bob.store.get(&token.token_id()).unwrap().expect("token claimed");
    let predicate = &claimed.object().state.predicate;
    assert_eq!(predicate.kind, PredicateKind::Masked);
    assert!(predicate.is_owned_by(&bob_signer.public_key()));
    assert_eq!(bob.balance(&uct()).unwrap(), Amount::from(25u64));

    bob.protocol
        .send(
            TransferTarget::Amount {
                coin_id: uct(),
                amount: Amount::from(10u64),
            },
            &Recipient::new("carol", carol_signer.direct_address()),
        )
        .await
        .unwrap();
    for message in world.hub.delivered_to("carol") {
        assert_eq!(carol.channel.process_inbound(message).await, Disposition::Applied);
    }

    assert_eq!(bob.balance(&uct()).unwrap(), Amount::from(15u64));
    assert_eq!(carol.balance(&uct()).unwrap(), Amount::from(10u64));
}

#[tokio::test]
async fn rejected_nametag_claim_stays_redeliverable() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let (bob, _) = world.local_wallet("bob");
    bob.protocol.register_nametag("bob").await.unwrap();
    let token = issue_token(&alice_signer, uct(), 25);
    alice.store.put(&token).unwrap();

    alice
        .protocol
        .send(TransferTarget::Token(token.token_id()), &Recipient::nametag("bob"))
        .await
        .unwrap();
    let delivered = world.hub.delivered_to("bob");
    assert_eq!(delivered.len(), 1);

    world.network.reject_next("maintenance window");
    assert_eq!(bob.channel.process_inbound(delivered[0].clone()).await, Disposition::Deferred);
    assert_eq!(bob.channel.processed().state(&delivered[0].id), None);
    assert_eq!(bob.balance(&uct()).unwrap(), Amount::zero());

    assert_eq!(bob.channel.process_inbound(delivered[0].clone()).await, Disposition::Applied);
    assert_eq!(bob.balance(&uct()).unwrap(), Amount::from(25u64));
}

// ---------------------------------------------------------------------------
// Idempotent delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivered_transfer_is_applied_once() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let (bob, bob_signer) = world.local_wallet("bob");
    alice.store.put(&issue_token(&alice_signer, uct(), 40)).unwrap();

    let (_stop, shutdown) = watch::channel(false);
    let mut bob_events = bob.events.subscribe();
    bob.start(shutdown);

    alice
        .protocol
        .send(
            TransferTarget::Amount {
                coin_id: uct(),
                amount: Amount::from(40u64),
            },
            &Recipient::new("bob", bob_signer.direct_address()),
        )
        .await
        .unwrap();
    next_received(&mut bob_events).await;

    let id = world.hub.delivered_to("bob")[0].id.clone();
    assert_eq!(world.hub.redeliver_all("bob"), 1);
    assert_eq!(world.hub.redeliver_all("bob"), 1);
    wait_until(|| bob.channel.processed().state(&id) == Some(ProcessedState::Done)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bob.store.tokens().unwrap().len(), 1);
    assert_eq!(bob.balance(&uct()).unwrap(), Amount::from(40u64));
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, WalletEvent::TransferReceived { .. }));
    }
}

// ---------------------------------------------------------------------------
// Remote sync across devices
// ---------------------------------------------------------------------------

#[tokio::test]
async fn received_tokens_are_synced_and_restored_on_a_new_device() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let bob_keypair = WalletKeypair::generate();
    let bob_signer = CommitmentSigner::new(bob_keypair.clone());
    let bob = world.wallet(
        "bob",
        &bob_keypair,
        vec![world.shared_node("gw-1"), world.shared_node("gw-2")],
        Arc::new(SystemClock),
    );
    alice.store.put(&issue_token(&alice_signer, uct(), 60)).unwrap();

    let (_stop, shutdown) = watch::channel(false);
    let mut bob_events = bob.events.subscribe();
    bob.start(shutdown);

    alice
        .protocol
        .send(
            TransferTarget::Amount {
                coin_id: uct(),
                amount: Amount::from(60u64),
            },
            &Recipient::new("bob", bob_signer.direct_address()),
        )
        .await
        .unwrap();
    next_received(&mut bob_events).await;

    // The message is only settled once the snapshot holding it is published.
    let id = world.hub.delivered_to("bob")[0].id.clone();
    wait_until(|| bob.channel.processed().state(&id) == Some(ProcessedState::Done)).await;
    let pointer = world
        .backend
        .pointer(&PointerRecord::name_for(&bob_keypair.public_key()))
        .expect("pointer published");
    assert!(pointer.sequence >= 1);

    let laptop = world.wallet(
        "bob-laptop",
        &bob_keypair,
        vec![world.shared_node("gw-3")],
        Arc::new(SystemClock),
    );
    let outcome = laptop.sync.sync_now().await.unwrap();
    assert_eq!(outcome.pulled, 1);
    assert!(!outcome.published);
    assert_eq!(laptop.balance(&uct()).unwrap(), Amount::from(60u64));
}

#[tokio::test]
async fn rejected_commitment_leaves_everything_as_it_was() {
    let world = World::new();
    let (alice, alice_signer) = world.local_wallet("alice");
    let (_bob, bob_signer) = world.local_wallet("bob");
    let token = issue_token(&alice_signer, uct(), 10);
    alice.store.put(&token).unwrap();
    world.network.reject_next("double spend");

    let err = alice
        .protocol
        .send(
            TransferTarget::Token(token.token_id()),
            &Recipient::new("bob", bob_signer.direct_address()),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.kind(),
        tessera_protocol::transfer::protocol::ErrorKind::NetworkSubmission
    );
    let kept = alice.store.get(&token.token_id()).unwrap().unwrap();
    assert_eq!(kept.status, TokenStatus::Confirmed);
    assert!(world.hub.delivered_to("bob").is_empty());
}
