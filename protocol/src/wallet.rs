//! # Wallet Assembly
//!
//! Builds the component graph for one wallet from its collaborators. Every
//! dependency is passed in explicitly; there are no process-wide instances,
//! so any number of wallets can live side by side (the end-to-end tests run
//! two or three in one process).
//!
//! ```text
//!                   ┌────────────── EventBus ──────────────┐
//!                   │                                       │
//! PeerTransport ─> MessageChannel ──(handler)──> TransferProtocol ─> TransitionNetwork
//!                   │      │                          │
//!                   │      └──(durable commit)──┐     └──> TokenStore ─> WalletDb
//!                   │                           v                          ^
//! StorageNode* ─> ContentResolver <────────── SyncEngine ──────────────────┘
//!                        │                        │
//!                        └──── CircuitBreaker <───┘
//! ```

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::crypto::keys::{PublicKey, WalletKeypair};
use crate::events::EventBus;
use crate::messaging::channel::{ChannelConfig, ChannelError, MessageChannel};
use crate::messaging::transport::PeerTransport;
use crate::storage::breaker::{BreakerConfig, BreakerMode, CircuitBreaker, CircuitBreakerState};
use crate::storage::db::{DbError, WalletDb};
use crate::storage::node::StorageNode;
use crate::storage::resolver::{ContentResolver, ResolverConfig};
use crate::storage::store::{StoreError, SyncState, TokenStore};
use crate::storage::sync::{load_breaker_state, SyncConfig, SyncEngine};
use crate::token::amount::{Amount, CoinId};
use crate::token::owned::TokenStatus;
use crate::token::registry::{format_amount, TokenRegistry};
use crate::transfer::network::TransitionNetwork;
use crate::transfer::protocol::{TransferConfig, TransferProtocol};
use crate::transfer::signer::CommitmentSigner;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Clone, Default)]
pub struct WalletConfig {
    pub transfer: TransferConfig,
    pub channel: ChannelConfig,
    pub breaker: BreakerConfig,
    pub resolver: ResolverConfig,
    pub sync: SyncConfig,
}

/// The outside world, as seen by one wallet.
pub struct Collaborators {
    pub network: Arc<dyn TransitionNetwork>,
    pub transport: Arc<dyn PeerTransport>,
    pub storage_nodes: Vec<Arc<dyn StorageNode>>,
    pub registry: Arc<dyn TokenRegistry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceLine {
    pub coin_id: CoinId,
    pub symbol: Option<String>,
    pub amount: Amount,
    pub display: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletStatus {
    pub public_key: PublicKey,
    pub peer_id: String,
    pub balances: Vec<BalanceLine>,
    pub token_count: usize,
    pub pending_tokens: usize,
    pub nametags: Vec<String>,
    pub pending_operations: usize,
    pub mode: BreakerMode,
    pub breaker: CircuitBreakerState,
    pub sync: SyncState,
    pub storage_nodes: usize,
}

pub struct Wallet {
    keypair: WalletKeypair,
    pub store: Arc<TokenStore>,
    pub channel: Arc<MessageChannel>,
    pub protocol: Arc<TransferProtocol>,
    pub breaker: Arc<CircuitBreaker>,
    pub resolver: Arc<ContentResolver>,
    pub sync: Arc<SyncEngine>,
    pub events: EventBus,
    registry: Arc<dyn TokenRegistry>,
}

impl Wallet {
    pub fn open(
        keypair: WalletKeypair,
        db: WalletDb,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        config: WalletConfig,
    ) -> Result<Self, WalletError> {
        let events = EventBus::new();
        let store = Arc::new(TokenStore::new(db.clone()));

        let breaker = Arc::new(CircuitBreaker::with_state(
            load_breaker_state(&db)?,
            config.breaker,
            clock.clone(),
        ));
        let has_storage = !collaborators.storage_nodes.is_empty();
        let resolver = Arc::new(ContentResolver::new(
            collaborators.storage_nodes,
            breaker.clone(),
            clock.clone(),
            config.resolver,
        ));
        let sync = Arc::new(SyncEngine::new(
            keypair.clone(),
            store.clone(),
            resolver.clone(),
            breaker.clone(),
            events.clone(),
            clock.clone(),
            config.sync,
        ));

        let channel = Arc::new(MessageChannel::open(
            collaborators.transport,
            db,
            events.clone(),
            clock.clone(),
            config.channel,
        )?);
        // Without storage nodes the local store is the only copy.
        if has_storage {
            channel.set_durable_commit(sync.clone());
        }

        let protocol = Arc::new(TransferProtocol::new(
            Arc::new(CommitmentSigner::new(keypair.clone())),
            collaborators.network,
            store.clone(),
            channel.clone(),
            events.clone(),
            clock,
            config.transfer,
        ));
        protocol.attach();

        info!(
            public_key = %keypair.public_key(),
            peer = channel.local_peer(),
            storage_nodes = resolver.node_count(),
            "wallet opened"
        );
        Ok(Self {
            keypair,
            store,
            channel,
            protocol,
            breaker,
            resolver,
            sync,
            events,
            registry: collaborators.registry,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Spawns the inbound message loop and, with storage configured, the
    /// periodic sync loop. Both stop when `shutdown` flips to `true`.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let channel = self.channel.clone();
        let channel_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = channel.run(channel_shutdown).await {
                warn!(error = %e, "message channel exited");
            }
        }));

        if self.resolver.node_count() > 0 {
            let sync = self.sync.clone();
            handles.push(tokio::spawn(async move { sync.run(shutdown).await }));
        }
        handles
    }

    pub fn balance(&self, coin_id: &CoinId) -> Result<Amount, WalletError> {
        Ok(self.store.balance(coin_id)?)
    }

    pub fn status(&self) -> Result<WalletStatus, WalletError> {
        let tokens = self.store.tokens()?;
        let mut totals: BTreeMap<CoinId, Amount> = BTreeMap::new();
        for token in &tokens {
            let Some(coin_id) = token.coin_id() else { continue };
            if matches!(token.status, TokenStatus::Confirmed | TokenStatus::Pending) {
                let total = totals.entry(coin_id).or_insert_with(Amount::zero);
                *total = &*total + token.amount();
            }
        }
        let balances = totals
            .into_iter()
            .map(|(coin_id, amount)| {
                let definition = self.registry.get_definition(&coin_id);
                let display = match &definition {
                    Some(d) => format!("{} {}", format_amount(&amount, d.decimals), d.symbol),
                    None => amount.to_string(),
                };
                BalanceLine {
                    coin_id,
                    symbol: definition.map(|d| d.symbol),
                    amount,
                    display,
                }
            })
            .collect();

        Ok(WalletStatus {
            public_key: self.public_key(),
            peer_id: self.channel.local_peer().to_string(),
            balances,
            token_count: tokens.len(),
            pending_tokens: tokens
                .iter()
                .filter(|t| t.status == TokenStatus::Pending)
                .count(),
            nametags: tokens
                .iter()
                .filter_map(|t| t.nametag().map(str::to_string))
                .collect(),
            pending_operations: self.store.log_entries()?.len(),
            mode: self.breaker.mode(),
            breaker: self.breaker.state(),
            sync: self.store.sync_state()?,
            storage_nodes: self.resolver.node_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::devnet::fixtures::issue_token;
    use crate::devnet::{InMemoryNetwork, LoopbackHub};
    use crate::token::registry::StaticTokenRegistry;

    #[tokio::test]
    async fn status_reports_balances_with_registry_symbols() {
        let keypair = WalletKeypair::generate();
        let hub = LoopbackHub::new();
        let wallet = Wallet::open(
            keypair.clone(),
            WalletDb::open_temporary().unwrap(),
            Collaborators {
                network: Arc::new(InMemoryNetwork::new()),
                transport: hub.endpoint("alice"),
                storage_nodes: Vec::new(),
                registry: Arc::new(StaticTokenRegistry::new().with_symbol("UCT", "Unicity", 2)),
            },
            Arc::new(SystemClock),
            WalletConfig::default(),
        )
        .unwrap();

        let signer = CommitmentSigner::new(keypair);
        wallet
            .store
            .put(&issue_token(&signer, CoinId::from_name("UCT"), 12345))
            .unwrap();
        let status = wallet.status().unwrap();
        assert_eq!(status.peer_id, "alice");
        assert_eq!(status.token_count, 1);
        assert_eq!(status.balances[0].display, "123.45 UCT");
        assert_eq!(status.mode, BreakerMode::Normal);
        assert!(status.sync.dirty);
    }
}
