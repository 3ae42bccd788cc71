//! # Sync Engine
//!
//! Keeps the wallet's remote snapshot and local store converged.
//!
//! ## One sync
//!
//! ```text
//! LOCAL mode? ─────────────────────────────────> Err(LocalMode)
//! resolve pointer (authoritative)
//! fetch + decode snapshot
//! conflict = we had unpublished changes AND remote moved past what we last saw
//!     yes -> breaker.record_conflict()      no -> breaker.record_merge_success()
//! merge, apply the remote side locally
//! publish if the remote is not already current:
//!     store content -> sign pointer(seq = max(remote, last seen) + 1)
//!     -> publish -> poll until visible
//! breaker.record_full_sync_success()
//! ```
//!
//! Any failing step aborts; nothing after it runs, so a pointer is never
//! published for content that wasn't stored. Unpublished local changes keep
//! the store dirty and are picked up by the next attempt.
//!
//! Syncs are single-flight. [`SyncEngine::sync_now`] refuses while one is
//! running; [`SyncEngine::sync_or_wait`] waits for it (bounded) and reuses
//! its result.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::breaker::{CircuitBreaker, CircuitBreakerState};
use super::content::ContentAddress;
use super::db::{DbError, DbResult, TreeName, WalletDb};
use super::node::PointerRecord;
use super::resolver::{ContentResolver, ResolveError};
use super::snapshot::{merge, SnapshotError, WalletSnapshot};
use super::store::{StoreError, TokenStore};
use crate::clock::Clock;
use crate::config::{PERIODIC_SYNC_INTERVAL, SYNC_WAIT_TIMEOUT};
use crate::crypto::keys::WalletKeypair;
use crate::events::{EventBus, WalletEvent};
use crate::messaging::channel::DurableCommit;
use crate::transfer::protocol::ErrorKind;

const META_BREAKER: &[u8] = b"circuit_breaker";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the background loop.
    pub interval: Duration,
    /// How long [`SyncEngine::sync_or_wait`] waits for an in-flight sync.
    pub wait_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: PERIODIC_SYNC_INTERVAL,
            wait_timeout: SYNC_WAIT_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote sync suspended (LOCAL mode)")]
    LocalMode,

    #[error("a sync is already in progress")]
    AlreadyInProgress,

    #[error("timed out waiting for the in-flight sync")]
    WaitTimedOut,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("snapshot {0} could not be fetched")]
    SnapshotUnavailable(ContentAddress),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Resolve(ResolveError::Superseded { .. }) => ErrorKind::Conflict,
            _ => ErrorKind::StorageFailure,
        }
    }
}

pub type SyncResult = Result<SyncOutcome, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// The remote sequence the wallet now reflects.
    pub sequence: u64,
    pub published: bool,
    /// Tokens taken from the remote snapshot.
    pub pulled: usize,
    /// Remote records dropped during the merge.
    pub rejected: usize,
    pub conflict: bool,
    pub token_count: usize,
}

pub struct SyncEngine {
    keypair: WalletKeypair,
    store: Arc<TokenStore>,
    resolver: Arc<ContentResolver>,
    breaker: Arc<CircuitBreaker>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    gate: tokio::sync::Mutex<()>,
    generation: watch::Sender<u64>,
    /// Generation and outcome of the latest successful sync.
    last_success: Mutex<Option<(u64, SyncOutcome)>>,
    reported_local: AtomicBool,
    trigger: Notify,
}

impl SyncEngine {
    pub fn new(
        keypair: WalletKeypair,
        store: Arc<TokenStore>,
        resolver: Arc<ContentResolver>,
        breaker: Arc<CircuitBreaker>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        let reported_local = AtomicBool::new(breaker.state().local_mode_active);
        Self {
            keypair,
            store,
            resolver,
            breaker,
            events,
            clock,
            config,
            gate: tokio::sync::Mutex::new(()),
            generation,
            last_success: Mutex::new(None),
            reported_local,
            trigger: Notify::new(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pointer_name(&self) -> String {
        PointerRecord::name_for(&self.keypair.public_key())
    }

    pub fn is_syncing(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Runs one sync now, or fails with [`SyncError::AlreadyInProgress`].
    pub async fn sync_now(&self) -> SyncResult {
        let Ok(guard) = self.gate.try_lock() else {
            return Err(SyncError::AlreadyInProgress);
        };
        self.sync_locked(guard).await
    }

    /// Like [`Self::sync_now`], but if a sync is already running, waits
    /// for it. Its success is returned as ours unless local changes are
    /// still unpublished; otherwise (or if it failed) runs again.
    ///
    /// Both waits share one deadline of the configured wait timeout. When
    /// it passes the caller gets [`SyncError::WaitTimedOut`] and proceeds
    /// on its own; the in-flight sync is not affected.
    pub async fn sync_or_wait(&self) -> SyncResult {
        let mut rx = self.generation.subscribe();
        let seen = *rx.borrow_and_update();
        if let Ok(guard) = self.gate.try_lock() {
            return self.sync_locked(guard).await;
        }

        debug!("sync in flight, waiting for it");
        let deadline = Instant::now() + self.config.wait_timeout;
        match timeout_at(deadline, rx.wait_for(|g| *g > seen)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return Err(SyncError::WaitTimedOut),
        }
        // Reuse its result only if it covered everything written so far.
        let reusable = self.last_success.lock().clone();
        if let Some((generation, outcome)) = reusable {
            if generation > seen && !self.store.is_dirty()? {
                return Ok(outcome);
            }
        }
        let guard = timeout_at(deadline, self.gate.lock())
            .await
            .map_err(|_| SyncError::WaitTimedOut)?;
        self.sync_locked(guard).await
    }

    /// Wakes the background loop for an immediate sync.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Syncs every interval, or when triggered, until `shutdown` is set.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "sync loop starting");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            match self.sync_now().await {
                Ok(outcome) => debug!(sequence = outcome.sequence, published = outcome.published, "periodic sync done"),
                Err(SyncError::AlreadyInProgress) | Err(SyncError::LocalMode) => {}
                Err(e) => warn!(error = %e, "periodic sync failed"),
            }
        }
        info!("sync loop stopped");
    }

    async fn sync_locked(&self, guard: tokio::sync::MutexGuard<'_, ()>) -> SyncResult {
        let result = self.sync_once().await;
        match &result {
            Ok(outcome) => {
                let generation = *self.generation.borrow() + 1;
                *self.last_success.lock() = Some((generation, outcome.clone()));
            }
            Err(SyncError::LocalMode) => debug!("sync skipped, LOCAL mode"),
            Err(e) => warn!(error = %e, "sync failed"),
        }
        self.after_attempt();
        self.generation.send_modify(|g| *g += 1);
        drop(guard);
        result
    }

    async fn sync_once(&self) -> SyncResult {
        if self.breaker.is_local_mode_active() {
            return Err(SyncError::LocalMode);
        }
        let owner = self.keypair.public_key();
        let name = PointerRecord::name_for(&owner);

        let remote = self
            .resolver
            .resolve_authoritative(&name)
            .await?
            .map(|resolved| resolved.record);
        let snapshot = match &remote {
            Some(record) => {
                let bytes = self
                    .resolver
                    .fetch_content(&record.address)
                    .await
                    .ok_or(SyncError::SnapshotUnavailable(record.address))?;
                match WalletSnapshot::decode(&bytes, &owner) {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        self.breaker.record_storage_failure();
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };
        let remote_seq = remote.as_ref().map(|r| r.sequence);

        let was_dirty = self.store.take_dirty()?;
        let result = self.merge_and_publish(&name, snapshot.as_ref(), remote_seq, was_dirty).await;
        if result.is_err() && was_dirty {
            if let Err(e) = self.store.mark_dirty() {
                warn!(error = %e, "could not restore dirty flag");
            }
        }
        result
    }

    async fn merge_and_publish(
        &self,
        name: &str,
        snapshot: Option<&WalletSnapshot>,
        remote_seq: Option<u64>,
        was_dirty: bool,
    ) -> SyncResult {
        let owner = self.keypair.public_key();
        let last_seen = self.store.sync_state()?.last_seen_sequence;

        let conflict = was_dirty && remote_seq > last_seen;
        if conflict {
            warn!(?remote_seq, ?last_seen, "remote changed under unpublished local changes");
            self.breaker.record_conflict();
        } else {
            self.breaker.record_merge_success();
        }

        let merged = merge(&owner, &self.store.tokens()?, &self.store.tombstones()?, snapshot);
        let mut pulled = 0;
        if merged.changes_local() {
            pulled = self
                .store
                .apply_remote(&merged.incoming, &merged.incoming_tombstones)?;
            self.events.publish(WalletEvent::TokensChanged);
        }

        let base = remote_seq.max(last_seen).unwrap_or(0);
        let (sequence, published) = if merged.remote_is_current {
            (remote_seq.unwrap_or(base), false)
        } else {
            (self.publish(name, base + 1).await?, true)
        };

        let now = self.clock.now();
        self.store
            .record_synced(sequence, published.then_some(now))?;
        let token_count = self.store.tokens()?.len();
        self.breaker.record_full_sync_success();
        self.events.publish(WalletEvent::SyncCompleted {
            sequence,
            token_count,
        });
        info!(sequence, published, pulled, token_count, "sync completed");

        Ok(SyncOutcome {
            sequence,
            published,
            pulled,
            rejected: merged.rejected,
            conflict,
            token_count,
        })
    }

    async fn publish(&self, name: &str, sequence: u64) -> Result<u64, SyncError> {
        let snapshot = WalletSnapshot::build(
            self.keypair.public_key(),
            sequence,
            self.clock.now(),
            &self.store.tokens()?,
            &self.store.tombstones()?,
        );
        let address = self.resolver.store_content(snapshot.encode()?).await?;
        let record = PointerRecord::sign(&self.keypair, address, sequence);
        self.resolver.publish_pointer(&record).await?;
        match self.resolver.verify_published(name, sequence, &address).await {
            Ok(()) => Ok(sequence),
            Err(e) => {
                match e {
                    ResolveError::Superseded { .. } => {
                        self.breaker.record_conflict();
                    }
                    _ => {
                        self.breaker.record_storage_failure();
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Persists the breaker and reports mode changes on the event bus.
    fn after_attempt(&self) {
        let state = self.breaker.state();
        if let Err(e) = save_breaker_state(self.store.db(), &state) {
            warn!(error = %e, "could not persist circuit breaker state");
        }
        let was_local = self.reported_local.swap(state.local_mode_active, Ordering::SeqCst);
        match (was_local, state.local_mode_active) {
            (false, true) => {
                let reason = if state.consecutive_conflicts >= state.consecutive_storage_failures {
                    "repeated sync conflicts"
                } else {
                    "repeated storage failures"
                };
                self.events.publish(WalletEvent::LocalModeEntered {
                    reason: reason.to_string(),
                });
            }
            (true, false) => self.events.publish(WalletEvent::LocalModeExited),
            _ => {}
        }
    }
}

#[async_trait]
impl DurableCommit for SyncEngine {
    async fn commit(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.sync_or_wait().await.map(|_| ()).map_err(Into::into)
    }
}

/// The persisted breaker state, or the default if none was saved.
pub fn load_breaker_state(db: &WalletDb) -> DbResult<CircuitBreakerState> {
    Ok(db.get(TreeName::Meta, META_BREAKER)?.unwrap_or_default())
}

pub fn save_breaker_state(db: &WalletDb, state: &CircuitBreakerState) -> Result<(), DbError> {
    db.put(TreeName::Meta, META_BREAKER, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::devnet::fixtures::issue_token;
    use crate::devnet::storage::{InMemoryStorageNode, StorageBackend};
    use crate::storage::breaker::BreakerConfig;
    use crate::storage::node::StorageNode;
    use crate::storage::resolver::ResolverConfig;
    use crate::token::CoinId;
    use crate::transfer::signer::CommitmentSigner;

    struct Device {
        engine: Arc<SyncEngine>,
        store: Arc<TokenStore>,
        node: Arc<InMemoryStorageNode>,
        events: EventBus,
    }

    fn device(keypair: &WalletKeypair, backend: &StorageBackend, clock: Arc<ManualClock>) -> Device {
        let store = Arc::new(TokenStore::new(WalletDb::open_temporary().unwrap()));
        let node = Arc::new(InMemoryStorageNode::new("n", backend.clone()));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
        let resolver = Arc::new(ContentResolver::new(
            vec![node.clone() as Arc<dyn StorageNode>],
            breaker.clone(),
            clock.clone(),
            ResolverConfig {
                grace_period: Duration::from_millis(5),
                verify_initial_backoff: Duration::from_millis(5),
                ..ResolverConfig::default()
            },
        ));
        let events = EventBus::new();
        let engine = Arc::new(SyncEngine::new(
            keypair.clone(),
            store.clone(),
            resolver,
            breaker,
            events.clone(),
            clock,
            SyncConfig::default(),
        ));
        Device {
            engine,
            store,
            node,
            events,
        }
    }

    #[tokio::test]
    async fn first_sync_publishes_and_second_is_a_noop() {
        let kp = WalletKeypair::generate();
        let signer = CommitmentSigner::new(kp.clone());
        let backend = StorageBackend::new();
        let d = device(&kp, &backend, Arc::new(ManualClock::starting_now()));
        d.store.put(&issue_token(&signer, CoinId::from_name("UCT"), 50)).unwrap();

        let first = d.engine.sync_now().await.unwrap();
        assert!(first.published);
        assert_eq!(first.sequence, 1);
        assert!(!d.store.is_dirty().unwrap());
        assert_eq!(backend.pointer(&d.engine.pointer_name()).unwrap().sequence, 1);

        let second = d.engine.sync_now().await.unwrap();
        assert!(!second.published);
        assert_eq!(second.sequence, 1);
    }

    #[tokio::test]
    async fn two_devices_converge() {
        let kp = WalletKeypair::generate();
        let signer = CommitmentSigner::new(kp.clone());
        let backend = StorageBackend::new();
        let clock = Arc::new(ManualClock::starting_now());
        let a = device(&kp, &backend, clock.clone());
        let b = device(&kp, &backend, clock);
        let coin = CoinId::from_name("UCT");

        a.store.put(&issue_token(&signer, coin, 10)).unwrap();
        a.engine.sync_now().await.unwrap();

        b.store.put(&issue_token(&signer, coin, 20)).unwrap();
        let outcome = b.engine.sync_now().await.unwrap();
        assert!(outcome.conflict);
        assert_eq!(outcome.pulled, 1);
        assert_eq!(outcome.sequence, 2);

        a.engine.sync_now().await.unwrap();
        assert_eq!(a.store.balance(&coin).unwrap(), b.store.balance(&coin).unwrap());
        assert_eq!(a.store.tokens().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn outage_keeps_changes_dirty_and_counts_failures() {
        let kp = WalletKeypair::generate();
        let signer = CommitmentSigner::new(kp.clone());
        let d = device(&kp, &StorageBackend::new(), Arc::new(ManualClock::starting_now()));
        d.store.put(&issue_token(&signer, CoinId::from_name("UCT"), 5)).unwrap();
        d.node.set_offline(true);

        assert!(matches!(d.engine.sync_now().await, Err(SyncError::Resolve(_))));
        assert!(d.store.is_dirty().unwrap());
        assert_eq!(d.engine.breaker().state().consecutive_storage_failures, 1);
        let saved = load_breaker_state(d.store.db()).unwrap();
        assert_eq!(saved.consecutive_storage_failures, 1);
    }

    #[tokio::test]
    async fn entering_local_mode_is_announced() {
        let kp = WalletKeypair::generate();
        let clock = Arc::new(ManualClock::starting_now());
        let d = device(&kp, &StorageBackend::new(), clock.clone());
        let mut events = d.events.subscribe();
        d.node.set_offline(true);

        for _ in 0..10 {
            let _ = d.engine.sync_now().await;
        }
        assert!(matches!(d.engine.sync_now().await, Err(SyncError::LocalMode)));
        let mut entered = false;
        while let Ok(event) = events.try_recv() {
            entered |= matches!(event, WalletEvent::LocalModeEntered { .. });
        }
        assert!(entered);

        d.node.set_offline(false);
        clock.advance(chrono::Duration::hours(1));
        d.engine.sync_now().await.unwrap();
        assert_eq!(d.engine.breaker().state(), CircuitBreakerState::default());
        let mut exited = false;
        while let Ok(event) = events.try_recv() {
            exited |= event == WalletEvent::LocalModeExited;
        }
        assert!(exited);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_sync() {
        let kp = WalletKeypair::generate();
        let d = device(&kp, &StorageBackend::new(), Arc::new(ManualClock::starting_now()));
        d.node.set_delay(Some(Duration::from_millis(50)));

        let engine = d.engine.clone();
        let first = tokio::spawn(async move { engine.sync_now().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(d.engine.sync_now().await, Err(SyncError::AlreadyInProgress)));
        let waited = d.engine.sync_or_wait().await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(waited, first);
    }

    #[tokio::test]
    async fn waiter_gives_up_after_the_timeout() {
        let kp = WalletKeypair::generate();
        let mut d = device(&kp, &StorageBackend::new(), Arc::new(ManualClock::starting_now()));
        d.node.set_delay(Some(Duration::from_millis(200)));
        Arc::get_mut(&mut d.engine).unwrap().config.wait_timeout = Duration::from_millis(20);

        let engine = d.engine.clone();
        let first = tokio::spawn(async move { engine.sync_now().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(d.engine.sync_or_wait().await, Err(SyncError::WaitTimedOut)));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waiter_deadline_covers_both_waits() {
        let kp = WalletKeypair::generate();
        let mut d = device(&kp, &StorageBackend::new(), Arc::new(ManualClock::starting_now()));
        Arc::get_mut(&mut d.engine).unwrap().config.wait_timeout = Duration::from_millis(200);

        // Another sync holds the gate for longer than the wait timeout and
        // completes a generation without a reusable result along the way.
        let guard = d.engine.gate.lock().await;
        let engine = d.engine.clone();
        let started = Instant::now();
        let waiter = tokio::spawn(async move { engine.sync_or_wait().await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        d.engine.generation.send_modify(|g| *g += 1);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SyncError::WaitTimedOut)));
        assert!(started.elapsed() < Duration::from_millis(300));
        drop(guard);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let kp = WalletKeypair::generate();
        let d = device(&kp, &StorageBackend::new(), Arc::new(ManualClock::starting_now()));
        let (tx, rx) = watch::channel(false);
        let engine = d.engine.clone();
        let handle = tokio::spawn(async move { engine.run(rx).await });
        d.engine.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unverified_publish_counts_one_storage_failure() {
        let kp = WalletKeypair::generate();
        let signer = CommitmentSigner::new(kp.clone());
        let backend = StorageBackend::new();
        let d = device(&kp, &backend, Arc::new(ManualClock::starting_now()));
        let coin = CoinId::from_name("UCT");
        d.store.put(&issue_token(&signer, coin, 5)).unwrap();
        d.engine.sync_now().await.unwrap();

        // The node keeps answering with the first pointer, so the next
        // publish can never be confirmed.
        let first = backend.pointer(&d.engine.pointer_name()).unwrap();
        d.node.serve_pointer(first);
        d.store.put(&issue_token(&signer, coin, 7)).unwrap();

        let result = d.engine.sync_now().await;
        assert!(matches!(
            result,
            Err(SyncError::Resolve(ResolveError::NotVisible { .. }))
        ));
        assert!(d.store.is_dirty().unwrap());
        assert_eq!(d.engine.breaker().state().consecutive_storage_failures, 1);
        assert_eq!(d.store.sync_state().unwrap().last_seen_sequence, Some(1));
    }
}
