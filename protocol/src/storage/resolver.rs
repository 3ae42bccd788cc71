//! # Content Resolver
//!
//! Resolves a wallet's mutable pointer to a content address and fetches
//! content, racing every configured [`StorageNode`].
//!
//! ## Resolution
//!
//! ```text
//! resolve(name)
//!   ├─ LOCAL mode?            -> Err(LocalMode)
//!   ├─ fresh cache entry?     -> Ok(Some(cached))
//!   ├─ failed recently?       -> Err(RecentlyFailed)
//!   └─ race all nodes
//!        ├─ first valid record opens a short grace window;
//!        │  the highest sequence seen by its end wins
//!        ├─ late answers still update the cache
//!        └─ every node failed -> breaker.record_storage_failure()
//! ```
//!
//! Records must carry a valid owner signature. Content fetched for a raw
//! address is hashed and compared before it is used; mismatches are logged
//! and discarded. Wrapped addresses are accepted as served, see
//! [`super::content`] for that trust boundary.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::breaker::CircuitBreaker;
use super::cache::ResolutionCache;
use super::content::{ContentAddress, Verification};
use super::node::{NodeError, PointerRecord, StorageNode};
use crate::clock::Clock;
use crate::config::{
    CONTENT_CACHE_CAPACITY, NEGATIVE_CACHE_TTL, NODE_REQUEST_TIMEOUT, RACE_GRACE_PERIOD, RESOLUTION_CACHE_TTL,
    VERIFY_INITIAL_BACKOFF, VERIFY_MAX_ATTEMPTS,
};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub request_timeout: Duration,
    pub grace_period: Duration,
    pub cache_ttl: Duration,
    pub negative_ttl: Duration,
    pub verify_attempts: u32,
    pub verify_initial_backoff: Duration,
    /// Snapshots kept by the content cache.
    pub content_cache_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            request_timeout: NODE_REQUEST_TIMEOUT,
            grace_period: RACE_GRACE_PERIOD,
            cache_ttl: RESOLUTION_CACHE_TTL,
            negative_ttl: NEGATIVE_CACHE_TTL,
            verify_attempts: VERIFY_MAX_ATTEMPTS,
            verify_initial_backoff: VERIFY_INITIAL_BACKOFF,
            content_cache_capacity: CONTENT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("remote storage suspended (LOCAL mode)")]
    LocalMode,

    #[error("no storage nodes configured")]
    NoNodes,

    #[error("{0} failed recently, backing off")]
    RecentlyFailed(String),

    #[error("all {0} storage nodes failed")]
    AllNodesFailed(usize),

    #[error("pointer superseded: expected sequence {expected}, nodes report {found}")]
    Superseded { expected: u64, found: u64 },

    #[error("publish not visible after {attempts} checks")]
    NotVisible { attempts: u32 },

    #[error("node filed content under {found}, expected {expected}")]
    AddressMismatch {
        expected: ContentAddress,
        found: ContentAddress,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Cache,
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub record: PointerRecord,
    pub source: ResolutionSource,
}

/// `Ok(None)`: the nodes answered and none has ever seen the name.
pub type ResolutionResult = Result<Option<Resolved>, ResolveError>;

enum Answer {
    Record(PointerRecord),
    Empty,
    Failed,
}

#[derive(Default)]
struct NodeAnswers {
    best: Option<PointerRecord>,
    empty: usize,
    failed: usize,
}

pub struct ContentResolver {
    nodes: Vec<Arc<dyn StorageNode>>,
    cache: Arc<ResolutionCache>,
    breaker: Arc<CircuitBreaker>,
    config: ResolverConfig,
}

impl ContentResolver {
    pub fn new(
        nodes: Vec<Arc<dyn StorageNode>>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
    ) -> Self {
        let cache = Arc::new(ResolutionCache::new(
            config.cache_ttl,
            config.negative_ttl,
            config.content_cache_capacity,
            clock,
        ));
        Self {
            nodes,
            cache,
            breaker,
            config,
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Cached answer if fresh, otherwise a race across all nodes.
    pub async fn resolve(&self, name: &str) -> ResolutionResult {
        if self.breaker.is_local_mode_active() {
            return Err(ResolveError::LocalMode);
        }
        if let Some(record) = self.cache.fresh(name) {
            debug!(name, sequence = record.sequence, "pointer served from cache");
            return Ok(Some(Resolved {
                record,
                source: ResolutionSource::Cache,
            }));
        }
        if self.cache.recently_failed(name) {
            return Err(ResolveError::RecentlyFailed(name.to_string()));
        }
        self.race_resolve(name).await
    }

    /// Always asks the nodes. Used where a stale answer would be wrong.
    pub async fn resolve_authoritative(&self, name: &str) -> ResolutionResult {
        if self.breaker.is_local_mode_active() {
            return Err(ResolveError::LocalMode);
        }
        self.race_resolve(name).await
    }

    async fn race_resolve(&self, name: &str) -> ResolutionResult {
        if self.nodes.is_empty() {
            return Err(ResolveError::NoNodes);
        }
        let answers = self.query_nodes(name).await;

        if let Some(best) = answers.best {
            self.breaker.record_storage_success();
            self.cache.clear_failure(name);
            // The cache may already hold something newer from a straggler.
            let record = match self.cache.get(name) {
                Some(cached) if cached.sequence > best.sequence => cached,
                _ => best,
            };
            debug!(name, sequence = record.sequence, "pointer resolved");
            return Ok(Some(Resolved {
                record,
                source: ResolutionSource::Network,
            }));
        }
        if answers.empty > 0 {
            self.breaker.record_storage_success();
            self.cache.clear_failure(name);
            return Ok(None);
        }

        warn!(name, nodes = answers.failed, "every storage node failed to resolve");
        self.breaker.record_storage_failure();
        self.cache.record_failure(name);
        Err(ResolveError::AllNodesFailed(answers.failed))
    }

    /// Races every node for `name`. The first valid record opens the grace
    /// window; the highest sequence seen by its end is `best`. Touches
    /// neither the breaker nor the failure cache, and `best` only ever
    /// comes from a node.
    async fn query_nodes(&self, name: &str) -> NodeAnswers {
        let (tx, mut rx) = mpsc::channel(self.nodes.len().max(1));
        for node in &self.nodes {
            let node = node.clone();
            let tx = tx.clone();
            let cache = self.cache.clone();
            let name = name.to_string();
            let limit = self.config.request_timeout;
            tokio::spawn(async move {
                let answer = match timeout(limit, node.resolve(&name)).await {
                    Ok(Ok(Some(record))) if record.name == name && record.verify() => {
                        // Stragglers land here after the race is decided.
                        cache.offer(record.clone());
                        Answer::Record(record)
                    }
                    Ok(Ok(Some(_))) => {
                        warn!(node = node.id(), %name, "node served an invalid pointer record");
                        Answer::Failed
                    }
                    Ok(Ok(None)) => Answer::Empty,
                    Ok(Err(e)) => {
                        debug!(node = node.id(), error = %e, "resolve failed");
                        Answer::Failed
                    }
                    Err(_) => {
                        debug!(node = node.id(), "resolve timed out");
                        Answer::Failed
                    }
                };
                let _ = tx.send(answer).await;
            });
        }
        drop(tx);

        let mut answers = NodeAnswers::default();
        let mut grace_deadline: Option<Instant> = None;
        loop {
            let next = match grace_deadline {
                Some(deadline) => match timeout_at(deadline, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => rx.recv().await,
            };
            let Some(answer) = next else { break };
            match answer {
                Answer::Record(record) => {
                    if answers.best.as_ref().map_or(true, |b| record.sequence > b.sequence) {
                        answers.best = Some(record);
                    }
                    grace_deadline.get_or_insert_with(|| Instant::now() + self.config.grace_period);
                }
                Answer::Empty => answers.empty += 1,
                Answer::Failed => answers.failed += 1,
            }
        }
        answers
    }

    /// Content at `address`, integrity-checked. The first acceptable answer
    /// wins. Addresses come from pointers, so `None` (missing, corrupt or
    /// unreachable everywhere) counts as a storage failure.
    pub async fn fetch_content(&self, address: &ContentAddress) -> Option<Vec<u8>> {
        if let Some(bytes) = self.cache.content(address) {
            return Some(bytes);
        }
        if self.nodes.is_empty() {
            return None;
        }

        let (tx, mut rx) = mpsc::channel(self.nodes.len());
        for node in &self.nodes {
            let node = node.clone();
            let tx = tx.clone();
            let cache = self.cache.clone();
            let address = *address;
            let limit = self.config.request_timeout;
            tokio::spawn(async move {
                let answer = match timeout(limit, node.fetch(&address)).await {
                    Ok(Ok(Some(bytes))) => match address.verify(&bytes) {
                        Verification::Mismatch => {
                            warn!(node = node.id(), %address, "content does not match its address, discarded");
                            None
                        }
                        verification => {
                            if verification == Verification::Trusted {
                                debug!(node = node.id(), %address, "accepting wrapped content unverified");
                            }
                            cache.put_content(address, bytes.clone());
                            Some(Some(bytes))
                        }
                    },
                    Ok(Ok(None)) => Some(None),
                    Ok(Err(e)) => {
                        debug!(node = node.id(), error = %e, "fetch failed");
                        None
                    }
                    Err(_) => None,
                };
                let _ = tx.send(answer).await;
            });
        }
        drop(tx);

        let mut missing = 0usize;
        while let Some(answer) = rx.recv().await {
            match answer {
                Some(Some(bytes)) => {
                    self.breaker.record_storage_success();
                    return Some(bytes);
                }
                Some(None) => missing += 1,
                None => {}
            }
        }
        warn!(%address, missing, nodes = self.nodes.len(), "no storage node produced the content");
        self.breaker.record_storage_failure();
        None
    }

    /// Stores `bytes` on every node. Succeeds if at least one node filed
    /// them under the expected raw address.
    pub async fn store_content(&self, bytes: Vec<u8>) -> Result<ContentAddress, ResolveError> {
        if self.nodes.is_empty() {
            return Err(ResolveError::NoNodes);
        }
        let expected = ContentAddress::for_content(&bytes);
        let limit = self.config.request_timeout;
        let results = join_all(self.nodes.iter().map(|node| {
            let bytes = bytes.clone();
            async move {
                (
                    node.id().to_string(),
                    timeout(limit, node.store(bytes))
                        .await
                        .unwrap_or(Err(NodeError::Timeout)),
                )
            }
        }))
        .await;

        let mut accepted = 0usize;
        let mut mismatch = None;
        for (node, result) in results {
            match result {
                Ok(found) if found == expected => accepted += 1,
                Ok(found) => {
                    warn!(%node, %found, %expected, "node filed content under an unexpected address");
                    mismatch = Some(found);
                }
                Err(e) => debug!(%node, error = %e, "store failed"),
            }
        }
        if accepted > 0 {
            self.cache.put_content(expected, bytes);
            self.breaker.record_storage_success();
            return Ok(expected);
        }
        self.breaker.record_storage_failure();
        match mismatch {
            Some(found) => Err(ResolveError::AddressMismatch { expected, found }),
            None => Err(ResolveError::AllNodesFailed(self.nodes.len())),
        }
    }

    /// Publishes a pointer update to every node. Returns how many accepted.
    pub async fn publish_pointer(&self, record: &PointerRecord) -> Result<usize, ResolveError> {
        if self.nodes.is_empty() {
            return Err(ResolveError::NoNodes);
        }
        let limit = self.config.request_timeout;
        let results = join_all(self.nodes.iter().map(|node| async move {
            (
                node.id().to_string(),
                timeout(limit, node.publish(record))
                    .await
                    .unwrap_or(Err(NodeError::Timeout)),
            )
        }))
        .await;

        let accepted = results
            .iter()
            .filter(|(node, result)| match result {
                Ok(()) => true,
                Err(e) => {
                    debug!(%node, error = %e, "publish failed");
                    false
                }
            })
            .count();
        if accepted == 0 {
            self.breaker.record_storage_failure();
            return Err(ResolveError::AllNodesFailed(self.nodes.len()));
        }
        self.breaker.record_storage_success();
        info!(name = %record.name, sequence = record.sequence, accepted, "pointer published");
        Ok(accepted)
    }

    /// Polls the nodes until one of them reports `sequence` at `address`
    /// for `name`, backing off between attempts. Only node answers count:
    /// the record is cached once a node has confirmed it.
    ///
    /// Leaves the breaker alone. A failed verification is one storage
    /// failure (or conflict) for the caller to record, however many
    /// attempts it took.
    pub async fn verify_published(
        &self,
        name: &str,
        sequence: u64,
        address: &ContentAddress,
    ) -> Result<(), ResolveError> {
        if self.nodes.is_empty() {
            return Err(ResolveError::NoNodes);
        }
        let mut delay = self.config.verify_initial_backoff;
        for attempt in 1..=self.config.verify_attempts {
            let answers = self.query_nodes(name).await;
            match answers.best {
                Some(record) if record.sequence == sequence && &record.address == address => {
                    debug!(name, sequence, attempt, "publish verified");
                    self.cache.offer(record);
                    self.cache.clear_failure(name);
                    return Ok(());
                }
                Some(record) if record.sequence > sequence => {
                    return Err(ResolveError::Superseded {
                        expected: sequence,
                        found: record.sequence,
                    });
                }
                Some(record) => {
                    debug!(name, sequence, found = record.sequence, attempt, "publish not visible yet")
                }
                None => debug!(
                    name,
                    attempt,
                    empty = answers.empty,
                    failed = answers.failed,
                    "no node reports the pointer yet"
                ),
            }
            if attempt < self.config.verify_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        Err(ResolveError::NotVisible {
            attempts: self.config.verify_attempts,
        })
    }
}
