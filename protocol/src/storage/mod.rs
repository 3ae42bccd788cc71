//! # Storage
//!
//! Local persistence and remote sync.
//!
//! ```text
//! db.rs        sled trees, bincode records
//! store.rs     TokenStore: tokens, tombstones, transaction log, dirty flag
//! content.rs   content addresses and the wrapped-content trust boundary
//! node.rs      StorageNode seam, signed pointer records
//! breaker.rs   CircuitBreaker: NORMAL / LOCAL policy
//! cache.rs     monotonic resolution cache, negative cache
//! resolver.rs  ContentResolver: node racing, integrity checks, publishing
//! snapshot.rs  WalletSnapshot and the merge
//! sync.rs      SyncEngine: single-flight merge + publish
//! ```
//!
//! Records on disk use bincode; snapshots, pointers and anything else that
//! leaves the process use JSON.

pub mod breaker;
pub mod cache;
pub mod content;
pub mod db;
pub mod node;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod sync;

pub use breaker::{BreakerConfig, BreakerMode, CircuitBreaker, CircuitBreakerState};
pub use cache::ResolutionCache;
pub use content::{AddressParseError, Codec, ContentAddress, Verification};
pub use db::{DbError, DbResult, TreeName, WalletDb};
pub use node::{NodeError, PointerRecord, StorageNode};
pub use resolver::{
    ContentResolver, ResolutionResult, ResolutionSource, ResolveError, Resolved, ResolverConfig,
};
pub use snapshot::{merge, MergeOutcome, SnapshotError, WalletSnapshot};
pub use store::{
    PendingOp, SendStage, SplitStage, StoreError, StoreResult, SyncState, Tombstone, TokenStore,
    TxLogEntry,
};
pub use sync::{
    load_breaker_state, save_breaker_state, SyncConfig, SyncEngine, SyncError, SyncOutcome,
    SyncResult,
};
