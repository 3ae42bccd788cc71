//! # Engine Configuration & Constants
//!
//! Every magic number the transfer and sync engine depends on lives here.
//! Component configs (`TransferConfig`, `SyncConfig`, ...) derive their
//! `Default` values from these constants, so tuning a deployment means
//! overriding a field, not hunting for literals.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Engine version string reported by the daemon and embedded in snapshots.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Snapshot format version. Bump when the published wallet snapshot layout
/// changes in a way older readers cannot ignore.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Salt length for transfer commitments. 32 bytes from the OS RNG.
pub const SALT_LENGTH: usize = 32;

/// Hash output length in bytes (BLAKE3 and SHA-256 alike).
pub const HASH_OUTPUT_LENGTH: usize = 32;

/// Domain separators keep hashes of different object kinds from colliding
/// even when their byte encodings happen to match.
pub const DOMAIN_REQUEST_ID: &[u8] = b"tessera/request-id/v1";
pub const DOMAIN_TRANSACTION: &[u8] = b"tessera/transaction/v1";
pub const DOMAIN_STATE: &[u8] = b"tessera/state/v1";
pub const DOMAIN_PREDICATE: &[u8] = b"tessera/predicate/v1";
pub const DOMAIN_NAMETAG: &[u8] = b"tessera/nametag/v1";
pub const DOMAIN_NONCE: &[u8] = b"tessera/nonce/v1";
pub const DOMAIN_SPLIT: &[u8] = b"tessera/split/v1";
pub const DOMAIN_POINTER: &[u8] = b"tessera/pointer/v1";
pub const DOMAIN_INCLUSION: &[u8] = b"tessera/inclusion/v1";

// ---------------------------------------------------------------------------
// Transfer Protocol
// ---------------------------------------------------------------------------

/// How often to ask the transition network for an inclusion proof.
pub const PROOF_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on waiting for an inclusion proof. Past this the commitment
/// is reported as timed out and the local token stays owned.
pub const PROOF_TIMEOUT: Duration = Duration::from_secs(30);

/// Exact-sum search in the split calculator only looks at combinations of
/// at most this many whole tokens.
pub const MAX_EXACT_COMBINATION: usize = 3;

/// ...and only when the candidate set is small enough for the search to be
/// cheap. Larger wallets fall straight through to greedy selection.
pub const MAX_EXACT_SEARCH_TOKENS: usize = 24;

// ---------------------------------------------------------------------------
// Message Channel
// ---------------------------------------------------------------------------

/// Capacity of the processed-message set. Oldest settled entries are
/// evicted first once this is reached.
pub const PROCESSED_MESSAGE_CAPACITY: usize = 1_000;

/// Buffer size for the inbound message queue feeding the channel loop.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Outbound message statuses kept for [`status`] queries. The oldest are
/// forgotten first.
///
/// [`status`]: crate::messaging::MessageChannel::status
pub const OUTBOUND_STATUS_CAPACITY: usize = 1_000;

// ---------------------------------------------------------------------------
// Circuit Breaker
// ---------------------------------------------------------------------------

/// Consecutive storage failures before the wallet drops into LOCAL mode.
pub const STORAGE_FAILURE_THRESHOLD: u32 = 10;

/// Consecutive merge conflicts before the wallet drops into LOCAL mode.
pub const CONFLICT_THRESHOLD: u32 = 5;

/// How long LOCAL mode lasts before a recovery probe is allowed.
pub const LOCAL_MODE_RECOVERY_DELAY: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Content Resolver
// ---------------------------------------------------------------------------

/// A cached pointer record younger than this is served without touching
/// the network.
pub const RESOLUTION_CACHE_TTL: Duration = Duration::from_secs(60);

/// After every node failed to resolve a name, further lookups for the same
/// name short-circuit for this long.
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Snapshots kept in the content cache. Content is immutable, so older
/// entries are simply dropped and re-fetched if ever needed again.
pub const CONTENT_CACHE_CAPACITY: usize = 8;

/// Per-node request timeout for pointer resolution and content fetches.
pub const NODE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Once the first valid answer arrives, wait this much longer for
/// competing answers so the highest sequence number can win.
pub const RACE_GRACE_PERIOD: Duration = Duration::from_millis(150);

/// Attempts made by the publish verification poll.
pub const VERIFY_MAX_ATTEMPTS: u32 = 6;

/// First delay of the verification poll; doubles on each attempt.
pub const VERIFY_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Sync Engine
// ---------------------------------------------------------------------------

/// A caller that finds a sync in flight waits at most this long for it to
/// finish before proceeding on its own.
pub const SYNC_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the background sync loop.
pub const PERIODIC_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Buffer size of the wallet event bus. Slow subscribers past this lag
/// and get a `Lagged` error instead of blocking publishers.
pub const EVENT_BUS_CAPACITY: usize = 256;
