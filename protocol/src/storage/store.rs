//! # Token Store
//!
//! The wallet's local token set, spent-token tombstones and the persisted
//! transaction log, layered over [`WalletDb`].
//!
//! The store is mutated only after a network step has succeeded, and all
//! multi-step mutations (read, derive new value, write) go through one
//! writer lock. There is no cross-object transaction: the transaction log
//! is what keeps an interrupted operation visible and re-drivable.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::db::{DbError, TreeName, WalletDb};
use crate::crypto::hex_serde;
use crate::token::object::{SplitOutput, TokenError, TokenId, TokenKind};
use crate::token::owned::{Token, TokenRecord, TokenStatus};
use crate::token::predicate::Address;
use crate::token::{Amount, CoinId};
use crate::transfer::commitment::{TransferCommitment, TransferTransaction};
use crate::transfer::payload::Recipient;

const META_SYNC_STATE: &[u8] = b"sync_state";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("stored token failed verification: {0}")]
    Token(#[from] TokenError),

    #[error("token {0} not found")]
    NotFound(TokenId),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Marks a token state as spent. A token coming back (from a peer or a
/// remote snapshot) in exactly this state is dropped on sight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub token_id: TokenId,
    #[serde(with = "hex_serde")]
    pub state_hash: [u8; 32],
    pub retired_at: DateTime<Utc>,
}

/// One in-flight operation. Written before the first network submission
/// and removed once the operation has resolved one way or the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLogEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub op: PendingOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOp {
    /// A whole-token transfer.
    Send {
        token_id: TokenId,
        peer_id: String,
        commitment: TransferCommitment,
        stage: SendStage,
    },
    /// A split of `source_token_id` into `outputs`.
    Split {
        source_token_id: TokenId,
        burn: TransferCommitment,
        outputs: Vec<SplitOutput>,
        /// Where the first output goes once minted.
        recipient: Recipient,
        stage: SplitStage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStage {
    /// Commitment submitted, proof not yet seen.
    Submitted,
    /// Proof obtained; the payload still has to reach the peer.
    AwaitingDelivery { payload: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStage {
    Burning,
    Minting { burn: TransferTransaction },
}

/// Bookkeeping for the sync engine: which remote sequence we last merged
/// and whether local changes are waiting to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_seen_sequence: Option<u64>,
    pub dirty: bool,
    pub last_published_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

pub struct TokenStore {
    db: WalletDb,
    write_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(db: WalletDb) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    pub fn db(&self) -> &WalletDb {
        &self.db
    }

    // -- Tokens -------------------------------------------------------------

    /// Inserts or replaces a token. Nametag tokens are indexed by the proxy
    /// address they bind.
    pub fn put(&self, token: &Token) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.put_locked(token)?;
        self.mark_dirty_locked()?;
        Ok(())
    }

    fn put_locked(&self, token: &Token) -> StoreResult<()> {
        let key = token.token_id();
        self.db.put(TreeName::Tokens, key.as_bytes(), &token.to_record())?;
        if let (TokenKind::Nametag, Some(name)) = (token.kind(), token.nametag()) {
            let address = Address::for_nametag(name);
            self.db
                .put_raw(TreeName::Nametags, address.body(), key.as_bytes())?;
        }
        debug!(token_id = %key, status = %token.status, "token stored");
        Ok(())
    }

    pub fn get(&self, token_id: &TokenId) -> StoreResult<Option<Token>> {
        match self.db.get::<TokenRecord>(TreeName::Tokens, token_id.as_bytes())? {
            Some(record) => Ok(Some(Token::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// All tokens that still verify. A record that fails re-verification
    /// is skipped with a warning, never trusted.
    pub fn tokens(&self) -> StoreResult<Vec<Token>> {
        let records = self.db.scan::<TokenRecord>(TreeName::Tokens)?;
        let mut tokens = Vec::with_capacity(records.len());
        for (key, record) in records {
            match Token::from_record(record) {
                Ok(token) => tokens.push(token),
                Err(e) => warn!(key = %hex::encode(key), error = %e, "skipping unverifiable token"),
            }
        }
        Ok(tokens)
    }

    pub fn spendable(&self, coin_id: &CoinId) -> StoreResult<Vec<Token>> {
        Ok(self
            .tokens()?
            .into_iter()
            .filter(|t| t.is_spendable(coin_id))
            .collect())
    }

    /// Sum of confirmed and pending tokens of a coin. Pending tokens are
    /// still owned until the network says otherwise.
    pub fn balance(&self, coin_id: &CoinId) -> StoreResult<Amount> {
        Ok(self
            .tokens()?
            .iter()
            .filter(|t| {
                t.coin_id().as_ref() == Some(coin_id)
                    && matches!(t.status, TokenStatus::Confirmed | TokenStatus::Pending)
            })
            .map(|t| t.amount().clone())
            .sum())
    }

    /// Replaces a token's status, returning the new value.
    pub fn set_status(&self, token_id: &TokenId, status: TokenStatus) -> StoreResult<Token> {
        let _guard = self.write_lock.lock();
        let current = self.get(token_id)?.ok_or(StoreError::NotFound(*token_id))?;
        let next = current.with_status(status);
        self.put_locked(&next)?;
        Ok(next)
    }

    /// Removes a spent token and tombstones its final local state.
    pub fn retire(
        &self,
        token_id: &TokenId,
        reason: TokenStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Token>> {
        let _guard = self.write_lock.lock();
        let Some(token) = self.get(token_id)? else {
            return Ok(None);
        };
        let tombstone = Tombstone {
            token_id: *token_id,
            state_hash: token.object().state.hash(),
            retired_at: now,
        };
        self.db
            .put(TreeName::Tombstones, token_id.as_bytes(), &tombstone)?;
        self.db.remove(TreeName::Tokens, token_id.as_bytes())?;
        if let Some(name) = token.nametag() {
            self.db
                .remove(TreeName::Nametags, Address::for_nametag(name).body())?;
        }
        self.mark_dirty_locked()?;
        debug!(token_id = %token_id, %reason, "token retired");
        Ok(Some(token.with_status(reason)))
    }

    pub fn tombstones(&self) -> StoreResult<Vec<Tombstone>> {
        Ok(self
            .db
            .scan::<Tombstone>(TreeName::Tombstones)?
            .into_iter()
            .map(|(_, t)| t)
            .collect())
    }

    /// True if `token_id` was retired in exactly the state `state_hash`.
    pub fn is_tombstoned(&self, token_id: &TokenId, state_hash: &[u8; 32]) -> StoreResult<bool> {
        Ok(self
            .db
            .get::<Tombstone>(TreeName::Tombstones, token_id.as_bytes())?
            .is_some_and(|t| &t.state_hash == state_hash))
    }

    /// The owned nametag token bound to a proxy address, if any.
    pub fn nametag_for(&self, address: &Address) -> StoreResult<Option<Token>> {
        let Some(raw) = self.db.get_raw(TreeName::Nametags, address.body())? else {
            return Ok(None);
        };
        let Ok(bytes) = <[u8; 32]>::try_from(raw.as_slice()) else {
            return Ok(None);
        };
        self.get(&TokenId::from_bytes(bytes))
    }

    pub fn nametags(&self) -> StoreResult<Vec<Token>> {
        Ok(self
            .tokens()?
            .into_iter()
            .filter(|t| t.kind() == TokenKind::Nametag)
            .collect())
    }

    /// Applies the remote side of a snapshot merge without touching local
    /// work done since the merge was computed. Tombstones land first and
    /// evict matching tokens; an incoming token replaces a local one only
    /// if its history is longer. Does not mark the store dirty. Returns the
    /// number of tokens added or replaced.
    pub fn apply_remote(&self, tokens: &[Token], tombstones: &[Tombstone]) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        for tombstone in tombstones {
            let key = tombstone.token_id.as_bytes();
            let newer = self
                .db
                .get::<Tombstone>(TreeName::Tombstones, key)?
                .map_or(true, |t| t.retired_at < tombstone.retired_at);
            if newer {
                self.db.put(TreeName::Tombstones, key, tombstone)?;
            }
            if let Some(local) = self.get(&tombstone.token_id)? {
                if local.object().state.hash() == tombstone.state_hash {
                    self.db.remove(TreeName::Tokens, key)?;
                    if let Some(name) = local.nametag() {
                        self.db
                            .remove(TreeName::Nametags, Address::for_nametag(name).body())?;
                    }
                    debug!(token_id = %tombstone.token_id, "token retired by remote tombstone");
                }
            }
        }

        let mut applied = 0;
        for token in tokens {
            let id = token.token_id();
            if self.is_tombstoned(&id, &token.object().state.hash())? {
                continue;
            }
            let replace = match self.get(&id)? {
                Some(local) => token.object().transactions.len() > local.object().transactions.len(),
                None => true,
            };
            if replace {
                self.put_locked(token)?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    // -- Transaction log ----------------------------------------------------

    pub fn log_put(&self, entry: &TxLogEntry) -> StoreResult<()> {
        self.db.put(TreeName::TxLog, entry.id.as_bytes(), entry)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn log_remove(&self, id: &Uuid) -> StoreResult<()> {
        self.db.remove(TreeName::TxLog, id.as_bytes())?;
        Ok(())
    }

    /// Open log entries, oldest first.
    pub fn log_entries(&self) -> StoreResult<Vec<TxLogEntry>> {
        let mut entries: Vec<TxLogEntry> = self
            .db
            .scan::<TxLogEntry>(TreeName::TxLog)?
            .into_iter()
            .map(|(_, e)| e)
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    // -- Sync bookkeeping ---------------------------------------------------

    pub fn sync_state(&self) -> StoreResult<SyncState> {
        Ok(self
            .db
            .get(TreeName::Meta, META_SYNC_STATE)?
            .unwrap_or_default())
    }

    pub fn set_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        self.db.put(TreeName::Meta, META_SYNC_STATE, state)?;
        Ok(())
    }

    pub fn is_dirty(&self) -> StoreResult<bool> {
        Ok(self.sync_state()?.dirty)
    }

    /// Clears the dirty flag and returns its previous value. Taken before a
    /// sync reads the token set, so any write after this point marks the
    /// store dirty again.
    pub fn take_dirty(&self) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let mut state = self.sync_state()?;
        let was_dirty = state.dirty;
        if was_dirty {
            state.dirty = false;
            self.set_sync_state(&state)?;
        }
        Ok(was_dirty)
    }

    pub fn mark_dirty(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.mark_dirty_locked()
    }

    /// Records the remote sequence the store now reflects.
    pub fn record_synced(&self, sequence: u64, published_at: Option<DateTime<Utc>>) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let mut state = self.sync_state()?;
        state.last_seen_sequence = Some(sequence);
        if published_at.is_some() {
            state.last_published_at = published_at;
        }
        self.set_sync_state(&state)?;
        Ok(())
    }

    fn mark_dirty_locked(&self) -> StoreResult<()> {
        let mut state = self.sync_state()?;
        if !state.dirty {
            state.dirty = true;
            self.set_sync_state(&state)?;
        }
        Ok(())
    }
}
