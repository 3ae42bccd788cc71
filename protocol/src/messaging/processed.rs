//! # Processed Message Set
//!
//! Bounded, persisted record of inbound message IDs whose effects have
//! been applied. Re-delivery of anything in here is a no-op.
//!
//! An entry is either `Done` or `AwaitingSync`: applied locally, but the
//! durable sync that makes it stick has not been confirmed yet. At
//! capacity the oldest `Done` entries are evicted first; `AwaitingSync`
//! entries are never evicted, so a message can't fall out of the set while
//! its outcome is still open.
//!
//! Only `Done` entries are persisted. After a crash, an `AwaitingSync`
//! message simply gets re-delivered and re-applied, which the handlers
//! tolerate. If persisting fails the entry is dropped from memory too, so
//! what this set reports never runs ahead of what is on disk.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use super::message::MessageId;
use crate::config::PROCESSED_MESSAGE_CAPACITY;
use crate::storage::db::{DbError, TreeName, WalletDb};

const META_PROCESSED: &[u8] = b"processed_messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessedState {
    AwaitingSync,
    Done,
}

#[derive(Default)]
struct Inner {
    order: VecDeque<MessageId>,
    entries: HashMap<MessageId, ProcessedState>,
}

impl Inner {
    fn insert(&mut self, id: MessageId, state: ProcessedState) {
        if self.entries.insert(id.clone(), state).is_none() {
            self.order.push_back(id);
        }
    }

    fn remove(&mut self, id: &MessageId) {
        if self.entries.remove(id).is_some() {
            self.order.retain(|m| m != id);
        }
    }

    /// Drops the oldest settled entries until the set fits `capacity`.
    /// Pinned entries are stepped over; if everything is pinned the set
    /// temporarily exceeds capacity.
    fn evict(&mut self, capacity: usize) {
        let mut i = 0;
        while self.entries.len() > capacity && i < self.order.len() {
            if self.entries.get(&self.order[i]) == Some(&ProcessedState::Done) {
                if let Some(id) = self.order.remove(i) {
                    self.entries.remove(&id);
                }
            } else {
                i += 1;
            }
        }
    }
}

pub struct ProcessedMessageSet {
    inner: Mutex<Inner>,
    capacity: usize,
    db: Option<WalletDb>,
}

impl ProcessedMessageSet {
    /// Non-persistent set. For tests.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            db: None,
        }
    }

    /// Loads the persisted set from `db`.
    pub fn load(db: WalletDb, capacity: usize) -> Result<Self, DbError> {
        let mut inner = Inner::default();
        let stored: Vec<MessageId> = db.get(TreeName::Meta, META_PROCESSED)?.unwrap_or_default();
        for id in stored {
            inner.insert(id, ProcessedState::Done);
        }
        inner.evict(capacity);
        Ok(Self {
            inner: Mutex::new(inner),
            capacity,
            db: Some(db),
        })
    }

    pub fn open(db: WalletDb) -> Result<Self, DbError> {
        Self::load(db, PROCESSED_MESSAGE_CAPACITY)
    }

    /// True if the message was applied or is being applied.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn state(&self, id: &MessageId) -> Option<ProcessedState> {
        self.inner.lock().entries.get(id).copied()
    }

    /// Claims `id` while its effects are committed. Returns `false` if it
    /// was already present.
    pub fn pin(&self, id: &MessageId) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(id) {
            return false;
        }
        inner.insert(id.clone(), ProcessedState::AwaitingSync);
        true
    }

    /// The pinned message's effects are durable.
    pub fn confirm(&self, id: &MessageId) -> Result<(), DbError> {
        self.settle(id)
    }

    /// The pinned message's commit failed; make it re-deliverable.
    pub fn unpin(&self, id: &MessageId) {
        let mut inner = self.inner.lock();
        if inner.entries.get(id) == Some(&ProcessedState::AwaitingSync) {
            inner.remove(id);
            debug!(message_id = %id, "message unpinned for retry");
        }
    }

    /// Records a message that needs no durable commit (not applicable,
    /// invalid, receipts).
    pub fn mark_processed(&self, id: &MessageId) -> Result<(), DbError> {
        self.settle(id)
    }

    fn settle(&self, id: &MessageId) -> Result<(), DbError> {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.insert(id.clone(), ProcessedState::Done);
            inner.evict(self.capacity);
            inner
                .order
                .iter()
                .filter(|m| inner.entries.get(*m) == Some(&ProcessedState::Done))
                .cloned()
                .collect::<Vec<_>>()
        };
        if let Some(db) = &self.db {
            if let Err(e) = db.put(TreeName::Meta, META_PROCESSED, &snapshot) {
                warn!(message_id = %id, error = %e, "failed to persist processed message set");
                self.inner.lock().remove(id);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> MessageId {
        MessageId::new(format!("m{n}"))
    }

    #[test]
    fn fifo_eviction_at_capacity() {
        let set = ProcessedMessageSet::in_memory(3);
        for n in 0..5 {
            set.mark_processed(&id(n)).unwrap();
        }
        assert_eq!(set.len(), 3);
        assert!(!set.contains(&id(0)));
        assert!(!set.contains(&id(1)));
        assert!(set.contains(&id(4)));
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let set = ProcessedMessageSet::in_memory(2);
        assert!(set.pin(&id(0)));
        for n in 1..5 {
            set.mark_processed(&id(n)).unwrap();
        }
        assert_eq!(set.state(&id(0)), Some(ProcessedState::AwaitingSync));
        assert!(set.len() <= 2);
        set.confirm(&id(0)).unwrap();
        assert_eq!(set.state(&id(0)), Some(ProcessedState::Done));
    }

    #[test]
    fn unpin_makes_message_redeliverable() {
        let set = ProcessedMessageSet::in_memory(10);
        assert!(set.pin(&id(1)));
        assert!(!set.pin(&id(1)));
        set.unpin(&id(1));
        assert!(!set.contains(&id(1)));
        assert!(set.pin(&id(1)));
    }

    #[test]
    fn unpin_does_not_touch_settled_entries() {
        let set = ProcessedMessageSet::in_memory(10);
        set.mark_processed(&id(1)).unwrap();
        set.unpin(&id(1));
        assert!(set.contains(&id(1)));
    }

    #[test]
    fn only_settled_entries_are_persisted() {
        let db = WalletDb::open_temporary().unwrap();
        {
            let set = ProcessedMessageSet::load(db.clone(), 10).unwrap();
            set.mark_processed(&id(1)).unwrap();
            set.pin(&id(2));
            set.mark_processed(&id(3)).unwrap();
        }
        let reloaded = ProcessedMessageSet::load(db, 10).unwrap();
        assert!(reloaded.contains(&id(1)));
        assert!(!reloaded.contains(&id(2)));
        assert!(reloaded.contains(&id(3)));
    }

    #[test]
    fn failed_persist_leaves_message_redeliverable() {
        let db = WalletDb::open_temporary().unwrap();
        let set = ProcessedMessageSet::load(db.clone(), 10).unwrap();
        assert!(set.pin(&id(1)));

        db.fail_writes(true);
        assert!(set.confirm(&id(1)).is_err());
        assert!(!set.contains(&id(1)));
        assert!(set.mark_processed(&id(2)).is_err());
        assert!(!set.contains(&id(2)));

        db.fail_writes(false);
        assert!(set.pin(&id(1)));
        set.confirm(&id(1)).unwrap();
        let reloaded = ProcessedMessageSet::load(db, 10).unwrap();
        assert!(reloaded.contains(&id(1)));
    }
}
