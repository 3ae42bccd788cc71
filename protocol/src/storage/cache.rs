//! Resolution cache with negative-result backoff.
//!
//! Pointer records are only ever replaced by records with a strictly
//! greater sequence number, whatever order answers arrive in. Content is
//! immutable and cached by address, holding at most `content_capacity`
//! blobs; the oldest insert is dropped first.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::content::ContentAddress;
use super::node::PointerRecord;
use crate::clock::{to_chrono, Clock};

#[derive(Debug, Clone)]
struct CachedPointer {
    record: PointerRecord,
    cached_at: DateTime<Utc>,
}

#[derive(Default)]
struct ContentCache {
    blobs: HashMap<ContentAddress, Vec<u8>>,
    order: VecDeque<ContentAddress>,
}

pub struct ResolutionCache {
    pointers: Mutex<HashMap<String, CachedPointer>>,
    content: Mutex<ContentCache>,
    failures: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
    negative_ttl: Duration,
    content_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl ResolutionCache {
    pub fn new(ttl: Duration, negative_ttl: Duration, content_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            pointers: Mutex::new(HashMap::new()),
            content: Mutex::new(ContentCache::default()),
            failures: Mutex::new(HashMap::new()),
            ttl,
            negative_ttl,
            content_capacity,
            clock,
        }
    }

    /// Offers a record. Returns `true` if it became the cached record.
    /// An equal sequence with the same address refreshes the entry.
    pub fn offer(&self, record: PointerRecord) -> bool {
        let now = self.clock.now();
        let mut pointers = self.pointers.lock();
        match pointers.get_mut(&record.name) {
            Some(current) if record.sequence > current.record.sequence => {
                *current = CachedPointer {
                    record,
                    cached_at: now,
                };
                true
            }
            Some(current) => {
                if record.sequence == current.record.sequence && record.address == current.record.address {
                    current.cached_at = now;
                }
                false
            }
            None => {
                pointers.insert(
                    record.name.clone(),
                    CachedPointer {
                        record,
                        cached_at: now,
                    },
                );
                true
            }
        }
    }

    /// The cached record if it is younger than the TTL.
    pub fn fresh(&self, name: &str) -> Option<PointerRecord> {
        let now = self.clock.now();
        self.pointers
            .lock()
            .get(name)
            .filter(|c| now - c.cached_at < to_chrono(self.ttl))
            .map(|c| c.record.clone())
    }

    /// The cached record regardless of age.
    pub fn get(&self, name: &str) -> Option<PointerRecord> {
        self.pointers.lock().get(name).map(|c| c.record.clone())
    }

    pub fn sequence(&self, name: &str) -> Option<u64> {
        self.pointers.lock().get(name).map(|c| c.record.sequence)
    }

    pub fn put_content(&self, address: ContentAddress, bytes: Vec<u8>) {
        if self.content_capacity == 0 {
            return;
        }
        let mut content = self.content.lock();
        if content.blobs.insert(address, bytes).is_none() {
            content.order.push_back(address);
        }
        while content.order.len() > self.content_capacity {
            if let Some(oldest) = content.order.pop_front() {
                content.blobs.remove(&oldest);
            }
        }
    }

    pub fn content(&self, address: &ContentAddress) -> Option<Vec<u8>> {
        self.content.lock().blobs.get(address).cloned()
    }

    pub fn content_len(&self) -> usize {
        self.content.lock().blobs.len()
    }

    pub fn record_failure(&self, name: &str) {
        self.failures.lock().insert(name.to_string(), self.clock.now());
    }

    /// True if every node failed for `name` within the negative TTL.
    pub fn recently_failed(&self, name: &str) -> bool {
        let now = self.clock.now();
        let mut failures = self.failures.lock();
        match failures.get(name) {
            Some(at) if now - *at < to_chrono(self.negative_ttl) => true,
            Some(_) => {
                failures.remove(name);
                false
            }
            None => false,
        }
    }

    pub fn clear_failure(&self, name: &str) {
        self.failures.lock().remove(name);
    }
}
