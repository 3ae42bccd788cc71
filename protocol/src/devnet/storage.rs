//! In-memory content-addressed storage.
//!
//! Nodes created over the same [`StorageBackend`] see the same data, like
//! gateways in front of one network. Each node has its own knobs: go
//! offline, corrupt content, answer slowly, or serve a fixed (stale or
//! forged) pointer record.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::content::ContentAddress;
use crate::storage::node::{NodeError, PointerRecord, StorageNode};

#[derive(Default)]
struct BackendInner {
    pointers: HashMap<String, PointerRecord>,
    content: HashMap<ContentAddress, Vec<u8>>,
}

/// Shared data behind one or more nodes.
#[derive(Clone, Default)]
pub struct StorageBackend {
    inner: Arc<Mutex<BackendInner>>,
}

impl StorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pointer(&self, name: &str) -> Option<PointerRecord> {
        self.inner.lock().pointers.get(name).cloned()
    }

    pub fn content(&self, address: &ContentAddress) -> Option<Vec<u8>> {
        self.inner.lock().content.get(address).cloned()
    }
}

#[derive(Default)]
struct Knobs {
    offline: bool,
    corrupt: bool,
    delay: Option<Duration>,
    served_pointer: Option<PointerRecord>,
}

pub struct InMemoryStorageNode {
    id: String,
    backend: StorageBackend,
    knobs: Mutex<Knobs>,
    requests: AtomicU64,
}

impl InMemoryStorageNode {
    pub fn new(id: &str, backend: StorageBackend) -> Self {
        Self {
            id: id.to_string(),
            backend,
            knobs: Mutex::new(Knobs::default()),
            requests: AtomicU64::new(0),
        }
    }

    /// While offline every call fails with [`NodeError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.knobs.lock().offline = offline;
    }

    /// While set, fetched content has its last byte flipped.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.knobs.lock().corrupt = corrupt;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.knobs.lock().delay = delay;
    }

    /// Answer every resolve with `record`, whatever the backend holds.
    pub fn serve_pointer(&self, record: PointerRecord) {
        self.knobs.lock().served_pointer = Some(record);
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Calls received, including ones that failed.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    async fn enter(&self) -> Result<(), NodeError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let (offline, delay) = {
            let knobs = self.knobs.lock();
            (knobs.offline, knobs.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if offline {
            return Err(NodeError::Unavailable(format!("{} offline", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageNode for InMemoryStorageNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resolve(&self, name: &str) -> Result<Option<PointerRecord>, NodeError> {
        self.enter().await?;
        if let Some(record) = self.knobs.lock().served_pointer.clone() {
            return Ok(Some(record));
        }
        Ok(self.backend.pointer(name))
    }

    async fn fetch(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, NodeError> {
        self.enter().await?;
        let mut bytes = self.backend.content(address);
        if self.knobs.lock().corrupt {
            if let Some(last) = bytes.as_mut().and_then(|b| b.last_mut()) {
                *last ^= 0xFF;
            }
        }
        Ok(bytes)
    }

    async fn store(&self, bytes: Vec<u8>) -> Result<ContentAddress, NodeError> {
        self.enter().await?;
        let address = ContentAddress::for_content(&bytes);
        self.backend.inner.lock().content.insert(address, bytes);
        Ok(address)
    }

    async fn publish(&self, record: &PointerRecord) -> Result<(), NodeError> {
        self.enter().await?;
        if !record.verify() {
            return Err(NodeError::Rejected("bad pointer signature".into()));
        }
        let mut inner = self.backend.inner.lock();
        if let Some(current) = inner.pointers.get(&record.name) {
            if record.sequence < current.sequence
                || (record.sequence == current.sequence && record.address != current.address)
            {
                return Err(NodeError::Rejected(format!(
                    "sequence {} does not supersede {}",
                    record.sequence, current.sequence
                )));
            }
        }
        inner.pointers.insert(record.name.clone(), record.clone());
        Ok(())
    }
}
