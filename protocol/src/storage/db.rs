//! # WalletDb: Persistent Storage Engine
//!
//! Everything the wallet must not forget lives in one embedded sled
//! database, split into named trees:
//!
//! | Tree         | Key                     | Value                      |
//! |--------------|-------------------------|----------------------------|
//! | `tokens`     | token ID (32B)          | `bincode(TokenRecord)`     |
//! | `nametags`   | proxy address body (32B)| token ID (32B)             |
//! | `tombstones` | token ID (32B)          | `bincode(Tombstone)`       |
//! | `tx_log`     | entry ID (16B uuid)     | `bincode(TxLogEntry)`      |
//! | `meta`       | key (UTF-8)             | `bincode(..)`              |
//!
//! `meta` holds the small singleton records: processed message IDs,
//! circuit breaker state, the last published pointer and the dirty flag.
//!
//! Records use bincode. Anything that crosses the wire uses JSON instead;
//! the two never mix.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Named trees. Using an enum keeps tree names out of call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeName {
    Tokens,
    Nametags,
    Tombstones,
    TxLog,
    Meta,
}

impl TreeName {
    fn as_str(self) -> &'static str {
        match self {
            TreeName::Tokens => "tokens",
            TreeName::Nametags => "nametags",
            TreeName::Tombstones => "tombstones",
            TreeName::TxLog => "tx_log",
            TreeName::Meta => "meta",
        }
    }
}

/// Persistent storage for one wallet.
///
/// sled is thread-safe; `WalletDb` is a cheap handle and can be cloned
/// into every component that needs it.
#[derive(Debug, Clone)]
pub struct WalletDb {
    db: Db,
    tokens: Tree,
    nametags: Tree,
    tombstones: Tree,
    tx_log: Tree,
    meta: Tree,
    /// Fault injection for tests: typed writes fail while set.
    #[cfg(test)]
    fail_writes: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl WalletDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database, removed on drop. For tests and devnets.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            tokens: db.open_tree(TreeName::Tokens.as_str())?,
            nametags: db.open_tree(TreeName::Nametags.as_str())?,
            tombstones: db.open_tree(TreeName::Tombstones.as_str())?,
            tx_log: db.open_tree(TreeName::TxLog.as_str())?,
            meta: db.open_tree(TreeName::Meta.as_str())?,
            db,
            #[cfg(test)]
            fail_writes: Default::default(),
        })
    }

    fn tree(&self, name: TreeName) -> &Tree {
        match name {
            TreeName::Tokens => &self.tokens,
            TreeName::Nametags => &self.nametags,
            TreeName::Tombstones => &self.tombstones,
            TreeName::TxLog => &self.tx_log,
            TreeName::Meta => &self.meta,
        }
    }

    // -- Typed record access ------------------------------------------------

    pub fn put<T: Serialize>(&self, tree: TreeName, key: &[u8], value: &T) -> DbResult<()> {
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DbError::Sled(sled::Error::Unsupported("writes disabled".into())));
        }
        let bytes = encode(value)?;
        self.tree(tree).insert(key, bytes)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, tree: TreeName, key: &[u8]) -> DbResult<Option<T>> {
        match self.tree(tree).get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, tree: TreeName, key: &[u8]) -> DbResult<bool> {
        Ok(self.tree(tree).remove(key)?.is_some())
    }

    pub fn contains(&self, tree: TreeName, key: &[u8]) -> DbResult<bool> {
        Ok(self.tree(tree).contains_key(key)?)
    }

    /// Every record in a tree, in key order. Records that fail to decode
    /// are returned as errors rather than skipped; callers decide.
    pub fn scan<T: DeserializeOwned>(&self, tree: TreeName) -> DbResult<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for entry in self.tree(tree).iter() {
            let (key, value) = entry?;
            out.push((key.to_vec(), decode(&value)?));
        }
        Ok(out)
    }

    /// Raw key/value insert for index trees whose values are plain bytes.
    pub fn put_raw(&self, tree: TreeName, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.tree(tree).insert(key, value)?;
        Ok(())
    }

    pub fn get_raw(&self, tree: TreeName, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.tree(tree).get(key)?.map(|v| v.to_vec()))
    }

    pub fn len(&self, tree: TreeName) -> usize {
        self.tree(tree).len()
    }

    pub fn is_empty(&self, tree: TreeName) -> bool {
        self.tree(tree).is_empty()
    }

    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Blocks until every pending write is on disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}
