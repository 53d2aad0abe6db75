// Durable Metadata Store Contract
//
// Key-scoped persistent storage used by the ingestion node. Keys are
// logical, path-style strings (`writer/ddl/...`) and every operation is
// scoped to the store's root path.

use std::collections::BTreeMap;
use std::sync::RwLock;

pub mod redb_store;

pub use redb_store::{RedbKv, DB_FILE_NAME};

/// Errors raised by a metadata store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

/// Storage backend for definitional metadata.
///
/// Properties required from implementations:
/// - A put that returned `Ok` survives a crash of the node
/// - `multi_put`, `remove_with_prefix` and `multi_remove` are atomic: a
///   failed call leaves the store as it was
/// - Prefix loads return entries sorted by key
///
/// Implementations must be safe to share between threads; the state
/// machine is not the only writer in a running node.
pub trait MetaKv: Send + Sync {
    fn put(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Write several keys at once.
    fn multi_put(&self, entries: &[(String, String)]) -> Result<(), KvError>;

    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Load every `(key, value)` whose key starts with `prefix`, in key order.
    fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), KvError>;

    fn remove_with_prefix(&self, prefix: &str) -> Result<(), KvError>;

    /// Remove `keys` and every key under `prefixes` in one write.
    fn multi_remove(&self, keys: &[String], prefixes: &[String]) -> Result<(), KvError>;
}

/// In-memory store backed by a `BTreeMap`.
///
/// Not durable; used in tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetaKv for MemoryKv {
    fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned)?;
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn multi_put(&self, entries: &[(String, String)]) -> Result<(), KvError> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned)?;
        for (key, value) in entries {
            data.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let data = self.data.read().map_err(|_| KvError::Poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        let data = self.data.read().map_err(|_| KvError::Poisoned)?;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned)?;
        data.remove(key);
        Ok(())
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<(), KvError> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned)?;
        data.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn multi_remove(&self, keys: &[String], prefixes: &[String]) -> Result<(), KvError> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned)?;
        data.retain(|k, _| !prefixes.iter().any(|p| k.starts_with(p.as_str())));
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}
