#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use ddnode_kernel::kv::{KvError, MemoryKv, MetaKv};
use ddnode_kernel::msg::{
    CreateCollectionMsg, DdMsg, DropCollectionMsg, MsgBase, PartitionMsg, Timestamp, UniqueId,
};

/// Memory store that fails the next `n` writes whose key starts with a prefix.
pub struct FlakyKv {
    pub inner: MemoryKv,
    prefix: String,
    failures: AtomicUsize,
}

impl FlakyKv {
    pub fn failing(prefix: &str, n: usize) -> Self {
        Self {
            inner: MemoryKv::new(),
            prefix: prefix.to_string(),
            failures: AtomicUsize::new(n),
        }
    }

    /// Fail the next `n` matching writes from now on.
    pub fn arm(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn remaining_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, key: &str) -> Result<(), KvError> {
        if key.starts_with(&self.prefix)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(KvError::Unavailable(format!("injected failure on {key}")));
        }
        Ok(())
    }
}

impl MetaKv for FlakyKv {
    fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.check(key)?;
        self.inner.put(key, value)
    }

    fn multi_put(&self, entries: &[(String, String)]) -> Result<(), KvError> {
        for (key, _) in entries {
            self.check(key)?;
        }
        self.inner.multi_put(entries)
    }

    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get(key)
    }

    fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        self.inner.load_with_prefix(prefix)
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.check(key)?;
        self.inner.remove(key)
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<(), KvError> {
        self.check(prefix)?;
        self.inner.remove_with_prefix(prefix)
    }

    fn multi_remove(&self, keys: &[String], prefixes: &[String]) -> Result<(), KvError> {
        for key in keys.iter().chain(prefixes) {
            self.check(key)?;
        }
        self.inner.multi_remove(keys, prefixes)
    }
}

pub fn base(ts: Timestamp) -> MsgBase {
    MsgBase {
        msg_id: ts as UniqueId,
        timestamp: ts,
        source_id: 1,
    }
}

pub fn create_collection(id: UniqueId, ts: Timestamp) -> DdMsg {
    DdMsg::CreateCollection(CreateCollectionMsg {
        base: base(ts),
        collection_id: id,
        collection_name: format!("col-test-{id}"),
        schema: vec![],
    })
}

pub fn drop_collection(id: UniqueId, ts: Timestamp) -> DdMsg {
    DdMsg::DropCollection(DropCollectionMsg {
        base: base(ts),
        collection_id: id,
        collection_name: format!("col-test-{id}"),
    })
}

fn partition(collection_id: UniqueId, partition_id: UniqueId, ts: Timestamp) -> PartitionMsg {
    PartitionMsg {
        base: base(ts),
        collection_id,
        partition_id,
        collection_name: format!("col-test-{collection_id}"),
        partition_name: format!("partition-test-{partition_id}"),
    }
}

pub fn create_partition(collection_id: UniqueId, partition_id: UniqueId, ts: Timestamp) -> DdMsg {
    DdMsg::CreatePartition(partition(collection_id, partition_id, ts))
}

pub fn drop_partition(collection_id: UniqueId, partition_id: UniqueId, ts: Timestamp) -> DdMsg {
    DdMsg::DropPartition(partition(collection_id, partition_id, ts))
}
