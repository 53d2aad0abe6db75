// Metadata Table
//
// Durable collection, partition and segment-flush entries, keyed by stable
// paths derived from their ids:
//
//   writer/collection/{collection_id}
//   writer/partition/{collection_id}/{partition_id}
//   writer/segment/{segment_id}
//
// The state machine writes here before touching the replica, so the
// replica is never ahead of durable state.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::kv::{KvError, MetaKv};
use crate::msg::{Timestamp, UniqueId};

pub const COLLECTION_PREFIX: &str = "writer/collection/";
pub const PARTITION_PREFIX: &str = "writer/partition/";
pub const SEGMENT_PREFIX: &str = "writer/segment/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub collection_id: UniqueId,
    pub collection_name: String,
    pub schema: Vec<u8>,
    pub create_ts: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub partition_name: String,
    pub create_ts: Timestamp,
}

/// Bookkeeping for a segment sealed by a flush event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFlushMeta {
    pub segment_id: UniqueId,
    pub collection_id: UniqueId,
    pub flush_ts: Timestamp,
    pub flush_msg_id: UniqueId,
}

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("store error: {0}")]
    Store(#[from] KvError),

    #[error("corrupt entry at `{key}`: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode entry: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Access layer over the durable metadata store.
#[derive(Clone)]
pub struct MetaTable {
    kv: Arc<dyn MetaKv>,
}

impl std::fmt::Debug for MetaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaTable").finish_non_exhaustive()
    }
}

impl MetaTable {
    pub fn new(kv: Arc<dyn MetaKv>) -> Self {
        Self { kv }
    }

    fn collection_key(collection_id: UniqueId) -> String {
        format!("{COLLECTION_PREFIX}{collection_id}")
    }

    fn partition_key(collection_id: UniqueId, partition_id: UniqueId) -> String {
        format!("{PARTITION_PREFIX}{collection_id}/{partition_id}")
    }

    fn segment_key(segment_id: UniqueId) -> String {
        format!("{SEGMENT_PREFIX}{segment_id}")
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MetaError> {
        let value = serde_json::to_string(value).map_err(MetaError::Encode)?;
        self.kv.put(key, &value)?;
        Ok(())
    }

    fn load_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, MetaError> {
        self.kv
            .load_with_prefix(prefix)?
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_str(&value).map_err(|source| MetaError::Corrupt { key, source })
            })
            .collect()
    }

    pub fn add_collection(&self, meta: &CollectionMeta) -> Result<(), MetaError> {
        self.put_json(&Self::collection_key(meta.collection_id), meta)
    }

    /// Remove a collection together with every partition entry under it,
    /// in one store write.
    pub fn remove_collection(&self, collection_id: UniqueId) -> Result<(), MetaError> {
        self.kv.multi_remove(
            &[Self::collection_key(collection_id)],
            &[format!("{PARTITION_PREFIX}{collection_id}/")],
        )?;
        Ok(())
    }

    pub fn add_partition(&self, meta: &PartitionMeta) -> Result<(), MetaError> {
        self.put_json(
            &Self::partition_key(meta.collection_id, meta.partition_id),
            meta,
        )
    }

    pub fn remove_partition(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
    ) -> Result<(), MetaError> {
        self.kv
            .remove(&Self::partition_key(collection_id, partition_id))?;
        Ok(())
    }

    pub fn has_collection(&self, collection_id: UniqueId) -> Result<bool, MetaError> {
        Ok(self.kv.get(&Self::collection_key(collection_id))?.is_some())
    }

    pub fn collections(&self) -> Result<Vec<CollectionMeta>, MetaError> {
        self.load_json(COLLECTION_PREFIX)
    }

    pub fn partitions(&self) -> Result<Vec<PartitionMeta>, MetaError> {
        self.load_json(PARTITION_PREFIX)
    }

    pub fn record_segment_flush(&self, meta: &SegmentFlushMeta) -> Result<(), MetaError> {
        self.put_json(&Self::segment_key(meta.segment_id), meta)
    }

    pub fn segment_flushes(&self) -> Result<Vec<SegmentFlushMeta>, MetaError> {
        self.load_json(SEGMENT_PREFIX)
    }
}
