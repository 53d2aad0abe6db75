// Collection Replica
//
// Node-local, in-memory view of which collections and partitions currently
// accept writes. Pure state: no I/O, mutated only by the DD state machine
// and by recovery replay.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::log::{DdlOp, DdlRecord};
use crate::meta::{CollectionMeta, PartitionMeta};
use crate::msg::UniqueId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("collection {0} is not live")]
    MissingCollection(UniqueId),

    #[error("partition {partition_id} already belongs to collection {owner}")]
    PartitionOwned {
        partition_id: UniqueId,
        owner: UniqueId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CollectionEntry {
    name: String,
    partitions: BTreeSet<UniqueId>,
}

/// Live collections and the partitions each one owns.
///
/// A partition is only ever present while its collection is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    collections: BTreeMap<UniqueId, CollectionEntry>,
    partition_owner: BTreeMap<UniqueId, UniqueId>,
}

/// Serializable view of one live collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionView {
    pub collection_id: UniqueId,
    pub collection_name: String,
    pub partitions: Vec<UniqueId>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a replica from durable metadata entries. Partitions whose
    /// collection is missing are returned separately instead of inserted.
    pub fn from_meta(
        collections: &[CollectionMeta],
        partitions: &[PartitionMeta],
    ) -> (Self, Vec<PartitionMeta>) {
        let mut replica = Self::new();
        for c in collections {
            replica.add_collection(c.collection_id, &c.collection_name);
        }

        let mut orphans = Vec::new();
        for p in partitions {
            if replica.add_partition(p.collection_id, p.partition_id).is_err() {
                orphans.push(p.clone());
            }
        }
        (replica, orphans)
    }

    pub fn add_collection(&mut self, collection_id: UniqueId, name: &str) -> bool {
        if self.collections.contains_key(&collection_id) {
            return false;
        }
        self.collections.insert(
            collection_id,
            CollectionEntry {
                name: name.to_string(),
                partitions: BTreeSet::new(),
            },
        );
        true
    }

    /// Remove a collection and every partition it owns.
    pub fn remove_collection(&mut self, collection_id: UniqueId) -> bool {
        match self.collections.remove(&collection_id) {
            Some(entry) => {
                for partition_id in entry.partitions {
                    self.partition_owner.remove(&partition_id);
                }
                true
            }
            None => false,
        }
    }

    pub fn add_partition(
        &mut self,
        collection_id: UniqueId,
        partition_id: UniqueId,
    ) -> Result<bool, ReplicaError> {
        if let Some(&owner) = self.partition_owner.get(&partition_id) {
            if owner == collection_id {
                return Ok(false);
            }
            return Err(ReplicaError::PartitionOwned {
                partition_id,
                owner,
            });
        }

        let entry = self
            .collections
            .get_mut(&collection_id)
            .ok_or(ReplicaError::MissingCollection(collection_id))?;
        entry.partitions.insert(partition_id);
        self.partition_owner.insert(partition_id, collection_id);
        Ok(true)
    }

    pub fn remove_partition(&mut self, collection_id: UniqueId, partition_id: UniqueId) -> bool {
        if self.partition_owner.get(&partition_id) != Some(&collection_id) {
            return false;
        }
        self.partition_owner.remove(&partition_id);
        if let Some(entry) = self.collections.get_mut(&collection_id) {
            entry.partitions.remove(&partition_id);
        }
        true
    }

    /// Apply a recorded event. Returns whether state changed; replaying an
    /// already-reflected record is a no-op.
    pub fn apply_record(&mut self, record: &DdlRecord) -> Result<bool, ReplicaError> {
        match &record.op {
            DdlOp::CreateCollection {
                collection_id,
                collection_name,
                ..
            } => Ok(self.add_collection(*collection_id, collection_name)),
            DdlOp::DropCollection { collection_id, .. } => {
                Ok(self.remove_collection(*collection_id))
            }
            DdlOp::CreatePartition {
                collection_id,
                partition_id,
                ..
            } => self.add_partition(*collection_id, *partition_id),
            DdlOp::DropPartition {
                collection_id,
                partition_id,
                ..
            } => Ok(self.remove_partition(*collection_id, *partition_id)),
        }
    }

    pub fn has_collection(&self, collection_id: UniqueId) -> bool {
        self.collections.contains_key(&collection_id)
    }

    pub fn has_partition(&self, collection_id: UniqueId, partition_id: UniqueId) -> bool {
        self.partition_owner.get(&partition_id) == Some(&collection_id)
    }

    pub fn partition_owner(&self, partition_id: UniqueId) -> Option<UniqueId> {
        self.partition_owner.get(&partition_id).copied()
    }

    pub fn collection_ids(&self) -> impl Iterator<Item = UniqueId> + '_ {
        self.collections.keys().copied()
    }

    pub fn partitions_of(&self, collection_id: UniqueId) -> Vec<UniqueId> {
        self.collections
            .get(&collection_id)
            .map(|e| e.partitions.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn partition_count(&self) -> usize {
        self.partition_owner.len()
    }

    /// Every `(collection_id, partition_id)` pair whose parent is not live
    /// or whose ownership maps disagree. Empty for a consistent replica.
    pub fn dangling_partitions(&self) -> Vec<(UniqueId, UniqueId)> {
        let mut dangling: Vec<_> = self
            .partition_owner
            .iter()
            .filter(|(pid, cid)| {
                self.collections
                    .get(cid)
                    .map_or(true, |e| !e.partitions.contains(pid))
            })
            .map(|(pid, cid)| (*cid, *pid))
            .collect();

        for (cid, entry) in &self.collections {
            for pid in &entry.partitions {
                if self.partition_owner.get(pid) != Some(cid) {
                    dangling.push((*cid, *pid));
                }
            }
        }
        dangling
    }

    /// Drop everything `stored` does not hold. Returns the removed
    /// collection ids and the removed `(collection_id, partition_id)` pairs
    /// of collections that stay.
    pub fn retain_stored(
        &mut self,
        stored: &Replica,
    ) -> (Vec<UniqueId>, Vec<(UniqueId, UniqueId)>) {
        let gone: Vec<UniqueId> = self
            .collections
            .keys()
            .copied()
            .filter(|id| !stored.has_collection(*id))
            .collect();
        for id in &gone {
            self.remove_collection(*id);
        }

        let stale: Vec<(UniqueId, UniqueId)> = self
            .partition_owner
            .iter()
            .filter(|(pid, cid)| !stored.has_partition(**cid, **pid))
            .map(|(pid, cid)| (*cid, *pid))
            .collect();
        for (cid, pid) in &stale {
            self.remove_partition(*cid, *pid);
        }

        (gone, stale)
    }

    pub fn view(&self) -> Vec<CollectionView> {
        self.collections
            .iter()
            .map(|(id, entry)| CollectionView {
                collection_id: *id,
                collection_name: entry.name.clone(),
                partitions: entry.partitions.iter().copied().collect(),
            })
            .collect()
    }
}
