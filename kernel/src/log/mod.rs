// DDL Record Log
//
// Immutable records of applied definitional events, buffered in memory in
// timestamp order until drained to the durable DDL log.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::kv::KvError;
use crate::msg::{Timestamp, UniqueId};

pub mod store;

pub use store::{Checkpoint, DdlLog};

/// The definitional change a record captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum DdlOp {
    CreateCollection {
        collection_id: UniqueId,
        collection_name: String,
        schema: Vec<u8>,
    },
    DropCollection {
        collection_id: UniqueId,
        collection_name: String,
    },
    CreatePartition {
        collection_id: UniqueId,
        partition_id: UniqueId,
        collection_name: String,
        partition_name: String,
    },
    DropPartition {
        collection_id: UniqueId,
        partition_id: UniqueId,
        collection_name: String,
        partition_name: String,
    },
}

/// One applied definitional event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlRecord {
    pub op: DdlOp,
    pub timestamp: Timestamp,
    pub msg_id: UniqueId,
    pub source_id: UniqueId,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("record out of order: last timestamp {last}, got {actual}")]
    OutOfOrder { last: Timestamp, actual: Timestamp },

    #[error("store error: {0}")]
    Store(#[from] KvError),

    #[error("corrupt record at `{key}`: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// In-memory buffer of DDL records awaiting a drain.
///
/// Records are non-decreasing in timestamp, including across drains:
/// once a record at `t` has been accepted nothing older may follow.
#[derive(Debug, Clone, Default)]
pub struct DdlBuffer {
    records: VecDeque<DdlRecord>,
    high_ts: Option<Timestamp>,
}

impl DdlBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a buffer whose history already reaches `high_ts`.
    pub fn starting_at(high_ts: Option<Timestamp>) -> Self {
        Self {
            records: VecDeque::new(),
            high_ts,
        }
    }

    /// Whether a record at `timestamp` could be appended.
    pub fn accepts(&self, timestamp: Timestamp) -> bool {
        self.high_ts.map_or(true, |high| timestamp >= high)
    }

    pub fn append(&mut self, record: DdlRecord) -> Result<(), LogError> {
        if let Some(last) = self.high_ts {
            if record.timestamp < last {
                return Err(LogError::OutOfOrder {
                    last,
                    actual: record.timestamp,
                });
            }
        }

        self.high_ts = Some(record.timestamp);
        self.records.push_back(record);
        Ok(())
    }

    /// Remove and return every record with timestamp `<= ts`.
    pub fn drain_through(&mut self, ts: Timestamp) -> Vec<DdlRecord> {
        let n = self
            .records
            .iter()
            .take_while(|r| r.timestamp <= ts)
            .count();
        self.records.drain(..n).collect()
    }

    pub fn drain_all(&mut self) -> Vec<DdlRecord> {
        self.records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn oldest_ts(&self) -> Option<Timestamp> {
        self.records.front().map(|r| r.timestamp)
    }

    /// Newest timestamp ever accepted, drained or not.
    pub fn high_ts(&self) -> Option<Timestamp> {
        self.high_ts
    }
}
