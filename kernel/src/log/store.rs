// Durable DDL Log
//
// Drained DDL records live under `writer/ddl/{ts}/{msg_id}`. Both parts are
// zero-padded so a prefix load returns records in timestamp order, which is
// the order recovery replays them in.
//
// The resume checkpoint lives next to them at `writer/checkpoint`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{DdlRecord, LogError};
use crate::kv::MetaKv;
use crate::msg::Timestamp;

pub const DDL_PREFIX: &str = "writer/ddl/";
pub const CHECKPOINT_KEY: &str = "writer/checkpoint";

/// Position the driver must redeliver batches after, on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub resume_ts: Timestamp,
}

/// Durable side of the DDL record trail.
#[derive(Clone)]
pub struct DdlLog {
    kv: Arc<dyn MetaKv>,
}

impl std::fmt::Debug for DdlLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdlLog").finish_non_exhaustive()
    }
}

impl DdlLog {
    pub fn new(kv: Arc<dyn MetaKv>) -> Self {
        Self { kv }
    }

    pub fn record_key(record: &DdlRecord) -> String {
        format!("{DDL_PREFIX}{:020}/{:020}", record.timestamp, record.msg_id)
    }

    /// Persist drained records. Keys are deterministic, so writing the same
    /// record twice is harmless.
    pub fn append(&self, records: &[DdlRecord]) -> Result<(), LogError> {
        if records.is_empty() {
            return Ok(());
        }

        let entries = records
            .iter()
            .map(|r| {
                serde_json::to_string(r)
                    .map(|v| (Self::record_key(r), v))
                    .map_err(LogError::Encode)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.kv.multi_put(&entries)?;
        Ok(())
    }

    /// Load every persisted record in timestamp order.
    pub fn load(&self) -> Result<Vec<DdlRecord>, LogError> {
        self.kv
            .load_with_prefix(DDL_PREFIX)?
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_str(&value).map_err(|source| LogError::Corrupt { key, source })
            })
            .collect()
    }

    pub fn checkpoint(&self) -> Result<Option<Checkpoint>, LogError> {
        match self.kv.get(CHECKPOINT_KEY)? {
            Some(value) => serde_json::from_str(&value)
                .map(Some)
                .map_err(|source| LogError::Corrupt {
                    key: CHECKPOINT_KEY.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), LogError> {
        let value = serde_json::to_string(&checkpoint).map_err(LogError::Encode)?;
        self.kv.put(CHECKPOINT_KEY, &value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::log::DdlOp;

    fn record(timestamp: Timestamp, msg_id: i64) -> DdlRecord {
        DdlRecord {
            op: DdlOp::CreateCollection {
                collection_id: msg_id,
                collection_name: String::new(),
                schema: vec![],
            },
            timestamp,
            msg_id,
            source_id: 0,
        }
    }

    #[test]
    fn load_returns_timestamp_order() {
        let log = DdlLog::new(Arc::new(MemoryKv::new()));
        log.append(&[record(10, 2)]).unwrap();
        log.append(&[record(9, 7), record(10, 1)]).unwrap();

        let loaded: Vec<_> = log
            .load()
            .unwrap()
            .into_iter()
            .map(|r| (r.timestamp, r.msg_id))
            .collect();
        assert_eq!(loaded, vec![(9, 7), (10, 1), (10, 2)]);
    }

    #[test]
    fn rewriting_a_record_does_not_duplicate_it() {
        let log = DdlLog::new(Arc::new(MemoryKv::new()));
        log.append(&[record(1, 1)]).unwrap();
        log.append(&[record(1, 1)]).unwrap();
        assert_eq!(log.load().unwrap().len(), 1);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let log = DdlLog::new(Arc::new(MemoryKv::new()));
        assert_eq!(log.checkpoint().unwrap(), None);

        log.save_checkpoint(Checkpoint { resume_ts: 42 }).unwrap();
        assert_eq!(log.checkpoint().unwrap(), Some(Checkpoint { resume_ts: 42 }));
    }

    #[test]
    fn corrupt_record_is_reported_with_its_key() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("writer/ddl/00000000000000000001/00000000000000000001", "not json")
            .unwrap();

        let err = DdlLog::new(kv).load().unwrap_err();
        assert!(err.to_string().contains("writer/ddl/00000000000000000001"));
    }
}
