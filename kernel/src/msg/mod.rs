// Definitional Messages
//
// The ordered stream consumed by the DD state machine: a closed set of
// message kinds, each wrapped in a common envelope, delivered in batches
// bounded by a [begin, end] timestamp watermark.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Cluster-wide identifier for collections, partitions, segments and messages.
pub type UniqueId = i64;

/// Logical timestamp. Ordering token only, not wall-clock time.
pub type Timestamp = u64;

/// Envelope shared by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgBase {
    pub msg_id: UniqueId,
    pub timestamp: Timestamp,
    pub source_id: UniqueId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCollectionMsg {
    pub base: MsgBase,
    pub collection_id: UniqueId,
    #[serde(default)]
    pub collection_name: String,
    /// Serialized schema; opaque to this node.
    #[serde(default)]
    pub schema: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCollectionMsg {
    pub base: MsgBase,
    pub collection_id: UniqueId,
    #[serde(default)]
    pub collection_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMsg {
    pub base: MsgBase,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    #[serde(default)]
    pub collection_name: String,
    #[serde(default)]
    pub partition_name: String,
}

/// Watermark telling the node that no further writes at or before
/// `base.timestamp` will target `segment_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushMsg {
    pub base: MsgBase,
    pub collection_id: UniqueId,
    #[serde(default)]
    pub segment_ids: Vec<UniqueId>,
}

impl FlushMsg {
    pub fn new(msg_id: UniqueId, timestamp: Timestamp, collection_id: UniqueId) -> Self {
        Self {
            base: MsgBase {
                msg_id,
                timestamp,
                source_id: 0,
            },
            collection_id,
            segment_ids: Vec::new(),
        }
    }

    pub fn with_segments(mut self, segment_ids: Vec<UniqueId>) -> Self {
        self.segment_ids = segment_ids;
        self
    }

    pub fn timestamp(&self) -> Timestamp {
        self.base.timestamp
    }
}

/// A single message of the definitional stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum DdMsg {
    CreateCollection(CreateCollectionMsg),
    DropCollection(DropCollectionMsg),
    CreatePartition(PartitionMsg),
    DropPartition(PartitionMsg),
    Flush(FlushMsg),
}

impl DdMsg {
    pub fn base(&self) -> &MsgBase {
        match self {
            DdMsg::CreateCollection(m) => &m.base,
            DdMsg::DropCollection(m) => &m.base,
            DdMsg::CreatePartition(m) | DdMsg::DropPartition(m) => &m.base,
            DdMsg::Flush(m) => &m.base,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.base().timestamp
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DdMsg::CreateCollection(_) => "CreateCollection",
            DdMsg::DropCollection(_) => "DropCollection",
            DdMsg::CreatePartition(_) => "CreatePartition",
            DdMsg::DropPartition(_) => "DropPartition",
            DdMsg::Flush(_) => "Flush",
        }
    }
}

/// An ordered run of messages covering `[begin_ts, end_ts]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgBatch {
    pub begin_ts: Timestamp,
    pub end_ts: Timestamp,
    pub msgs: Vec<DdMsg>,
    /// Entries dropped while decoding this batch.
    #[serde(default)]
    pub undecodable: usize,
}

impl MsgBatch {
    pub fn new(begin_ts: Timestamp, end_ts: Timestamp, msgs: Vec<DdMsg>) -> Self {
        Self {
            begin_ts,
            end_ts,
            msgs,
            undecodable: 0,
        }
    }
}

/// Errors raised while decoding messages off the wire.
#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("undecodable message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Decode a single message from its JSON representation.
pub fn decode_msg(value: serde_json::Value) -> Result<DdMsg, MsgError> {
    Ok(serde_json::from_value(value)?)
}

/// Batch as read off the wire, before its messages are decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBatch {
    pub begin_ts: Timestamp,
    pub end_ts: Timestamp,
    #[serde(default)]
    pub msgs: Vec<serde_json::Value>,
}

impl RawBatch {
    /// Decode every message. Unknown or malformed entries are logged and
    /// dropped; they never fail the batch.
    pub fn decode(self) -> MsgBatch {
        let mut batch = MsgBatch::new(self.begin_ts, self.end_ts, Vec::with_capacity(self.msgs.len()));
        for (idx, raw) in self.msgs.into_iter().enumerate() {
            match decode_msg(raw) {
                Ok(msg) => batch.msgs.push(msg),
                Err(err) => {
                    warn!(
                        begin_ts = batch.begin_ts,
                        end_ts = batch.end_ts,
                        index = idx,
                        error = %err,
                        "skipping undecodable message"
                    );
                    batch.undecodable += 1;
                }
            }
        }
        batch
    }
}
