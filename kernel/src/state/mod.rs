// DD State Machine
//
// Single serialized consumer of the definitional stream and the flush
// channel. Each `operate` call applies one batch: DDL messages in stream
// order against the metadata table and the replica, then every flush event
// the batch watermark covers, then the resume checkpoint.
//
// A batch either completes or leaves the in-memory state exactly as it was
// before the call, so the driver can retry it as-is.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, DdNodeConfig};
use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::kv::{KvError, MetaKv};
use crate::log::{Checkpoint, DdlBuffer, DdlLog, DdlOp, DdlRecord, LogError};
use crate::meta::{CollectionMeta, MetaError, MetaTable, PartitionMeta, SegmentFlushMeta};
use crate::msg::{
    CreateCollectionMsg, DdMsg, DropCollectionMsg, FlushMsg, MsgBase, MsgBatch, PartitionMsg,
    Timestamp,
};
use crate::replica::Replica;

pub mod flush;

pub use flush::{
    flush_channel, CompactionNotifier, FlushAck, FlushChannelClosed, FlushReceiver, FlushSender,
    FlushSource,
};

/// Per-batch errors. Per-message problems never surface here; they are
/// logged and counted in [`OperateStats`].
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("ordering violation: batch [{begin}, {end}] after watermark {previous_end:?}")]
    OrderingViolation {
        previous_end: Option<Timestamp>,
        begin: Timestamp,
        end: Timestamp,
    },

    #[error("metadata store error: {0}")]
    Meta(#[from] MetaError),

    #[error("ddl log error: {0}")]
    Log(#[from] LogError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl StateError {
    /// Whether retrying the same batch can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateError::Meta(MetaError::Store(_)) | StateError::Log(LogError::Store(_))
        )
    }

    pub fn store_error(&self) -> Option<&KvError> {
        match self {
            StateError::Meta(MetaError::Store(e)) | StateError::Log(LogError::Store(e)) => Some(e),
            _ => None,
        }
    }
}

/// Counters for one `operate` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperateStats {
    pub applied: usize,
    /// Creates of live entities and drops of absent ones.
    pub idempotent_skips: usize,
    /// Messages at or before the last processed watermark.
    pub redelivered_skips: usize,
    pub malformed: usize,
    pub undecodable: usize,
    pub forced_drains: usize,
    pub records_drained: usize,
    pub flushes_acked: usize,
}

impl OperateStats {
    pub fn merge(&mut self, other: &OperateStats) {
        self.applied += other.applied;
        self.idempotent_skips += other.idempotent_skips;
        self.redelivered_skips += other.redelivered_skips;
        self.malformed += other.malformed;
        self.undecodable += other.undecodable;
        self.forced_drains += other.forced_drains;
        self.records_drained += other.records_drained;
        self.flushes_acked += other.flushes_acked;
    }
}

enum Outcome {
    Applied(DdlRecord),
    Skipped,
    Malformed,
}

/// State recovered from durable storage, used to resume a node.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    pub replica: Replica,
    /// Newest record timestamp already in the durable DDL log.
    pub high_ts: Option<Timestamp>,
    /// Watermark the driver redelivers batches after.
    pub resume_ts: Option<Timestamp>,
}

/// The data-definition replication state machine.
pub struct DdNode<F, N> {
    config: DdNodeConfig,
    meta: MetaTable,
    ddl_log: DdlLog,
    replica: Replica,
    buffer: DdlBuffer,
    flush_source: F,
    notifier: N,
    pending_flushes: VecDeque<FlushMsg>,
    invariants: InvariantEngine,
    last_end_ts: Option<Timestamp>,
    checkpoint_ts: Option<Timestamp>,
}

impl<F, N> std::fmt::Debug for DdNode<F, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdNode")
            .field("collections", &self.replica.collection_count())
            .field("partitions", &self.replica.partition_count())
            .field("buffered", &self.buffer.len())
            .field("pending_flushes", &self.pending_flushes.len())
            .field("last_end_ts", &self.last_end_ts)
            .finish_non_exhaustive()
    }
}

impl<F: FlushSource, N: CompactionNotifier> DdNode<F, N> {
    /// Create a node with an empty replica.
    pub fn new(
        config: DdNodeConfig,
        kv: Arc<dyn MetaKv>,
        flush_source: F,
        notifier: N,
    ) -> Result<Self, ConfigError> {
        Self::resume(config, kv, ResumeState::default(), flush_source, notifier)
    }

    /// Create a node continuing from recovered state.
    pub fn resume(
        config: DdNodeConfig,
        kv: Arc<dyn MetaKv>,
        state: ResumeState,
        flush_source: F,
        notifier: N,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let invariants = if config.check_invariants {
            InvariantEngine::with_defaults()
        } else {
            InvariantEngine::new()
        };

        Ok(Self {
            meta: MetaTable::new(Arc::clone(&kv)),
            ddl_log: DdlLog::new(kv),
            replica: state.replica,
            buffer: DdlBuffer::starting_at(state.high_ts),
            flush_source,
            notifier,
            pending_flushes: VecDeque::new(),
            invariants,
            last_end_ts: state.resume_ts,
            checkpoint_ts: state.resume_ts,
            config,
        })
    }

    /// Apply one batch.
    ///
    /// On `Err` the replica, the buffer and the pending flush events are
    /// unchanged and the watermark has not advanced.
    pub fn operate(&mut self, batch: &MsgBatch) -> Result<OperateStats, StateError> {
        let regressed = self.last_end_ts.map_or(false, |prev| batch.begin_ts < prev);
        if batch.begin_ts > batch.end_ts || regressed {
            error!(
                previous_end = ?self.last_end_ts,
                begin_ts = batch.begin_ts,
                end_ts = batch.end_ts,
                "out-of-order batch watermark"
            );
            return Err(StateError::OrderingViolation {
                previous_end: self.last_end_ts,
                begin: batch.begin_ts,
                end: batch.end_ts,
            });
        }

        self.pending_flushes.extend(self.flush_source.drain_pending());

        let replica = self.replica.clone();
        let buffer = self.buffer.clone();
        let pending = self.pending_flushes.clone();

        let mut stats = OperateStats {
            undecodable: batch.undecodable,
            ..OperateStats::default()
        };

        match self.apply_batch(batch, &mut stats) {
            Ok((acks, checkpoint_ts)) => {
                self.last_end_ts = Some(batch.end_ts);
                self.checkpoint_ts = checkpoint_ts;
                stats.flushes_acked = acks.len();
                for ack in acks {
                    debug!(
                        collection_id = ack.collection_id,
                        ts = ack.timestamp,
                        segments = ?ack.segment_ids,
                        "flush acknowledged"
                    );
                    self.notifier.flush_acked(ack);
                }
                debug!(
                    begin_ts = batch.begin_ts,
                    end_ts = batch.end_ts,
                    ?stats,
                    "batch applied"
                );
                Ok(stats)
            }
            Err(err) => {
                error!(
                    begin_ts = batch.begin_ts,
                    end_ts = batch.end_ts,
                    error = %err,
                    "batch failed, rolling back"
                );
                self.replica = replica;
                self.buffer = buffer;
                self.pending_flushes = pending;
                Err(err)
            }
        }
    }

    fn apply_batch(
        &mut self,
        batch: &MsgBatch,
        stats: &mut OperateStats,
    ) -> Result<(Vec<FlushAck>, Option<Timestamp>), StateError> {
        for msg in &batch.msgs {
            let ts = msg.timestamp();
            if self.last_end_ts.map_or(false, |prev| ts <= prev) {
                debug!(kind = msg.kind(), ts, "skipping redelivered message");
                stats.redelivered_skips += 1;
                continue;
            }

            if let DdMsg::Flush(flush) = msg {
                self.pending_flushes.push_back(flush.clone());
                continue;
            }

            if ts < batch.begin_ts || ts > batch.end_ts {
                warn!(
                    kind = msg.kind(),
                    ts,
                    begin_ts = batch.begin_ts,
                    end_ts = batch.end_ts,
                    "message outside its batch watermark, skipping"
                );
                stats.malformed += 1;
                continue;
            }

            if !self.buffer.accepts(ts) {
                warn!(
                    kind = msg.kind(),
                    ts,
                    high_ts = ?self.buffer.high_ts(),
                    "message older than recorded history, skipping"
                );
                stats.malformed += 1;
                continue;
            }

            let previous = (!self.invariants.is_empty()).then(|| self.replica.clone());

            let outcome = match msg {
                DdMsg::CreateCollection(m) => self.create_collection(m)?,
                DdMsg::DropCollection(m) => self.drop_collection(m)?,
                DdMsg::CreatePartition(m) => self.create_partition(m)?,
                DdMsg::DropPartition(m) => self.drop_partition(m)?,
                DdMsg::Flush(_) => continue,
            };

            match outcome {
                Outcome::Applied(record) => {
                    if let Some(previous) = &previous {
                        self.invariants.evaluate(previous, &record, &self.replica)?;
                    }
                    self.buffer.append(record)?;
                    stats.applied += 1;

                    if self.buffer.len() >= self.config.flush_dd_buffer_size {
                        stats.records_drained += self.drain_all()?;
                        stats.forced_drains += 1;
                    }
                }
                Outcome::Skipped => stats.idempotent_skips += 1,
                Outcome::Malformed => stats.malformed += 1,
            }
        }

        let acks = self.process_flushes(batch.end_ts, stats)?;
        let checkpoint_ts = self.save_checkpoint(batch.end_ts)?;
        Ok((acks, checkpoint_ts))
    }

    fn create_collection(&mut self, m: &CreateCollectionMsg) -> Result<Outcome, StateError> {
        if self.replica.has_collection(m.collection_id) {
            debug!(collection_id = m.collection_id, "collection already live, skipping create");
            return Ok(Outcome::Skipped);
        }

        self.meta.add_collection(&CollectionMeta {
            collection_id: m.collection_id,
            collection_name: m.collection_name.clone(),
            schema: m.schema.clone(),
            create_ts: m.base.timestamp,
        })?;
        self.replica.add_collection(m.collection_id, &m.collection_name);

        Ok(Outcome::Applied(record(
            &m.base,
            DdlOp::CreateCollection {
                collection_id: m.collection_id,
                collection_name: m.collection_name.clone(),
                schema: m.schema.clone(),
            },
        )))
    }

    fn drop_collection(&mut self, m: &DropCollectionMsg) -> Result<Outcome, StateError> {
        if !self.replica.has_collection(m.collection_id) {
            debug!(collection_id = m.collection_id, "collection not live, skipping drop");
            return Ok(Outcome::Skipped);
        }

        self.meta.remove_collection(m.collection_id)?;
        self.replica.remove_collection(m.collection_id);

        Ok(Outcome::Applied(record(
            &m.base,
            DdlOp::DropCollection {
                collection_id: m.collection_id,
                collection_name: m.collection_name.clone(),
            },
        )))
    }

    fn create_partition(&mut self, m: &PartitionMsg) -> Result<Outcome, StateError> {
        if !self.replica.has_collection(m.collection_id) {
            warn!(
                collection_id = m.collection_id,
                partition_id = m.partition_id,
                "create partition on missing collection, skipping"
            );
            return Ok(Outcome::Malformed);
        }
        if m.partition_name == self.config.default_partition_name {
            warn!(
                collection_id = m.collection_id,
                partition_id = m.partition_id,
                "default partition is implicit, skipping create"
            );
            return Ok(Outcome::Malformed);
        }

        match self.replica.partition_owner(m.partition_id) {
            Some(owner) if owner == m.collection_id => {
                debug!(
                    collection_id = m.collection_id,
                    partition_id = m.partition_id,
                    "partition already live, skipping create"
                );
                return Ok(Outcome::Skipped);
            }
            Some(owner) => {
                warn!(
                    collection_id = m.collection_id,
                    partition_id = m.partition_id,
                    owner,
                    "partition id owned by another collection, skipping"
                );
                return Ok(Outcome::Malformed);
            }
            None => {}
        }

        self.meta.add_partition(&PartitionMeta {
            collection_id: m.collection_id,
            partition_id: m.partition_id,
            partition_name: m.partition_name.clone(),
            create_ts: m.base.timestamp,
        })?;
        if let Err(err) = self.replica.add_partition(m.collection_id, m.partition_id) {
            // checked above; only reachable if the replica was corrupted
            warn!(error = %err, "replica rejected partition");
            return Ok(Outcome::Malformed);
        }

        Ok(Outcome::Applied(record(
            &m.base,
            DdlOp::CreatePartition {
                collection_id: m.collection_id,
                partition_id: m.partition_id,
                collection_name: m.collection_name.clone(),
                partition_name: m.partition_name.clone(),
            },
        )))
    }

    fn drop_partition(&mut self, m: &PartitionMsg) -> Result<Outcome, StateError> {
        if m.partition_name == self.config.default_partition_name {
            warn!(
                collection_id = m.collection_id,
                partition_id = m.partition_id,
                "default partition cannot be dropped, skipping"
            );
            return Ok(Outcome::Malformed);
        }
        if !self.replica.has_partition(m.collection_id, m.partition_id) {
            debug!(
                collection_id = m.collection_id,
                partition_id = m.partition_id,
                "partition not live, skipping drop"
            );
            return Ok(Outcome::Skipped);
        }

        self.meta.remove_partition(m.collection_id, m.partition_id)?;
        self.replica.remove_partition(m.collection_id, m.partition_id);

        Ok(Outcome::Applied(record(
            &m.base,
            DdlOp::DropPartition {
                collection_id: m.collection_id,
                partition_id: m.partition_id,
                collection_name: m.collection_name.clone(),
                partition_name: m.partition_name.clone(),
            },
        )))
    }

    fn drain_all(&mut self) -> Result<usize, StateError> {
        let records = self.buffer.drain_all();
        self.ddl_log.append(&records)?;
        info!(
            records = records.len(),
            threshold = self.config.flush_dd_buffer_size,
            "ddl buffer reached threshold, drained"
        );
        Ok(records.len())
    }

    /// Handle pending flush events in arrival order until the first one
    /// past `end_ts`; it and everything queued behind it stay pending.
    fn process_flushes(
        &mut self,
        end_ts: Timestamp,
        stats: &mut OperateStats,
    ) -> Result<Vec<FlushAck>, StateError> {
        let mut acks = Vec::new();

        while let Some(flush) = self.pending_flushes.pop_front() {
            if flush.timestamp() > end_ts {
                self.pending_flushes.push_front(flush);
                break;
            }

            let records = self.buffer.drain_through(flush.timestamp());
            self.ddl_log.append(&records)?;
            stats.records_drained += records.len();

            for &segment_id in &flush.segment_ids {
                self.meta.record_segment_flush(&SegmentFlushMeta {
                    segment_id,
                    collection_id: flush.collection_id,
                    flush_ts: flush.timestamp(),
                    flush_msg_id: flush.base.msg_id,
                })?;
            }

            info!(
                collection_id = flush.collection_id,
                ts = flush.timestamp(),
                drained = records.len(),
                "flush boundary persisted"
            );
            acks.push(FlushAck {
                msg_id: flush.base.msg_id,
                timestamp: flush.timestamp(),
                collection_id: flush.collection_id,
                segment_ids: flush.segment_ids,
                records_drained: records.len(),
            });
        }

        Ok(acks)
    }

    /// Persist the resume watermark: the batch end when nothing is
    /// buffered, otherwise just before the oldest buffered record. Never
    /// moves backward.
    fn save_checkpoint(&self, end_ts: Timestamp) -> Result<Option<Timestamp>, StateError> {
        let candidate = match self.buffer.oldest_ts() {
            None => Some(end_ts),
            Some(oldest) => oldest.checked_sub(1),
        };

        let resume_ts = match (self.checkpoint_ts, candidate) {
            (Some(prev), Some(next)) => Some(prev.max(next)),
            (prev, next) => prev.or(next),
        };

        if resume_ts != self.checkpoint_ts {
            if let Some(resume_ts) = resume_ts {
                self.ddl_log.save_checkpoint(Checkpoint { resume_ts })?;
            }
        }
        Ok(resume_ts)
    }

    /// Drain the whole buffer now, regardless of threshold or flush events.
    pub fn force_drain(&mut self) -> Result<usize, StateError> {
        let before = self.buffer.clone();
        let records = self.buffer.drain_all();
        if let Err(err) = self.ddl_log.append(&records) {
            self.buffer = before;
            return Err(err.into());
        }
        info!(records = records.len(), "ddl buffer drained on request");

        if let Some(end) = self.last_end_ts {
            let resume_ts = self.checkpoint_ts.map_or(end, |prev| prev.max(end));
            self.ddl_log.save_checkpoint(Checkpoint { resume_ts })?;
            self.checkpoint_ts = Some(resume_ts);
        }
        Ok(records.len())
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn buffer(&self) -> &DdlBuffer {
        &self.buffer
    }

    pub fn meta(&self) -> &MetaTable {
        &self.meta
    }

    pub fn ddl_log(&self) -> &DdlLog {
        &self.ddl_log
    }

    pub fn config(&self) -> &DdNodeConfig {
        &self.config
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn flush_source_mut(&mut self) -> &mut F {
        &mut self.flush_source
    }

    pub fn pending_flushes(&self) -> usize {
        self.pending_flushes.len()
    }

    /// End watermark of the last successfully applied batch.
    pub fn last_end_ts(&self) -> Option<Timestamp> {
        self.last_end_ts
    }

    pub fn checkpoint_ts(&self) -> Option<Timestamp> {
        self.checkpoint_ts
    }
}

fn record(base: &MsgBase, op: DdlOp) -> DdlRecord {
    DdlRecord {
        op,
        timestamp: base.timestamp,
        msg_id: base.msg_id,
        source_id: base.source_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::msg::UniqueId;

    type TestNode = DdNode<VecDeque<FlushMsg>, Vec<FlushAck>>;

    fn base(ts: Timestamp) -> MsgBase {
        MsgBase {
            msg_id: ts as UniqueId,
            timestamp: ts,
            source_id: ts as UniqueId,
        }
    }

    fn create_collection(id: UniqueId, ts: Timestamp) -> DdMsg {
        DdMsg::CreateCollection(CreateCollectionMsg {
            base: base(ts),
            collection_id: id,
            collection_name: format!("col-test-{id}"),
            schema: vec![],
        })
    }

    fn drop_collection(id: UniqueId, ts: Timestamp) -> DdMsg {
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

    fn node(threshold: usize) -> TestNode {
        let config = DdNodeConfig::default().with_buffer_size(threshold);
        DdNode::new(config, Arc::new(MemoryKv::new()), VecDeque::new(), Vec::new()).unwrap()
    }

    #[test]
    fn create_then_drop_in_one_batch() {
        let mut node = node(4);
        let batch = MsgBatch::new(1, 2, vec![create_collection(0, 1), drop_collection(0, 2)]);

        let stats = node.operate(&batch).unwrap();

        assert_eq!(stats.applied, 2);
        assert_eq!(node.replica().collection_count(), 0);
        assert_eq!(node.buffer().len(), 2);
        assert!(!node.meta().has_collection(0).unwrap());
    }

    #[test]
    fn partition_before_collection_is_skipped() {
        let mut node = node(4);
        let batch = MsgBatch::new(0, 1, vec![DdMsg::CreatePartition(partition(0, 100, 1))]);

        let stats = node.operate(&batch).unwrap();

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.applied, 0);
        assert_eq!(node.replica().partition_count(), 0);
        assert!(node.buffer().is_empty());
        assert!(node.meta().partitions().unwrap().is_empty());
    }

    #[test]
    fn threshold_forces_one_drain() {
        let mut node = node(4);
        let msgs = (1..=5).map(|ts| create_collection(ts as UniqueId, ts)).collect();

        let stats = node.operate(&MsgBatch::new(0, 5, msgs)).unwrap();

        assert_eq!(stats.forced_drains, 1);
        assert_eq!(stats.records_drained, 4);
        assert_eq!(node.buffer().len(), 1);
        assert_eq!(node.ddl_log().load().unwrap().len(), 4);
        // oldest buffered record is at 5
        assert_eq!(node.checkpoint_ts(), Some(4));
    }

    #[test]
    fn flush_without_ddl_activity_still_acks() {
        let mut node = node(4);
        node.flush_source_mut()
            .push_back(FlushMsg::new(1, 6, 1).with_segments(vec![1]));

        let stats = node.operate(&MsgBatch::new(0, 6, vec![])).unwrap();

        assert_eq!(stats.flushes_acked, 1);
        assert_eq!(stats.records_drained, 0);
        let acks = node.notifier();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].collection_id, 1);
        assert_eq!(acks[0].segment_ids, vec![1]);
        assert_eq!(node.meta().segment_flushes().unwrap().len(), 1);
    }

    #[test]
    fn future_flush_waits_for_covering_batch() {
        let mut node = node(4);
        node.flush_source_mut()
            .push_back(FlushMsg::new(1, 6, 1).with_segments(vec![1]));

        let first = MsgBatch::new(
            0,
            3,
            vec![
                create_collection(0, 1),
                drop_collection(0, 2),
                DdMsg::CreatePartition(partition(0, 100, 3)),
                DdMsg::DropPartition(partition(0, 100, 4)),
            ],
        );
        let stats = node.operate(&first).unwrap();
        assert_eq!(stats.applied, 2);
        // partition on a dropped collection, then a message past `end_ts`
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.idempotent_skips, 0);
        assert_eq!(stats.flushes_acked, 0);
        assert_eq!(node.pending_flushes(), 1);

        let stats = node.operate(&MsgBatch::new(3, 6, vec![])).unwrap();
        assert_eq!(stats.flushes_acked, 1);
        assert_eq!(stats.records_drained, 2);
        assert!(node.buffer().is_empty());
        assert_eq!(node.checkpoint_ts(), Some(6));
    }

    #[test]
    fn flush_drains_only_records_at_or_before_its_timestamp() {
        let mut node = node(16);
        let batch = MsgBatch::new(
            0,
            5,
            vec![
                create_collection(1, 1),
                create_collection(2, 2),
                DdMsg::Flush(FlushMsg::new(9, 2, 1).with_segments(vec![11, 12])),
                create_collection(3, 4),
            ],
        );

        let stats = node.operate(&batch).unwrap();

        assert_eq!(stats.flushes_acked, 1);
        assert_eq!(node.notifier()[0].records_drained, 2);
        let persisted: Vec<_> = node
            .ddl_log()
            .load()
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(persisted, vec![1, 2]);
        assert_eq!(node.buffer().oldest_ts(), Some(4));
        assert_eq!(node.meta().segment_flushes().unwrap().len(), 2);
    }

    #[test]
    fn regressing_watermark_is_fatal() {
        let mut node = node(4);
        node.operate(&MsgBatch::new(0, 5, vec![])).unwrap();

        let err = node.operate(&MsgBatch::new(3, 7, vec![])).unwrap_err();
        assert!(matches!(err, StateError::OrderingViolation { .. }));
        assert!(!err.is_retryable());

        let err = node.operate(&MsgBatch::new(9, 8, vec![])).unwrap_err();
        assert!(matches!(err, StateError::OrderingViolation { .. }));
        assert_eq!(node.last_end_ts(), Some(5));
    }

    #[test]
    fn redelivered_messages_are_skipped() {
        let mut node = node(4);
        node.operate(&MsgBatch::new(0, 2, vec![create_collection(1, 1), drop_collection(1, 2)]))
            .unwrap();

        let stats = node
            .operate(&MsgBatch::new(2, 3, vec![create_collection(1, 1), drop_collection(1, 2)]))
            .unwrap();
        assert_eq!(stats.redelivered_skips, 2);
        assert_eq!(stats.applied, 0);
        assert_eq!(node.replica().collection_count(), 0);
    }

    #[test]
    fn default_partition_cannot_be_dropped() {
        let mut node = node(4);
        let mut default = partition(1, 10, 2);
        default.partition_name = "_default".into();

        let stats = node
            .operate(&MsgBatch::new(
                0,
                2,
                vec![create_collection(1, 1), DdMsg::DropPartition(default)],
            ))
            .unwrap();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.applied, 1);
    }

    #[test]
    fn older_message_than_history_is_malformed() {
        let mut node = node(4);
        let stats = node
            .operate(&MsgBatch::new(0, 5, vec![create_collection(1, 5), create_collection(2, 3)]))
            .unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.malformed, 1);
        assert!(!node.replica().has_collection(2));
    }

    #[test]
    fn message_outside_watermark_does_not_block_later_batches() {
        let mut node = node(4);
        let stats = node
            .operate(&MsgBatch::new(0, 3, vec![create_collection(1, 10)]))
            .unwrap();
        assert_eq!(stats.malformed, 1);
        assert!(!node.replica().has_collection(1));
        assert!(node.meta().collections().unwrap().is_empty());
        assert!(node.buffer().is_empty());

        let stats = node
            .operate(&MsgBatch::new(3, 6, vec![create_collection(2, 5)]))
            .unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.malformed, 0);
        assert!(node.replica().has_collection(2));
    }

    #[test]
    fn message_before_first_batch_begin_is_malformed() {
        let mut node = node(4);
        let stats = node
            .operate(&MsgBatch::new(4, 6, vec![create_collection(1, 2), create_collection(2, 5)]))
            .unwrap();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.applied, 1);
        assert!(!node.replica().has_collection(1));
    }

    #[test]
    fn flush_acks_keep_channel_order() {
        let mut node = node(4);
        node.flush_source_mut().push_back(FlushMsg::new(1, 10, 1));
        node.flush_source_mut().push_back(FlushMsg::new(2, 2, 1));

        let stats = node.operate(&MsgBatch::new(0, 5, vec![])).unwrap();
        assert_eq!(stats.flushes_acked, 0);
        assert_eq!(node.pending_flushes(), 2);

        let stats = node.operate(&MsgBatch::new(5, 10, vec![])).unwrap();
        assert_eq!(stats.flushes_acked, 2);
        let order: Vec<_> = node.notifier().iter().map(|a| a.msg_id).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(node.pending_flushes(), 0);
    }

    #[test]
    fn force_drain_advances_checkpoint() {
        let mut node = node(16);
        node.operate(&MsgBatch::new(0, 3, vec![create_collection(1, 2)]))
            .unwrap();
        assert_eq!(node.checkpoint_ts(), Some(1));

        assert_eq!(node.force_drain().unwrap(), 1);
        assert_eq!(node.checkpoint_ts(), Some(3));
        assert_eq!(
            node.ddl_log().checkpoint().unwrap(),
            Some(Checkpoint { resume_ts: 3 })
        );
    }
}
