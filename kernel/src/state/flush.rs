// Flush Coordinator Channel
//
// Bounded hand-off of flush events from the external flush-decision process
// to the DD state machine, and the acknowledgement sent downstream once a
// flush boundary has been persisted.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::msg::{FlushMsg, Timestamp, UniqueId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("flush channel closed")]
pub struct FlushChannelClosed;

/// Producer half. Sending waits while the channel is full.
#[derive(Debug, Clone)]
pub struct FlushSender {
    tx: mpsc::Sender<FlushMsg>,
}

impl FlushSender {
    pub async fn send(&self, msg: FlushMsg) -> Result<(), FlushChannelClosed> {
        self.tx.send(msg).await.map_err(|_| FlushChannelClosed)
    }

    /// Blocking send for producers outside an async runtime.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_send(&self, msg: FlushMsg) -> Result<(), FlushChannelClosed> {
        self.tx.blocking_send(msg).map_err(|_| FlushChannelClosed)
    }

    /// Free slots left before producers start waiting.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half, owned by the state machine.
#[derive(Debug)]
pub struct FlushReceiver {
    rx: mpsc::Receiver<FlushMsg>,
}

/// Create a flush channel holding at most `capacity` events.
///
/// Panics if `capacity` is zero.
pub fn flush_channel(capacity: usize) -> (FlushSender, FlushReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (FlushSender { tx }, FlushReceiver { rx })
}

/// Source of flush events the state machine drains once per batch.
pub trait FlushSource: Send {
    /// Return every currently queued event in arrival order without waiting
    /// for new ones.
    fn drain_pending(&mut self) -> Vec<FlushMsg>;
}

impl FlushSource for FlushReceiver {
    fn drain_pending(&mut self) -> Vec<FlushMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

impl FlushSource for VecDeque<FlushMsg> {
    fn drain_pending(&mut self) -> Vec<FlushMsg> {
        self.drain(..).collect()
    }
}

/// Sent downstream once a flush boundary is durable: the named segments
/// are safe to compact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushAck {
    pub msg_id: UniqueId,
    pub timestamp: Timestamp,
    pub collection_id: UniqueId,
    pub segment_ids: Vec<UniqueId>,
    /// DDL records persisted by this flush.
    pub records_drained: usize,
}

/// Downstream consumer of flush acknowledgements.
pub trait CompactionNotifier: Send {
    fn flush_acked(&mut self, ack: FlushAck);
}

impl CompactionNotifier for Vec<FlushAck> {
    fn flush_acked(&mut self, ack: FlushAck) {
        self.push(ack);
    }
}

impl CompactionNotifier for mpsc::UnboundedSender<FlushAck> {
    fn flush_acked(&mut self, ack: FlushAck) {
        if let Err(err) = self.send(ack) {
            warn!(
                collection_id = err.0.collection_id,
                timestamp = err.0.timestamp,
                "compaction listener gone, dropping flush ack"
            );
        }
    }
}
