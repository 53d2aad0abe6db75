mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{create_collection, create_partition, drop_collection, drop_partition, FlakyKv};
use ddnode_kernel::config::DdNodeConfig;
use ddnode_kernel::ingest::{run_ingest, IngestError};
use ddnode_kernel::kv::{MemoryKv, MetaKv};
use ddnode_kernel::msg::{FlushMsg, MsgBatch};
use ddnode_kernel::state::{flush_channel, DdNode, FlushAck, StateError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn config() -> DdNodeConfig {
    DdNodeConfig {
        retry_backoff_ms: 1,
        ..DdNodeConfig::default().with_buffer_size(4)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_channel_events_are_merged_into_the_batch_timeline() {
    let (flush_tx, flush_rx) = flush_channel(10);
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<FlushAck>();
    let mut node = DdNode::new(config(), Arc::new(MemoryKv::new()), flush_rx, ack_tx).unwrap();

    flush_tx
        .send(FlushMsg::new(1, 6, 1).with_segments(vec![1]))
        .await
        .unwrap();

    let (batch_tx, mut batch_rx) = mpsc::channel(4);
    batch_tx
        .send(MsgBatch::new(0, 4, vec![
            create_collection(0, 1),
            drop_collection(0, 2),
            create_partition(0, 100, 3),
            drop_partition(0, 100, 4),
        ]))
        .await
        .unwrap();
    batch_tx.send(MsgBatch::new(4, 6, vec![])).await.unwrap();
    drop(batch_tx);

    let summary = run_ingest(&mut node, &mut batch_rx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.batches, 2);
    assert_eq!(summary.stats.applied, 2);
    assert_eq!(summary.stats.flushes_acked, 1);
    assert_eq!(summary.last_end_ts, Some(6));

    let ack = ack_rx.try_recv().unwrap();
    assert_eq!(ack.timestamp, 6);
    assert_eq!(ack.records_drained, 2);
    assert_eq!(node.ddl_log().load().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn retryable_failure_is_retried_with_the_same_batch() {
    let kv = Arc::new(FlakyKv::failing("writer/collection/", 2));
    let mut node = DdNode::new(config(), kv, std::collections::VecDeque::new(), Vec::new()).unwrap();

    let (batch_tx, mut batch_rx) = mpsc::channel(1);
    batch_tx
        .send(MsgBatch::new(0, 1, vec![create_collection(7, 1)]))
        .await
        .unwrap();
    drop(batch_tx);

    let summary = run_ingest(&mut node, &mut batch_rx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.retries, 2);
    assert_eq!(summary.batches, 1);
    assert!(node.replica().has_collection(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_are_bounded() {
    let kv: Arc<dyn MetaKv> = Arc::new(FlakyKv::failing("writer/collection/", 100));
    let cfg = DdNodeConfig {
        max_batch_retries: 2,
        ..config()
    };
    let mut node = DdNode::new(cfg, kv, std::collections::VecDeque::new(), Vec::new()).unwrap();

    let (batch_tx, mut batch_rx) = mpsc::channel(1);
    batch_tx
        .send(MsgBatch::new(0, 1, vec![create_collection(7, 1)]))
        .await
        .unwrap();

    let err = run_ingest(&mut node, &mut batch_rx, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(node.last_end_ts(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn ordering_violation_halts_ingestion() {
    let mut node = DdNode::new(
        config(),
        Arc::new(MemoryKv::new()),
        std::collections::VecDeque::new(),
        Vec::new(),
    )
    .unwrap();

    let (batch_tx, mut batch_rx) = mpsc::channel(4);
    batch_tx.send(MsgBatch::new(0, 5, vec![])).await.unwrap();
    batch_tx.send(MsgBatch::new(2, 6, vec![])).await.unwrap();
    batch_tx.send(MsgBatch::new(6, 7, vec![])).await.unwrap();

    let err = run_ingest(&mut node, &mut batch_rx, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::Halted {
            begin_ts: 2,
            source: StateError::OrderingViolation { .. },
            ..
        }
    ));
    assert_eq!(node.last_end_ts(), Some(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_is_checked_between_batches() {
    let mut node = DdNode::new(
        config(),
        Arc::new(MemoryKv::new()),
        std::collections::VecDeque::new(),
        Vec::new(),
    )
    .unwrap();

    let (batch_tx, mut batch_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();

    batch_tx
        .send(MsgBatch::new(0, 1, vec![create_collection(1, 1)]))
        .await
        .unwrap();

    let driver = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let summary = run_ingest(&mut node, &mut batch_rx, &cancel).await;
            (summary, node)
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let (summary, node) = driver.await.unwrap();
    let summary = summary.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.batches, 1);
    assert!(node.replica().has_collection(1));
    drop(batch_tx);
}
