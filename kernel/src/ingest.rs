// Ingestion Driving Loop
//
// Feeds batches to the DD state machine one at a time:
// receive → operate → retry or halt
//
// Cancellation is checked between batches and while waiting to retry,
// never in the middle of an `operate` call.
//
// `operate` does blocking store I/O and runs under `block_in_place`, so the
// loop needs a multi-threaded tokio runtime.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::msg::{MsgBatch, Timestamp};
use crate::state::{CompactionNotifier, DdNode, FlushSource, OperateStats, StateError};

/// Result of a completed ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub batches: usize,
    pub retries: usize,
    pub stats: OperateStats,
    pub last_end_ts: Option<Timestamp>,
    pub cancelled: bool,
}

/// Errors that stop ingestion.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("ingestion halted at batch [{begin_ts}, {end_ts}]: {source}")]
    Halted {
        begin_ts: Timestamp,
        end_ts: Timestamp,
        #[source]
        source: StateError,
    },

    #[error("batch [{begin_ts}, {end_ts}] still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        begin_ts: Timestamp,
        end_ts: Timestamp,
        attempts: u32,
        #[source]
        source: StateError,
    },
}

/// Drive `node` until the batch channel closes or `cancel` fires.
///
/// Must be called from a multi-threaded runtime.
pub async fn run_ingest<F: FlushSource, N: CompactionNotifier>(
    node: &mut DdNode<F, N>,
    batches: &mut mpsc::Receiver<MsgBatch>,
    cancel: &CancellationToken,
) -> Result<IngestSummary, IngestError> {
    let max_retries = node.config().max_batch_retries;
    let backoff = Duration::from_millis(node.config().retry_backoff_ms);
    let mut summary = IngestSummary {
        last_end_ts: node.last_end_ts(),
        ..IngestSummary::default()
    };

    'batches: loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.cancelled = true;
                break;
            }
            next = batches.recv() => match next {
                Some(batch) => batch,
                None => break,
            },
        };

        let mut attempt = 0;
        loop {
            match tokio::task::block_in_place(|| node.operate(&batch)) {
                Ok(stats) => {
                    summary.stats.merge(&stats);
                    summary.batches += 1;
                    summary.last_end_ts = node.last_end_ts();
                    break;
                }
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    summary.retries += 1;
                    warn!(
                        begin_ts = batch.begin_ts,
                        end_ts = batch.end_ts,
                        attempt,
                        error = %err,
                        "retrying batch"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            summary.cancelled = true;
                            break 'batches;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) if err.is_retryable() => {
                    error!(
                        begin_ts = batch.begin_ts,
                        end_ts = batch.end_ts,
                        attempts = attempt + 1,
                        "giving up on batch"
                    );
                    return Err(IngestError::RetriesExhausted {
                        begin_ts: batch.begin_ts,
                        end_ts: batch.end_ts,
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                Err(err) => {
                    return Err(IngestError::Halted {
                        begin_ts: batch.begin_ts,
                        end_ts: batch.end_ts,
                        source: err,
                    });
                }
            }
        }
    }

    info!(
        batches = summary.batches,
        retries = summary.retries,
        cancelled = summary.cancelled,
        last_end_ts = ?summary.last_end_ts,
        "ingestion loop stopped"
    );
    Ok(summary)
}
