use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ddnode_kernel::config::DdNodeConfig;
use ddnode_kernel::ingest::{run_ingest, IngestSummary};
use ddnode_kernel::kv::{MetaKv, RedbKv};
use ddnode_kernel::msg::{FlushMsg, RawBatch, Timestamp};
use ddnode_kernel::replay::{recover_node, RecoveryReport};
use ddnode_kernel::replica::CollectionView;
use ddnode_kernel::state::{flush_channel, FlushAck};

/// DD Node CLI
#[derive(Parser, Debug)]
#[command(name = "ddnode")]
#[command(about = "Replay a recorded DDL stream through a data-definition node", long_about = None)]
struct Cli {
    /// Path to node config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a JSON array of message batches
    #[arg(long)]
    batches: PathBuf,

    /// Path to a JSON array of flush events
    #[arg(long)]
    flushes: Option<PathBuf>,

    /// Overrides `meta_root_path` from the config
    #[arg(long)]
    root: Option<PathBuf>,
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    recovery: RecoveryReport,
    summary: IngestSummary,
    collections: Vec<CollectionView>,
    acks: Vec<FlushAck>,
    pending_flushes: usize,
    checkpoint_ts: Option<Timestamp>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let mut config = match &cli.config {
        Some(path) => read_json::<DdNodeConfig>(path)?,
        None => DdNodeConfig::default(),
    };
    if let Some(root) = cli.root {
        config.meta_root_path = root;
    }
    config.validate()?;

    // ----------------------------
    // Load recorded input
    // ----------------------------
    let raw_batches: Vec<RawBatch> = read_json(&cli.batches)?;
    let flushes: Vec<FlushMsg> = match &cli.flushes {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };

    // ----------------------------
    // Recover node from durable store
    // ----------------------------
    let kv: Arc<dyn MetaKv> = Arc::new(RedbKv::open_in(&config.meta_root_path)?);
    let (flush_tx, flush_rx) = flush_channel(config.flush_channel_capacity);
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<FlushAck>();
    let (mut node, recovery) = recover_node(config.clone(), kv, flush_rx, ack_tx)?;

    let resume_after = recovery.resume_ts;
    info!(
        root = %config.meta_root_path.display(),
        resume_ts = ?resume_after,
        "node recovered"
    );

    // ----------------------------
    // Producers
    // ----------------------------
    let flush_producer = tokio::spawn(async move {
        for flush in flushes {
            if flush_tx.send(flush).await.is_err() {
                warn!("flush channel closed before all events were sent");
                break;
            }
        }
    });

    let (batch_tx, mut batch_rx) = mpsc::channel(16);
    let batch_producer = tokio::spawn(async move {
        for mut raw in raw_batches {
            // everything at or before the checkpoint is already durable
            if let Some(resume) = resume_after {
                if raw.end_ts <= resume {
                    continue;
                }
                raw.begin_ts = raw.begin_ts.max(resume);
            }
            if batch_tx.send(raw.decode()).await.is_err() {
                break;
            }
        }
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        });
    }

    // ----------------------------
    // Drive ingestion
    // ----------------------------
    let summary = run_ingest(&mut node, &mut batch_rx, &cancel).await?;
    batch_rx.close();
    batch_producer.await?;
    if !flush_producer.is_finished() {
        warn!("flush events left unsent after the last batch");
        flush_producer.abort();
    }

    let mut acks = Vec::new();
    while let Ok(ack) = ack_rx.try_recv() {
        acks.push(ack);
    }

    // ----------------------------
    // Output
    // ----------------------------
    let output = CliOutput {
        recovery,
        summary,
        collections: node.replica().view(),
        acks,
        pending_flushes: node.pending_flushes(),
        checkpoint_ts: node.checkpoint_ts(),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
