// DD Node Kernel
//
// Data-definition replication for an ingestion node: replays the ordered
// DDL stream, keeps the writable-collection replica, persists definitional
// metadata and hands flush boundaries to compaction.

pub mod config;
pub mod ingest;
pub mod invariants;
pub mod kv;
pub mod log;
pub mod meta;
pub mod msg;
pub mod replay;
pub mod replica;
pub mod state;
