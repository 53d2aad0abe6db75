// Invariant Framework
//
// Invariants are pure rules that must hold across every replica
// transition. The state machine and recovery replay evaluate them after
// each applied record, before the transition is committed.

use crate::log::{DdlOp, DdlRecord};
use crate::replica::Replica;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, previous: &Replica, record: &DdlRecord, next: &Replica) -> InvariantResult;
}

/// Every partition in the replica has a live parent collection.
pub struct PartitionsHaveLiveParent;

impl Invariant for PartitionsHaveLiveParent {
    fn name(&self) -> &'static str {
        "partitions-have-live-parent"
    }

    fn validate(&self, _previous: &Replica, _record: &DdlRecord, next: &Replica) -> InvariantResult {
        let dangling = next.dangling_partitions();
        if dangling.is_empty() {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail(format!("dangling partitions {dangling:?}"))
        }
    }
}

/// The replica after a record reflects what the record says happened.
pub struct RecordReflectedInReplica;

impl Invariant for RecordReflectedInReplica {
    fn name(&self) -> &'static str {
        "record-reflected-in-replica"
    }

    fn validate(&self, _previous: &Replica, record: &DdlRecord, next: &Replica) -> InvariantResult {
        let ok = match &record.op {
            DdlOp::CreateCollection { collection_id, .. } => next.has_collection(*collection_id),
            DdlOp::DropCollection { collection_id, .. } => {
                !next.has_collection(*collection_id) && next.partitions_of(*collection_id).is_empty()
            }
            DdlOp::CreatePartition {
                collection_id,
                partition_id,
                ..
            } => next.has_partition(*collection_id, *partition_id),
            DdlOp::DropPartition {
                collection_id,
                partition_id,
                ..
            } => !next.has_partition(*collection_id, *partition_id),
        };

        if ok {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail(format!(
                "record at ts {} ({:?}) not reflected",
                record.timestamp, record.op
            ))
        }
    }
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.invariants.iter().map(|i| i.name()).collect();
        f.debug_struct("InvariantEngine")
            .field("invariants", &names)
            .finish()
    }
}

impl InvariantEngine {
    /// Create a new invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with the built-in replica invariants registered.
    pub fn with_defaults() -> Self {
        let mut engine = Self::new();
        engine.register(PartitionsHaveLiveParent);
        engine.register(RecordReflectedInReplica);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: &Replica,
        record: &DdlRecord,
        next: &Replica,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, record, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}
