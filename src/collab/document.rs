use tracing::debug;

use super::convergence::{ConvergenceEngine, Resolution};
use super::oplog::{Admission, Appended, OperationLog};
use crate::error::SyncError;
use crate::models::{AcceptedOperation, Operation};

/// An operation that passed admission and resolution but is not yet part of
/// the log. The coordinator persists `record` before committing it.
#[derive(Debug)]
pub enum Prepared {
    Duplicate(AcceptedOperation),
    New {
        record: AcceptedOperation,
        resolution: Resolution,
    },
}

/// Materialized document: its operation log plus the replica built from it
#[derive(Debug)]
pub struct Document {
    log: OperationLog,
    engine: ConvergenceEngine,
}

impl Document {
    pub fn new(doc_id: &str) -> Self {
        Self {
            log: OperationLog::new(doc_id),
            engine: ConvergenceEngine::new(),
        }
    }

    /// Rebuild a document by replaying its stored log.
    ///
    /// Every record is resolved again and must reproduce the edits that were
    /// broadcast when it was first accepted.
    pub fn load(doc_id: &str, records: Vec<AcceptedOperation>) -> Result<Self, SyncError> {
        let log = OperationLog::replay(doc_id, records)?;
        let mut engine = ConvergenceEngine::new();
        for record in log.since(0) {
            let resolution = engine.resolve(&record.operation).map_err(|e| SyncError::DocumentUnavailable {
                doc_id: doc_id.to_string(),
                reason: format!("sequence {} no longer resolves: {}", record.sequence, e),
            })?;
            if resolution.edits() != record.edits.as_slice() {
                return Err(SyncError::DocumentUnavailable {
                    doc_id: doc_id.to_string(),
                    reason: format!("sequence {} replays to different edits", record.sequence),
                });
            }
            engine.integrate(record.sequence, &resolution);
        }
        debug!("Replayed {} operations for document {}", log.len(), doc_id);
        Ok(Self { log, engine })
    }

    pub fn doc_id(&self) -> &str {
        self.log.doc_id()
    }

    pub fn version(&self) -> u64 {
        self.log.current_version()
    }

    pub fn content(&self) -> String {
        self.engine.content()
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn prepare(&self, op: Operation) -> Result<Prepared, SyncError> {
        match self.log.admit(&op)? {
            Admission::Duplicate(existing) => return Ok(Prepared::Duplicate(existing)),
            Admission::Stale { base, current } => {
                debug!(
                    "Operation {} on {} is based on version {} of {}; merging",
                    op.op_id,
                    self.doc_id(),
                    base,
                    current
                );
            }
            Admission::Fresh => {}
        }
        let resolution = self.engine.resolve(&op)?;
        let record = AcceptedOperation {
            sequence: self.version() + 1,
            operation: op,
            edits: resolution.edits().to_vec(),
        };
        Ok(Prepared::New { record, resolution })
    }

    pub fn commit(&mut self, record: AcceptedOperation, resolution: &Resolution) -> Result<AcceptedOperation, SyncError> {
        let sequence = record.sequence;
        match self.log.append(record.operation, record.edits)? {
            Appended::Accepted(accepted) => {
                debug_assert_eq!(accepted.sequence, sequence);
                self.engine.integrate(accepted.sequence, resolution);
                Ok(accepted)
            }
            Appended::Duplicate(existing) => Ok(existing),
        }
    }

    /// Admission, resolution and commit in one step, for callers without storage
    pub fn submit(&mut self, op: Operation) -> Result<Appended, SyncError> {
        match self.prepare(op)? {
            Prepared::Duplicate(existing) => Ok(Appended::Duplicate(existing)),
            Prepared::New { record, resolution } => self.commit(record, &resolution).map(Appended::Accepted),
        }
    }
}
