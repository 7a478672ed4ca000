use std::collections::HashMap;

use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{AcceptedOperation, Edit, Operation};

/// How the log classifies an incoming operation before resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Base version is the current version; no concurrent history to merge.
    Fresh,
    /// Operations were accepted since the base version; the convergence
    /// engine has to position the edit against them.
    Stale { base: u64, current: u64 },
    /// The op id was accepted before; the existing record is returned as is.
    Duplicate(AcceptedOperation),
}

/// Outcome of appending to the log
#[derive(Debug, Clone, PartialEq)]
pub enum Appended {
    Accepted(AcceptedOperation),
    Duplicate(AcceptedOperation),
}

impl Appended {
    pub fn record(&self) -> &AcceptedOperation {
        match self {
            Appended::Accepted(record) | Appended::Duplicate(record) => record,
        }
    }
}

/// Ordered, deduplicated history of accepted operations for one document.
///
/// Entry `i` always carries sequence `i + 1`, so `current_version` equals the
/// number of entries.
#[derive(Debug, Default)]
pub struct OperationLog {
    doc_id: String,
    entries: Vec<AcceptedOperation>,
    index: HashMap<Uuid, usize>,
}

impl OperationLog {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a log from persisted records.
    ///
    /// Records must be contiguous from sequence 1 with unique op ids and
    /// non-future base versions; anything else means the stored log is corrupt.
    pub fn replay(doc_id: &str, records: Vec<AcceptedOperation>) -> Result<Self, SyncError> {
        let mut log = Self::new(doc_id);
        for record in records {
            let expected = log.current_version() + 1;
            let corrupt = |reason: String| SyncError::DocumentUnavailable {
                doc_id: doc_id.to_string(),
                reason,
            };
            if record.sequence != expected {
                return Err(corrupt(format!(
                    "expected sequence {} but found {}",
                    expected, record.sequence
                )));
            }
            if record.operation.base_version >= record.sequence {
                return Err(corrupt(format!(
                    "operation {} at sequence {} has base version {}",
                    record.operation.op_id, record.sequence, record.operation.base_version
                )));
            }
            if log.index.contains_key(&record.operation.op_id) {
                return Err(corrupt(format!("operation {} is stored twice", record.operation.op_id)));
            }
            log.push(record);
        }
        Ok(log)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn current_version(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn get(&self, op_id: &Uuid) -> Option<&AcceptedOperation> {
        self.index.get(op_id).map(|&i| &self.entries[i])
    }

    pub fn admit(&self, op: &Operation) -> Result<Admission, SyncError> {
        if let Some(existing) = self.get(&op.op_id) {
            return Ok(Admission::Duplicate(existing.clone()));
        }
        let current = self.current_version();
        match op.base_version {
            base if base > current => Err(SyncError::FutureBaseVersion { base, current }),
            base if base < current => Ok(Admission::Stale { base, current }),
            _ => Ok(Admission::Fresh),
        }
    }

    /// Record the assigned sequence for an operation and its resolved edits
    pub fn append(&mut self, op: Operation, edits: Vec<Edit>) -> Result<Appended, SyncError> {
        if let Admission::Duplicate(existing) = self.admit(&op)? {
            return Ok(Appended::Duplicate(existing));
        }
        let record = AcceptedOperation {
            sequence: self.current_version() + 1,
            operation: op,
            edits,
        };
        self.push(record.clone());
        Ok(Appended::Accepted(record))
    }

    /// Operations with a sequence strictly greater than `version`, in order
    pub fn since(&self, version: u64) -> Since<'_> {
        let start = (version as usize).min(self.entries.len());
        Since {
            entries: &self.entries[start..],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, record: AcceptedOperation) {
        self.index.insert(record.operation.op_id, self.entries.len());
        self.entries.push(record);
    }
}

/// Restartable view over a suffix of the log.
///
/// Cloning yields a fresh iterator from the same starting point.
#[derive(Debug, Clone)]
pub struct Since<'a> {
    entries: &'a [AcceptedOperation],
}

impl<'a> Iterator for Since<'a> {
    type Item = &'a AcceptedOperation;

    fn next(&mut self) -> Option<Self::Item> {
        let (first, rest) = self.entries.split_first()?;
        self.entries = rest;
        Some(first)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.entries.len(), Some(self.entries.len()))
    }
}

impl ExactSizeIterator for Since<'_> {}
