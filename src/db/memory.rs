use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::OpStore;
use crate::error::SyncError;
use crate::models::AcceptedOperation;

/// Process-local store, used when no database is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryOpStore {
    logs: RwLock<HashMap<String, Vec<AcceptedOperation>>>,
}

impl MemoryOpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a document's stored log wholesale
    pub async fn seed(&self, doc_id: &str, records: Vec<AcceptedOperation>) {
        self.logs.write().await.insert(doc_id.to_string(), records);
    }
}

#[async_trait]
impl OpStore for MemoryOpStore {
    async fn load(&self, doc_id: &str) -> Result<Vec<AcceptedOperation>, SyncError> {
        Ok(self.logs.read().await.get(doc_id).cloned().unwrap_or_default())
    }

    async fn append(&self, doc_id: &str, record: &AcceptedOperation) -> Result<(), SyncError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(doc_id.to_string()).or_default();
        let expected = log.len() as u64 + 1;
        if record.sequence != expected {
            return Err(SyncError::Storage(format!(
                "document {} expected sequence {} but got {}",
                doc_id, expected, record.sequence
            )));
        }
        log.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edit, Operation};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn record(sequence: u64) -> AcceptedOperation {
        AcceptedOperation {
            sequence,
            operation: Operation {
                op_id: Uuid::new_v4(),
                doc_id: "doc".into(),
                author_id: "alice".into(),
                base_version: sequence - 1,
                payload: json!({"kind": "insert", "position": 0, "text": "x"}),
                timestamp: Utc::now(),
            },
            edits: vec![Edit::Insert { position: 0, text: "x".into() }],
        }
    }

    #[tokio::test]
    async fn appends_in_sequence_order() {
        let store = MemoryOpStore::new();
        store.append("doc", &record(1)).await.unwrap();
        store.append("doc", &record(2)).await.unwrap();
        assert!(store.append("doc", &record(4)).await.is_err());
        let loaded = store.load("doc").await.unwrap();
        assert_eq!(loaded.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.load("other").await.unwrap().is_empty());
    }
}
