use async_trait::async_trait;

use crate::error::SyncError;
use crate::models::AcceptedOperation;

/// Durable home of every document's operation log.
///
/// Records are appended in sequence order by the single coordinator that owns
/// the document, and loaded back in the same order when a closed document is
/// reopened.
#[async_trait]
pub trait OpStore: Send + Sync {
    async fn load(&self, doc_id: &str) -> Result<Vec<AcceptedOperation>, SyncError>;

    async fn append(&self, doc_id: &str, record: &AcceptedOperation) -> Result<(), SyncError>;
}
