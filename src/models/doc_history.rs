use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::models::AcceptedOperation;

/// Query parameters for the history endpoint
#[derive(Deserialize, IntoParams)]
pub struct DocumentHistoryQuery {
    /// Return operations with a sequence strictly greater than this version
    pub since: Option<u64>,
}

/// One accepted operation as exposed over HTTP
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHistoryEntry {
    pub sequence: u64,
    pub op_id: Uuid,
    pub author_id: String,
    pub base_version: u64,
    pub timestamp: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    #[schema(value_type = Vec<Object>)]
    pub edits: serde_json::Value,
}

impl From<AcceptedOperation> for DocumentHistoryEntry {
    fn from(accepted: AcceptedOperation) -> Self {
        DocumentHistoryEntry {
            sequence: accepted.sequence,
            op_id: accepted.operation.op_id,
            author_id: accepted.operation.author_id,
            base_version: accepted.operation.base_version,
            timestamp: accepted.operation.timestamp,
            payload: accepted.operation.payload,
            edits: serde_json::to_value(&accepted.edits).unwrap_or_default(),
        }
    }
}

/// Response for the operation history of a document
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHistoryResponse {
    pub doc_id: String,
    pub version: u64,
    pub operations: Vec<DocumentHistoryEntry>,
}
