use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::PresenceEntry;

/// Response for the latest state of a document
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLatestResponse {
    pub doc_id: String,
    pub version: u64,
    pub content: String,
    pub state: String,
    pub presence: Vec<PresenceEntry>,
}
