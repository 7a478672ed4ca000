use crate::{
    models::{DocumentHistoryEntry, DocumentHistoryQuery, DocumentHistoryResponse, ErrorResponse},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Accepted operations of a document after a given version
pub async fn doc_history(
    State(app_state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
    Query(query): Query<DocumentHistoryQuery>,
) -> Result<(StatusCode, Json<DocumentHistoryResponse>), (StatusCode, Json<ErrorResponse>)> {
    let since = query.since.unwrap_or(0);
    let (version, operations) = app_state.registry.history(&doc_id, since).await.map_err(|e| {
        error!("Failed to read history of document '{}' since {}: {}", doc_id, since, e);
        e
    })?;
    debug!("History of '{}' since {}: {} operations", doc_id, since, operations.len());

    Ok((
        StatusCode::OK,
        Json(DocumentHistoryResponse {
            doc_id,
            version,
            operations: operations.into_iter().map(DocumentHistoryEntry::from).collect(),
        }),
    ))
}
