use crate::{
    models::{DocumentLatestResponse, ErrorResponse},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::error;

/// Latest content, version and presence of a document
pub async fn doc_latest(
    State(app_state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
) -> Result<(StatusCode, Json<DocumentLatestResponse>), (StatusCode, Json<ErrorResponse>)> {
    let snapshot = app_state.registry.snapshot(&doc_id).await.map_err(|e| {
        error!("Failed to read document '{}': {}", doc_id, e);
        e
    })?;

    let state = serde_json::to_value(snapshot.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    Ok((
        StatusCode::OK,
        Json(DocumentLatestResponse {
            doc_id: snapshot.doc_id,
            version: snapshot.version,
            content: snapshot.content,
            state,
            presence: snapshot.presence,
        }),
    ))
}
