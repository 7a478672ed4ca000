use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready", body = ReadyResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Loaded documents, sessions and host resource usage
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics snapshot", body = DiagnosticsResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// Latest state of a document
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}",
    params(
        ("doc_id" = String, Path, description = "Document identifier")
    ),
    responses(
        (status = 200, description = "Latest content, version and presence", body = DocumentLatestResponse),
        (status = 503, description = "Document log cannot be replayed", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn doc_latest_doc() {}

/// Accepted operations of a document
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}/history",
    params(
        ("doc_id" = String, Path, description = "Document identifier"),
        DocumentHistoryQuery
    ),
    responses(
        (status = 200, description = "Operations with a sequence above `since`", body = DocumentHistoryResponse),
        (status = 409, description = "`since` is ahead of the document", body = ErrorResponse),
        (status = 503, description = "Document log cannot be replayed", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn doc_history_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        doc_latest_doc,
        doc_history_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            DiagnosticsResponse,
            DocumentLatestResponse,
            DocumentHistoryResponse,
            DocumentHistoryEntry,
            PresenceEntry,
            PresenceStatus,
            ErrorResponse
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
