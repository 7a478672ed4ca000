use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub n_docs: u32,
    pub n_active_docs: u32,
    pub n_draining_docs: u32,
    pub n_unavailable_docs: u32,
    pub n_sessions: u32,
    pub n_operations: u64,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
