use crate::{
    collab::CoordinatorState,
    models::{DiagnosticsResponse, ErrorResponse},
    AppState,
};
use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Report loaded documents, sessions and host resource usage
pub async fn diagnostics(
    State(app_state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {
    // Aggregate diagnostics from the registry
    let stats = app_state.registry.stats().await;
    let mut n_active_docs: u32 = 0;
    let mut n_draining_docs: u32 = 0;
    let mut n_unavailable_docs: u32 = 0;
    let mut n_sessions: u32 = 0;
    let mut n_operations: u64 = 0;
    for doc in &stats {
        match doc.state {
            CoordinatorState::Active => n_active_docs += 1,
            CoordinatorState::Draining => n_draining_docs += 1,
            CoordinatorState::Uninitialized | CoordinatorState::Closed => {}
        }
        if !doc.available {
            n_unavailable_docs += 1;
        }
        n_sessions += doc.sessions as u32;
        n_operations += doc.version;
    }

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Docs: {}, Sessions: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.len(),
        n_sessions
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_docs: stats.len() as u32,
            n_active_docs,
            n_draining_docs,
            n_unavailable_docs,
            n_sessions,
            n_operations,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
