use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use super::coordinator::{Coordinator, CoordinatorState, CoordinatorStats, DocHandle, DocMap, DocSnapshot, Outbound};
use super::document::Document;
use crate::config::CoordinatorSettings;
use crate::db::OpStore;
use crate::error::SyncError;
use crate::models::AcceptedOperation;

// A coordinator can close between lookup and use; retry with a fresh one.
const MAX_OPEN_ATTEMPTS: usize = 3;

/// Coordinators addressed by document id.
///
/// Coordinators are spawned on first access and remove themselves once their
/// drain grace period elapses.
#[derive(Clone)]
pub struct DocRegistry {
    docs: Arc<DocMap>,
    store: Arc<dyn OpStore>,
    settings: CoordinatorSettings,
    generations: Arc<AtomicU64>,
}

impl DocRegistry {
    pub fn new(store: Arc<dyn OpStore>, settings: CoordinatorSettings) -> Self {
        Self {
            docs: Arc::new(Mutex::new(HashMap::new())),
            store,
            settings,
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    /// Handle of the running coordinator for `doc_id`, spawning one if needed
    pub fn handle(&self, doc_id: &str) -> DocHandle {
        let mut docs = self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = docs.get(doc_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Spawning coordinator for {} (generation {})", doc_id, generation);
        let handle = Coordinator::spawn(
            doc_id,
            generation,
            self.settings,
            self.store.clone(),
            Arc::downgrade(&self.docs),
        );
        docs.insert(doc_id.to_string(), handle.clone());
        handle
    }

    /// Attach a connection to a document, returning the coordinator it
    /// joined and the version reported in `joined`.
    pub async fn attach(
        &self,
        doc_id: &str,
        connection_id: Uuid,
        user_id: &str,
        outbound: Outbound,
    ) -> Result<(DocHandle, u64), SyncError> {
        for _ in 0..MAX_OPEN_ATTEMPTS {
            let handle = self.handle(doc_id);
            match handle.attach(connection_id, user_id, outbound.clone()).await {
                Err(SyncError::CoordinatorClosed) => continue,
                Ok(version) => return Ok((handle, version)),
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::CoordinatorClosed)
    }

    /// Latest state of a document. Documents nobody is editing are replayed
    /// from the store without spawning a coordinator.
    pub async fn snapshot(&self, doc_id: &str) -> Result<DocSnapshot, SyncError> {
        if let Some(handle) = self.loaded(doc_id) {
            match handle.snapshot().await {
                Err(SyncError::CoordinatorClosed) => {}
                other => return other,
            }
        }
        let document = self.read_from_store(doc_id).await?;
        Ok(DocSnapshot {
            doc_id: doc_id.to_string(),
            version: document.version(),
            content: document.content(),
            presence: Vec::new(),
            state: CoordinatorState::Closed,
        })
    }

    /// Operations after `since`, together with the current version
    pub async fn history(&self, doc_id: &str, since: u64) -> Result<(u64, Vec<AcceptedOperation>), SyncError> {
        if let Some(handle) = self.loaded(doc_id) {
            match handle.history(since).await {
                Err(SyncError::CoordinatorClosed) => {}
                other => return other,
            }
        }
        let document = self.read_from_store(doc_id).await?;
        let current = document.version();
        if since > current {
            return Err(SyncError::FutureBaseVersion { base: since, current });
        }
        Ok((current, document.log().since(since).cloned().collect()))
    }

    fn loaded(&self, doc_id: &str) -> Option<DocHandle> {
        let docs = self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        docs.get(doc_id).filter(|h| !h.is_closed()).cloned()
    }

    async fn read_from_store(&self, doc_id: &str) -> Result<Document, SyncError> {
        let records = self.store.load(doc_id).await.map_err(|e| SyncError::DocumentUnavailable {
            doc_id: doc_id.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Serving {} from the store ({} operations)", doc_id, records.len());
        Document::load(doc_id, records)
    }

    /// Stats of every loaded document; documents closing meanwhile are skipped
    pub async fn stats(&self) -> Vec<CoordinatorStats> {
        let handles: Vec<DocHandle> = {
            let docs = self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            docs.values().cloned().collect()
        };
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(s) = handle.stats().await {
                stats.push(s);
            }
        }
        stats.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        stats
    }

    pub fn is_loaded(&self, doc_id: &str) -> bool {
        self.loaded(doc_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
