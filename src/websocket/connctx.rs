use tracing::debug;
use uuid::Uuid;

use crate::collab::{DocHandle, Outbound};
use crate::error::SyncError;
use crate::models::ServerMessage;

/// The document a connection has joined
#[derive(Clone, Debug)]
pub struct JoinedDoc {
    pub doc_id: String,
    pub user_id: String,
    pub handle: DocHandle,
}

/// State of one WebSocket connection.
///
/// Dropping the context detaches the connection from its document, so every
/// way a socket can end (close frame, error, task abort) releases the
/// session.
#[derive(Debug)]
pub struct ConnCtx {
    pub id: Uuid,
    pub outbound: Outbound,
    joined: Option<JoinedDoc>,
}

impl ConnCtx {
    pub fn new(id: Uuid, outbound: Outbound) -> Self {
        Self {
            id,
            outbound,
            joined: None,
        }
    }

    pub fn joined(&self) -> Option<&JoinedDoc> {
        self.joined.as_ref()
    }

    /// The joined document if it matches `doc_id`
    pub fn joined_to(&self, doc_id: &str) -> Result<&JoinedDoc, SyncError> {
        self.joined
            .as_ref()
            .filter(|joined| joined.doc_id == doc_id)
            .ok_or(SyncError::StaleSession)
    }

    pub fn set_joined(&mut self, joined: JoinedDoc) {
        self.joined = Some(joined);
    }

    /// Detach from the current document, if any
    pub fn leave(&mut self) -> Option<JoinedDoc> {
        let joined = self.joined.take()?;
        if joined.handle.detach(self.id).is_err() {
            debug!("Document {} closed before connection {} left", joined.doc_id, self.id);
        }
        Some(joined)
    }

    /// Forget the joined document without notifying its coordinator
    pub fn forget(&mut self) {
        self.joined = None;
    }

    pub fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!("Outbound queue of connection {} is closed", self.id);
        }
    }

    pub fn send_error(&self, err: &SyncError, op_id: Option<Uuid>) {
        self.send(ServerMessage::error(err, op_id));
    }
}

impl Drop for ConnCtx {
    fn drop(&mut self) {
        self.leave();
    }
}
