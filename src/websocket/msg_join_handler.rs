use tracing::{error, info};

use crate::collab::DocRegistry;
use crate::error::SyncError;
use crate::models::JoinMessage;
use crate::websocket::connctx::{ConnCtx, JoinedDoc};

/// Handle JoinMessage
pub async fn handle_join_message(join_msg: JoinMessage, conn: &mut ConnCtx, registry: &DocRegistry) {
    if join_msg.doc_id.trim().is_empty() || join_msg.user_id.trim().is_empty() {
        conn.send_error(&SyncError::InvalidMessage("join requires docId and userId".to_string()), None);
        return;
    }

    // A connection edits one document at a time.
    if conn.joined().is_some_and(|joined| joined.doc_id != join_msg.doc_id) {
        conn.leave();
    }

    info!(
        "Join request for document {} from user {} on connection {}",
        join_msg.doc_id, join_msg.user_id, conn.id
    );
    match registry
        .attach(&join_msg.doc_id, conn.id, &join_msg.user_id, conn.outbound.clone())
        .await
    {
        Ok((handle, _version)) => conn.set_joined(JoinedDoc {
            doc_id: join_msg.doc_id,
            user_id: join_msg.user_id,
            handle,
        }),
        Err(e) => {
            error!("Failed to join document {}: {}", join_msg.doc_id, e);
            conn.forget();
            conn.send_error(&e, None);
        }
    }
}
